//! Core module - subscription bookkeeping, dispatch and routing.
//!
//! This module contains the heart of agentbus:
//! - Subscription registry with broker-level deduplication
//! - Inbound dispatcher
//! - Router tying both to a broker adapter

pub mod dispatcher;
pub mod registry;
pub mod router;

pub use dispatcher::{DeliverySink, DispatchOutcome, DispatchStats, Dispatcher};
pub use registry::{BrokerPlan, SubscriptionRegistry};
pub use router::Router;
