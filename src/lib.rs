//! agentbus library root.
//!
//! Typed publish/subscribe routing between agents over a pluggable broker.

pub mod brokers;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod protocol;

pub use brokers::{create_adapter, BrokerAdapter, SubscriptionHandle};
pub use cli::Commands;
pub use config::{load_settings, load_settings_or_default, Settings};
pub use crate::core::{DispatchOutcome, Dispatcher, Router, SubscriptionRegistry};
pub use error::{Error, Result};
pub use protocol::{Agent, ChannelAddress, Message, MessageCatalog, MessageContext, MessageSet, MessageType, Pattern, RouteTable};
