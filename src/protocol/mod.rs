//! Message protocol for agentbus.
//!
//! This module defines everything that is independent of routing state:
//! - Channel naming and the channel codec
//! - Subscription patterns and wildcard matching
//! - Typed message contract and the message catalog
//! - Agent contract
//! - Forwarding rules between patterns

pub mod agent;
pub mod channel;
pub mod message;
pub mod pattern;
pub mod routes;

pub use agent::{validate_declarations, validate_outgoing, Agent, MessageContext};
pub use channel::{ChannelAddress, DIRECTION_REQUEST, DIRECTION_RESPONSE, SEPARATOR, WILDCARD};
pub use message::{Message, MessageCatalog, MessageSet, MessageType, TYPE_TAG};
pub use pattern::{Pattern, Segment};
pub use routes::RouteTable;
