//! Channel naming: `TypeName:direction:session`.
//!
//! A channel is the broker-level address a message travels on. The codec here
//! is the only place that knows the separator and token order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between channel tokens.
pub const SEPARATOR: char = ':';

/// Reserved token matching any value in a pattern position.
pub const WILDCARD: &str = "*";

/// Direction used for requests.
pub const DIRECTION_REQUEST: &str = "request";

/// Direction used for responses.
pub const DIRECTION_RESPONSE: &str = "response";

/// Structured channel address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelAddress {
    pub type_name: String,
    pub direction: String,
    pub session_id: String,
}

impl ChannelAddress {
    /// Build an address, validating every token.
    pub fn new(
        type_name: impl Into<String>,
        direction: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Self> {
        let address = Self {
            type_name: type_name.into(),
            direction: direction.into(),
            session_id: session_id.into(),
        };
        address.validate()?;
        Ok(address)
    }

    /// Canonical string form.
    pub fn encode(&self) -> String {
        format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.type_name, self.direction, self.session_id
        )
    }

    /// True when no position holds the wildcard token, i.e. the address can
    /// be published to.
    pub fn is_concrete(&self) -> bool {
        self.tokens().iter().all(|t| *t != WILDCARD)
    }

    /// Same conversation, opposite leg.
    pub fn with_direction(&self, direction: impl Into<String>) -> Result<Self> {
        Self::new(self.type_name.clone(), direction, self.session_id.clone())
    }

    pub fn tokens(&self) -> [&str; 3] {
        [&self.type_name, &self.direction, &self.session_id]
    }

    fn validate(&self) -> Result<()> {
        if self.tokens().iter().all(|t| is_valid_token(t)) {
            Ok(())
        } else {
            Err(Error::invalid_channel(self.encode()))
        }
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ChannelAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode(s)
    }
}

/// A token is non-empty and free of the separator. No trimming or case
/// normalization is applied.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty() && !token.contains(SEPARATOR)
}

/// Encode three tokens into a channel string.
pub fn encode(type_name: &str, direction: &str, session_id: &str) -> Result<String> {
    Ok(ChannelAddress::new(type_name, direction, session_id)?.encode())
}

/// Decode a channel string into its address.
pub fn decode(channel: &str) -> Result<ChannelAddress> {
    let parts: Vec<&str> = channel.split(SEPARATOR).collect();
    match parts.as_slice() {
        [type_name, direction, session_id]
            if parts.iter().all(|p| !p.is_empty()) =>
        {
            Ok(ChannelAddress {
                type_name: type_name.to_string(),
                direction: direction.to_string(),
                session_id: session_id.to_string(),
            })
        }
        _ => Err(Error::invalid_channel(channel)),
    }
}

/// Check a channel string without keeping the result.
pub fn is_valid_channel(channel: &str) -> bool {
    decode(channel).is_ok()
}

/// Session token of a concrete channel; `None` for wildcards or bad input.
pub fn session_of(channel: &str) -> Option<String> {
    decode(channel)
        .ok()
        .map(|a| a.session_id)
        .filter(|s| s != WILDCARD)
}

/// Response channel paired with a request channel.
pub fn response_channel(request_channel: &str) -> Result<String> {
    Ok(decode(request_channel)?
        .with_direction(DIRECTION_RESPONSE)?
        .encode())
}
