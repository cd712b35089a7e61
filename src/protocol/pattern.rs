//! Subscription patterns: channel templates with wildcard positions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::channel::{self, ChannelAddress, SEPARATOR, WILDCARD};
use crate::error::{Error, Result};

/// One position of a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    /// Matches any token.
    Any,
    /// Matches exactly this token.
    Exact(String),
}

impl Segment {
    fn parse(token: &str) -> Self {
        if token == WILDCARD {
            Segment::Any
        } else {
            Segment::Exact(token.to_string())
        }
    }

    fn matches(&self, token: &str) -> bool {
        match self {
            Segment::Any => true,
            Segment::Exact(expected) => expected == token,
        }
    }

    /// Some token satisfies both segments.
    fn intersects(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Exact(a), Segment::Exact(b)) => a == b,
            _ => true,
        }
    }

    /// Every token matched by `other` is matched by `self`.
    fn contains(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Any, _) => true,
            (Segment::Exact(_), Segment::Any) => false,
            (Segment::Exact(a), Segment::Exact(b)) => a == b,
        }
    }

    pub fn as_token(&self) -> &str {
        match self {
            Segment::Any => WILDCARD,
            Segment::Exact(token) => token,
        }
    }
}

/// Three-position channel template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pattern {
    segments: [Segment; 3],
}

impl Pattern {
    /// Build from raw tokens; `*` in any position is a wildcard.
    pub fn new(type_name: &str, direction: &str, session_id: &str) -> Result<Self> {
        let address = ChannelAddress::new(type_name, direction, session_id)?;
        Ok(Self::from_address(&address))
    }

    /// Pattern matching every channel of one message type.
    pub fn broadcast(type_name: &str) -> Result<Self> {
        Self::new(type_name, WILDCARD, WILDCARD)
    }

    /// Pattern matching every channel of one session, any type or direction.
    pub fn session(session_id: &str) -> Result<Self> {
        Self::new(WILDCARD, WILDCARD, session_id)
    }

    /// Pattern matching exactly one concrete address.
    pub fn from_address(address: &ChannelAddress) -> Self {
        let [t, d, s] = address.tokens();
        Self {
            segments: [Segment::parse(t), Segment::parse(d), Segment::parse(s)],
        }
    }

    pub fn parse(pattern: &str) -> Result<Self> {
        Ok(Self::from_address(&channel::decode(pattern)?))
    }

    pub fn segments(&self) -> &[Segment; 3] {
        &self.segments
    }

    /// Type-name position, `None` when wildcarded.
    pub fn type_name(&self) -> Option<&str> {
        match &self.segments[0] {
            Segment::Any => None,
            Segment::Exact(name) => Some(name),
        }
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments.iter().any(|s| *s == Segment::Any)
    }

    /// Position-wise match against an address.
    pub fn matches(&self, address: &ChannelAddress) -> bool {
        self.segments
            .iter()
            .zip(address.tokens())
            .all(|(segment, token)| segment.matches(token))
    }

    /// Match against a raw channel string; malformed channels never match.
    pub fn matches_channel(&self, channel: &str) -> bool {
        channel::decode(channel)
            .map(|address| self.matches(&address))
            .unwrap_or(false)
    }

    /// Some address matches both patterns.
    pub fn overlaps(&self, other: &Pattern) -> bool {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a.intersects(b))
    }

    /// Every address matching `other` also matches `self`.
    pub fn covers(&self, other: &Pattern) -> bool {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a.contains(b))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [t, d, s] = &self.segments;
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            t.as_token(),
            d.as_token(),
            s.as_token()
        )
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pattern::parse(s)
    }
}

/// String-level convenience: does `channel` match `pattern`?
pub fn matches(pattern: &str, channel: &str) -> bool {
    Pattern::parse(pattern)
        .map(|p| p.matches_channel(channel))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Pattern {
        Pattern::parse(s).unwrap()
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches("Pay:*:*", "Pay:request:s456"));
        assert!(!matches("Pay:*:*", "Other:request:s456"));
        assert!(matches("*:*:s456", "Other:response:s456"));
        assert!(!matches("*:*:s456", "Other:response:s457"));
        assert!(matches("Pay:request:s1", "Pay:request:s1"));
        assert!(!matches("Pay:request:s1", "Pay:response:s1"));
    }

    #[test]
    fn test_malformed_never_matches() {
        assert!(!matches("Pay:*:*", "Pay:request"));
        assert!(!matches("Pay:*", "Pay:request:s1"));
        assert!(!matches("Pay:*:*", "Pay:a:b:c"));
    }

    #[test]
    fn test_wildcard_is_whole_token_only() {
        // `P*` is an exact token, not a prefix glob.
        assert!(!matches("P*:*:*", "Pay:request:s1"));
        assert!(matches("P*:*:*", "P*:request:s1"));
    }

    #[test]
    fn test_overlap() {
        assert!(p("A:*:s1").overlaps(&p("A:req:*")));
        assert!(p("*:*:*").overlaps(&p("B:x:y")));
        assert!(!p("A:*:*").overlaps(&p("B:*:*")));
        assert!(!p("A:req:*").overlaps(&p("A:resp:*")));
    }

    #[test]
    fn test_covers() {
        assert!(p("A:*:*").covers(&p("A:req:*")));
        assert!(p("A:*:*").covers(&p("A:*:*")));
        assert!(!p("A:req:*").covers(&p("A:*:*")));
        assert!(!p("A:*:s1").covers(&p("A:req:*")));
        assert!(p("*:*:*").covers(&p("Z:z:z")));
    }

    #[test]
    fn test_display_and_builders() {
        assert_eq!(Pattern::broadcast("Pay").unwrap().to_string(), "Pay:*:*");
        assert_eq!(Pattern::session("s1").unwrap().to_string(), "*:*:s1");
        assert_eq!(p("Pay:*:*").type_name(), Some("Pay"));
        assert_eq!(p("*:*:s1").type_name(), None);
        assert!(Pattern::new("", "*", "*").is_err());
    }
}
