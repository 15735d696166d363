use serde::{Deserialize, Serialize};

use crate::domain::entities::venue::Venue;
use crate::domain::value_objects::period::Period;

/// Identity of one logical live stream: venue + venue-native symbol + period.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub venue: Venue,
    pub symbol: String,
    pub period: Period,
}

impl ChannelKey {
    pub fn new(venue: Venue, symbol: impl Into<String>, period: Period) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
            period,
        }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.venue.code(), self.symbol, self.period)
    }
}

/// Opaque caller-supplied handle for one logical subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(String);

impl ListenerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ListenerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
