//! Venue wire protocol seam.
//!
//! A [`VenueProtocol`] is pure: it builds outgoing frames and URLs and decodes
//! incoming payloads, and never touches a socket. The generic
//! [`VenueAdapter`](super::venue_adapter::VenueAdapter) drives the connection
//! and asks the protocol what to send.

use serde_json::Value;

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::venue::Venue;
use crate::domain::errors::MarketDataError;
use crate::domain::repositories::provider_adapter::HistoryRequest;
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;
use crate::domain::value_objects::period::Period;

/// A bar tagged with the wire topic it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBar {
    pub topic: String,
    pub bar: Bar,
}

/// Decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Bars(Vec<TopicBar>),
    AuthSuccess,
    AuthFailed(String),
    /// Error reported by the venue itself, e.g. a rejected subscription.
    VenueError(String),
    Pong,
    /// Acknowledgements, status chatter and anything else without payload.
    Ignored,
}

pub trait VenueProtocol: Send + Sync + 'static {
    fn venue(&self) -> Venue;

    fn websocket_url(&self) -> &str;

    /// Wire topic carrying `channel`. Distinct channels may share a topic.
    fn topic(&self, channel: &ChannelKey) -> String;

    /// Period actually streamed for a channel of `period`. When it differs,
    /// the adapter rolls streamed bars up into `period`.
    fn stream_period(&self, period: Period) -> Period {
        period
    }

    /// One batched subscribe frame for `topics`.
    fn subscribe_message(&self, topics: &[String]) -> String;

    fn unsubscribe_message(&self, topics: &[String]) -> String;

    /// Frame sent right after the socket opens. While one is configured, no
    /// subscribe traffic is sent until the venue confirms it.
    fn auth_message(&self) -> Option<String> {
        None
    }

    /// Text heartbeat sent on a fixed interval while the socket is open.
    fn heartbeat_message(&self) -> Option<String> {
        None
    }

    fn parse_frame(&self, text: &str) -> Result<InboundFrame, MarketDataError>;

    /// Venue-native spelling of a user-supplied symbol.
    fn native_symbol(&self, symbol: &str) -> String {
        symbol.trim().to_ascii_uppercase()
    }

    fn resolve_url(&self, symbol: &str) -> String;

    fn parse_resolve(&self, symbol: &str, body: &Value) -> Result<Instrument, MarketDataError>;

    fn search_url(&self, query: &str) -> String;

    fn parse_search(&self, query: &str, body: &Value) -> Result<Vec<Instrument>, MarketDataError>;

    /// URL for bars of `instrument` in `[from, to]` (epoch ms).
    fn history_url(
        &self,
        instrument: &Instrument,
        period: Period,
        window: HistoryWindow,
    ) -> Result<String, MarketDataError>;

    fn parse_history(&self, body: &Value) -> Result<Vec<Bar>, MarketDataError>;
}

/// Concrete bounds of one history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub from: i64,
    pub to: i64,
    pub limit: usize,
}

impl HistoryWindow {
    /// Fills in what the caller left open: `to` defaults to `now_ms`, `from`
    /// to `limit` periods before `to`.
    pub fn resolve(request: &HistoryRequest, period: Period, now_ms: i64, limit: usize) -> Self {
        let limit = request.limit.unwrap_or(limit).max(1);
        let to = request.end().unwrap_or(now_ms);
        let from = request
            .from
            .filter(|from| *from < to)
            .unwrap_or_else(|| to - period.millis() * limit as i64);
        Self { from, to, limit }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.from && timestamp <= self.to
    }
}

/// Reads a JSON number that venues send either as a number or a string.
pub(crate) fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Decimal places implied by a tick size such as `"0.01"`.
pub(crate) fn precision_from_tick(tick: &str) -> u32 {
    match tick.trim_end_matches('0').split_once('.') {
        Some((_, decimals)) => decimals.len() as u32,
        None => 0,
    }
}
