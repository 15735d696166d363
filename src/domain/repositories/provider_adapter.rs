//! Provider Adapter Trait
//!
//! Common interface of every upstream market-data venue. An adapter owns its
//! websocket connection; callers only ever talk in [`ChannelKey`]s and get
//! bars back through a [`TickSink`].
//!
//! Transport failures never cross this boundary as errors from
//! `subscribe`/`unsubscribe`: they are reported on the [`AdapterEvent`]
//! stream and the adapter recovers on its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::venue::Venue;
use crate::domain::errors::MarketDataError;
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;
use crate::domain::value_objects::period::Period;

/// Receiver of streamed bars for one channel. Called from the adapter's
/// connection task, so it must not block.
pub type TickSink = Arc<dyn Fn(&ChannelKey, &Bar) + Send + Sync>;

/// Parameters of a history request. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
    #[serde(default)]
    pub first_data_request: bool,
    /// Opaque paging cursor; for every venue here, the timestamp before which
    /// older bars are wanted.
    #[serde(default)]
    pub cursor: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryRequest {
    /// Upper bound of the window: the cursor wins over `to`.
    pub fn end(&self) -> Option<i64> {
        self.cursor.or(self.to)
    }
}

/// Connection lifecycle and failure notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum AdapterEvent {
    Connected { venue: Venue },
    Authenticated { venue: Venue },
    Disconnected { venue: Venue, reason: String },
    ReconnectScheduled { venue: Venue, delay_ms: u64, attempt: u32 },
    Error { venue: Venue, message: String },
}

impl AdapterEvent {
    pub fn reconnect_scheduled(venue: Venue, delay: Duration, attempt: u32) -> Self {
        AdapterEvent::ReconnectScheduled {
            venue,
            delay_ms: delay.as_millis() as u64,
            attempt,
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    /// Starts the connection task, or forces an immediate reconnect if it is
    /// already running. Returns once the request is queued, not once the
    /// socket is open.
    async fn connect(&self) -> Result<(), MarketDataError>;

    /// Stops the connection task. Channels registered afterwards are kept and
    /// replayed if the adapter is connected again.
    async fn disconnect(&self);

    async fn resolve_symbol(&self, symbol: &str) -> Result<Instrument, MarketDataError>;

    async fn search_symbols(&self, query: &str) -> Result<Vec<Instrument>, MarketDataError>;

    async fn get_history_bars(
        &self,
        instrument: &Instrument,
        period: Period,
        request: &HistoryRequest,
    ) -> Result<Vec<Bar>, MarketDataError>;

    /// Registers `sink` for `channel` and sends a wire subscribe if the socket
    /// is up. Replaces any previous sink for the same channel.
    fn subscribe(&self, channel: ChannelKey, sink: TickSink);

    /// Drops the sink for `channel` and sends a wire unsubscribe if no other
    /// channel still needs the same wire topic.
    fn unsubscribe(&self, channel: &ChannelKey);

    fn events(&self) -> broadcast::Receiver<AdapterEvent>;
}
