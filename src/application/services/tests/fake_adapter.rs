use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::entities::instrument::{AssetClass, Instrument};
use crate::domain::entities::venue::Venue;
use crate::domain::errors::MarketDataError;
use crate::domain::repositories::provider_adapter::{
    AdapterEvent, HistoryRequest, ProviderAdapter, TickSink,
};
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;
use crate::domain::value_objects::period::Period;

/// In-memory adapter that records every wire-level call it would make.
pub struct FakeAdapter {
    venue: Venue,
    instruments: Vec<Instrument>,
    bars: Vec<Bar>,
    search_error: Option<MarketDataError>,
    resolve_delay: Duration,
    wire: Mutex<Vec<String>>,
    sinks: Mutex<HashMap<ChannelKey, TickSink>>,
    resolves: AtomicUsize,
    connects: AtomicUsize,
    events: broadcast::Sender<AdapterEvent>,
}

impl FakeAdapter {
    pub fn new(venue: Venue) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            venue,
            instruments: Vec::new(),
            bars: Vec::new(),
            search_error: None,
            resolve_delay: Duration::ZERO,
            wire: Mutex::new(Vec::new()),
            sinks: Mutex::new(HashMap::new()),
            resolves: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            events,
        }
    }

    pub fn with_instrument(mut self, symbol: &str, base: &str, quote: &str) -> Self {
        let asset_class = if self.venue == Venue::Polygon {
            AssetClass::Stock
        } else {
            AssetClass::Crypto
        };
        self.instruments
            .push(Instrument::new(self.venue, symbol, base, quote, asset_class));
        self
    }

    pub fn with_listing(mut self, instrument: Instrument) -> Self {
        self.instruments.push(instrument);
        self
    }

    pub fn with_bars(mut self, bars: Vec<Bar>) -> Self {
        self.bars = bars;
        self
    }

    pub fn with_search_error(mut self, error: MarketDataError) -> Self {
        self.search_error = Some(error);
        self
    }

    pub fn with_resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = delay;
        self
    }

    /// `subscribe <channel>` / `unsubscribe <channel>` in call order.
    pub fn wire_calls(&self) -> Vec<String> {
        self.wire.lock().unwrap().clone()
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Delivers `bar` the way the connection task would.
    pub fn push(&self, channel: &ChannelKey, bar: Bar) -> bool {
        let sink = self.sinks.lock().unwrap().get(channel).cloned();
        match sink {
            Some(sink) => {
                sink(channel, &bar);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn connect(&self) -> Result<(), MarketDataError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn resolve_symbol(&self, symbol: &str) -> Result<Instrument, MarketDataError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if !self.resolve_delay.is_zero() {
            tokio::time::sleep(self.resolve_delay).await;
        }
        let symbol = symbol.to_ascii_uppercase();
        self.instruments
            .iter()
            .find(|instrument| instrument.symbol == symbol)
            .cloned()
            .ok_or_else(|| MarketDataError::NotFound(format!("{}: {}", self.venue, symbol)))
    }

    async fn search_symbols(&self, query: &str) -> Result<Vec<Instrument>, MarketDataError> {
        if let Some(error) = &self.search_error {
            return Err(error.clone());
        }
        let query = query.to_ascii_uppercase();
        Ok(self
            .instruments
            .iter()
            .filter(|instrument| instrument.symbol.contains(&query))
            .cloned()
            .collect())
    }

    async fn get_history_bars(
        &self,
        _instrument: &Instrument,
        _period: Period,
        request: &HistoryRequest,
    ) -> Result<Vec<Bar>, MarketDataError> {
        let end = request.end().unwrap_or(i64::MAX);
        Ok(self
            .bars
            .iter()
            .filter(|bar| request.from.map_or(true, |from| bar.timestamp >= from))
            .filter(|bar| bar.timestamp < end)
            .copied()
            .collect())
    }

    fn subscribe(&self, channel: ChannelKey, sink: TickSink) {
        self.wire.lock().unwrap().push(format!("subscribe {}", channel));
        self.sinks.lock().unwrap().insert(channel, sink);
    }

    fn unsubscribe(&self, channel: &ChannelKey) {
        self.wire.lock().unwrap().push(format!("unsubscribe {}", channel));
        self.sinks.lock().unwrap().remove(channel);
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}
