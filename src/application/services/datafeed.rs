//! Datafeed
//!
//! The facade a charting front end talks to: symbol search and resolution,
//! history pages and live bar subscriptions keyed by a caller-chosen
//! listener id.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::services::price_feed_bridge::PriceFeedBridge;
use crate::application::services::subscription_registry::SubscriptionRegistry;
use crate::application::services::symbol_router::SymbolRouter;
use crate::domain::entities::instrument::Instrument;
use crate::domain::errors::MarketDataError;
use crate::domain::repositories::provider_adapter::{HistoryRequest, TickSink};
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::{ChannelKey, ListenerId};
use crate::domain::value_objects::period::{Period, Timespan};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VenueDescriptor {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatafeedConfiguration {
    pub supported_resolutions: Vec<String>,
    pub venues: Vec<VenueDescriptor>,
    pub supports_search: bool,
}

/// One page of history. `next_cursor` is passed back as
/// [`HistoryRequest::cursor`] to load the page before this one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    pub bars: Vec<Bar>,
    pub next_cursor: Option<i64>,
    pub no_data: bool,
}

pub struct Datafeed {
    router: Arc<SymbolRouter>,
    registry: Arc<SubscriptionRegistry>,
    bridge: Option<Arc<PriceFeedBridge>>,
    resolutions: Vec<Period>,
}

impl Datafeed {
    pub fn new(router: Arc<SymbolRouter>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            router,
            registry,
            bridge: None,
            resolutions: default_resolutions(),
        }
    }

    /// Routes every subscribed channel's prices into the ledger.
    pub fn with_bridge(mut self, bridge: Arc<PriceFeedBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn router(&self) -> &Arc<SymbolRouter> {
        &self.router
    }

    pub fn on_ready(&self) -> DatafeedConfiguration {
        DatafeedConfiguration {
            supported_resolutions: self.resolutions.iter().map(Period::text).collect(),
            venues: self
                .router
                .venues()
                .into_iter()
                .map(|venue| VenueDescriptor {
                    code: venue.code().to_string(),
                    name: venue.name().to_string(),
                })
                .collect(),
            supports_search: true,
        }
    }

    /// Never fails: venues that error contribute nothing.
    pub async fn search_symbols(&self, query: &str) -> Vec<Instrument> {
        self.router.search_symbols(query).await
    }

    pub async fn resolve_symbol(&self, id: &str) -> Result<Instrument, MarketDataError> {
        self.router.resolve_symbol(id).await
    }

    pub async fn get_history_kline_data(
        &self,
        symbol: &str,
        period: Period,
        request: &HistoryRequest,
    ) -> Result<HistoryPage, MarketDataError> {
        let instrument = self.router.resolve_symbol(symbol).await?;
        let adapter = self
            .router
            .adapter(instrument.venue)
            .ok_or_else(|| MarketDataError::NotFound(instrument.canonical_id()))?;

        let bars = adapter
            .get_history_bars(&instrument, period, request)
            .await?;
        debug!(
            "History {} {} returned {} bar(s)",
            instrument.canonical_id(),
            period,
            bars.len()
        );
        Ok(HistoryPage {
            next_cursor: bars.first().map(|bar| bar.timestamp),
            no_data: bars.is_empty(),
            bars,
        })
    }

    /// Streams `symbol` at `period` to `on_tick` under `listener`. A listener
    /// that was already streaming something else is moved over.
    pub async fn subscribe(
        &self,
        symbol: &str,
        period: Period,
        on_tick: TickSink,
        listener: ListenerId,
    ) -> Result<ChannelKey, MarketDataError> {
        let instrument = self.router.resolve_symbol(symbol).await?;
        let adapter = self
            .router
            .adapter(instrument.venue)
            .ok_or_else(|| MarketDataError::NotFound(instrument.canonical_id()))?;

        let channel = ChannelKey::new(instrument.venue, instrument.symbol.clone(), period);
        let previous = self.registry.channel_of(&listener).await;
        info!("Listener {} subscribing to {}", listener, channel);
        self.registry
            .subscribe(listener, channel.clone(), adapter, on_tick)
            .await;
        // Registered after the registry so a concurrent release of the same
        // channel cannot drop the mapping of a live subscription.
        if let Some(bridge) = &self.bridge {
            bridge.register(&channel, &instrument);
        }
        if let Some(previous) = previous.filter(|previous| *previous != channel) {
            self.forget_if_idle(&previous).await;
        }
        Ok(channel)
    }

    pub async fn unsubscribe(&self, listener: &ListenerId) -> bool {
        let channel = self.registry.channel_of(listener).await;
        let removed = self.registry.unsubscribe(listener).await;
        match channel {
            Some(channel) if removed => self.forget_if_idle(&channel).await,
            _ => debug!("Unsubscribe for unknown listener {}", listener),
        }
        removed
    }

    /// Drops the bridge mapping of a channel nobody listens to anymore.
    async fn forget_if_idle(&self, channel: &ChannelKey) {
        if let Some(bridge) = &self.bridge {
            if self.registry.listener_count(channel).await == 0 {
                bridge.unregister(channel);
            }
        }
    }

    /// Opens every adapter's connection.
    pub async fn connect_all(&self) {
        for adapter in self.router.adapters() {
            if let Err(e) = adapter.connect().await {
                warn!("Failed to start {} adapter: {}", adapter.venue(), e);
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for adapter in self.router.adapters() {
            adapter.disconnect().await;
        }
    }
}

fn default_resolutions() -> Vec<Period> {
    [
        (1, Timespan::Minute),
        (5, Timespan::Minute),
        (15, Timespan::Minute),
        (30, Timespan::Minute),
        (1, Timespan::Hour),
        (4, Timespan::Hour),
        (1, Timespan::Day),
        (1, Timespan::Week),
        (1, Timespan::Month),
    ]
    .into_iter()
    .filter_map(|(multiplier, timespan)| Period::new(multiplier, timespan).ok())
    .collect()
}
