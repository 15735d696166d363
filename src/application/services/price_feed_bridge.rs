//! Feeds last-trade prices from adapter ticks into the ledger.
//!
//! The registry calls the bridge's tap for every tick of every channel. The
//! bridge maps the channel to the instrument's ledger symbol and posts the
//! bar close to the broker mailbox without waiting.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::application::actors::broker_actor::BrokerHandle;
use crate::domain::entities::instrument::Instrument;
use crate::domain::repositories::provider_adapter::TickSink;
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;

pub struct PriceFeedBridge {
    broker: BrokerHandle,
    symbols: RwLock<HashMap<ChannelKey, String>>,
}

impl PriceFeedBridge {
    pub fn new(broker: BrokerHandle) -> Arc<Self> {
        Arc::new(Self {
            broker,
            symbols: RwLock::new(HashMap::new()),
        })
    }

    /// Remembers which ledger symbol a channel prices.
    pub fn register(&self, channel: &ChannelKey, instrument: &Instrument) {
        if let Ok(mut symbols) = self.symbols.write() {
            if symbols
                .insert(channel.clone(), instrument.ledger_symbol())
                .is_none()
            {
                debug!("{} prices {}", channel, instrument.ledger_symbol());
            }
        }
    }

    /// Forgets a channel once its last listener is gone.
    pub fn unregister(&self, channel: &ChannelKey) {
        if let Ok(mut symbols) = self.symbols.write() {
            if let Some(symbol) = symbols.remove(channel) {
                debug!("{} no longer prices {}", channel, symbol);
            }
        }
    }

    pub fn ledger_symbol(&self, channel: &ChannelKey) -> Option<String> {
        self.symbols
            .read()
            .ok()
            .and_then(|symbols| symbols.get(channel).cloned())
    }

    pub fn on_tick(&self, channel: &ChannelKey, bar: &Bar) {
        match self.ledger_symbol(channel) {
            Some(symbol) => self.broker.post_price(&symbol, bar.close),
            None => debug!("Tick on unregistered channel {}", channel),
        }
    }

    /// Sink suitable for [`SubscriptionRegistry::with_tap`].
    ///
    /// [`SubscriptionRegistry::with_tap`]: crate::application::services::subscription_registry::SubscriptionRegistry::with_tap
    pub fn tap(self: &Arc<Self>) -> TickSink {
        let bridge = Arc::clone(self);
        Arc::new(move |channel: &ChannelKey, bar: &Bar| bridge.on_tick(channel, bar))
    }
}
