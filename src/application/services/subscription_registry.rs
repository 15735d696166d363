//! Subscription Registry
//!
//! Reference-counts logical subscriptions. Any number of listeners may share
//! one channel; the adapter sees one subscribe when the first listener
//! arrives and one unsubscribe when the last one leaves. The listener map is
//! the only source of truth for what should be on the wire.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::repositories::provider_adapter::{ProviderAdapter, TickSink};
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::{ChannelKey, ListenerId};

type Listeners = Arc<RwLock<BTreeMap<ListenerId, TickSink>>>;

struct Registration {
    channel: ChannelKey,
    adapter: Arc<dyn ProviderAdapter>,
}

struct Fanout {
    listeners: Listeners,
}

#[derive(Default)]
struct RegistryState {
    registrations: HashMap<ListenerId, Registration>,
    channels: HashMap<ChannelKey, Fanout>,
}

pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    /// Sees every tick of every channel before the listeners do.
    tap: Option<TickSink>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            tap: None,
        }
    }

    pub fn with_tap(tap: TickSink) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            tap: Some(tap),
        }
    }

    /// Maps `listener` to `channel`. A listener that was already mapped is
    /// released from its previous channel first.
    pub async fn subscribe(
        &self,
        listener: ListenerId,
        channel: ChannelKey,
        adapter: Arc<dyn ProviderAdapter>,
        on_tick: TickSink,
    ) {
        let mut state = self.state.lock().await;

        let same_channel = state
            .registrations
            .get(&listener)
            .is_some_and(|existing| existing.channel == channel);
        if same_channel {
            if let Some(fanout) = state.channels.get(&channel) {
                if let Ok(mut listeners) = fanout.listeners.write() {
                    listeners.insert(listener.clone(), on_tick);
                }
            }
            debug!("Listener {} replaced its callback on {}", listener, channel);
            return;
        }
        Self::release(&mut state, &listener);

        match state.channels.get(&channel) {
            Some(fanout) => {
                if let Ok(mut listeners) = fanout.listeners.write() {
                    listeners.insert(listener.clone(), on_tick);
                }
                debug!("Listener {} joined existing channel {}", listener, channel);
            }
            None => {
                let listeners: Listeners = Arc::new(RwLock::new(BTreeMap::new()));
                if let Ok(mut map) = listeners.write() {
                    map.insert(listener.clone(), on_tick);
                }
                info!("First listener on {}, subscribing", channel);
                adapter.subscribe(channel.clone(), self.fanout_sink(listeners.clone()));
                state.channels.insert(channel.clone(), Fanout { listeners });
            }
        }

        state
            .registrations
            .insert(listener, Registration { channel, adapter });
    }

    /// Removes `listener`. Returns false if it was not registered.
    pub async fn unsubscribe(&self, listener: &ListenerId) -> bool {
        let mut state = self.state.lock().await;
        Self::release(&mut state, listener)
    }

    pub async fn channel_of(&self, listener: &ListenerId) -> Option<ChannelKey> {
        let state = self.state.lock().await;
        state
            .registrations
            .get(listener)
            .map(|registration| registration.channel.clone())
    }

    pub async fn listener_count(&self, channel: &ChannelKey) -> usize {
        let state = self.state.lock().await;
        state
            .channels
            .get(channel)
            .and_then(|fanout| fanout.listeners.read().ok().map(|map| map.len()))
            .unwrap_or(0)
    }

    pub async fn active_channels(&self) -> Vec<ChannelKey> {
        let state = self.state.lock().await;
        let mut channels: Vec<ChannelKey> = state.channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    fn release(state: &mut RegistryState, listener: &ListenerId) -> bool {
        let Some(Registration { channel, adapter }) = state.registrations.remove(listener) else {
            return false;
        };

        let now_empty = match state.channels.get(&channel) {
            Some(fanout) => match fanout.listeners.write() {
                Ok(mut listeners) => {
                    listeners.remove(listener);
                    listeners.is_empty()
                }
                Err(_) => true,
            },
            None => false,
        };
        if now_empty {
            state.channels.remove(&channel);
            info!("Last listener left {}, unsubscribing", channel);
            adapter.unsubscribe(&channel);
        } else {
            debug!("Listener {} left {}", listener, channel);
        }
        true
    }

    fn fanout_sink(&self, listeners: Listeners) -> TickSink {
        let tap = self.tap.clone();
        Arc::new(move |channel: &ChannelKey, bar: &Bar| {
            if let Some(tap) = &tap {
                tap(channel, bar);
            }
            // Clone out so a callback may (un)subscribe without deadlocking.
            let sinks: Vec<TickSink> = match listeners.read() {
                Ok(map) => map.values().cloned().collect(),
                Err(_) => return,
            };
            for sink in sinks {
                sink(channel, bar);
            }
        })
    }
}
