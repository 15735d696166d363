//! Symbol Router
//!
//! Picks the adapter that owns a symbol and fans resolve / search requests
//! out across every adapter. Resolved instruments are kept in an LRU cache.

use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::entities::instrument::{AssetClass, Instrument, SymbolQuery};
use crate::domain::entities::venue::Venue;
use crate::domain::errors::MarketDataError;
use crate::domain::repositories::provider_adapter::ProviderAdapter;

const DEFAULT_CACHE_CAPACITY: usize = 256;

pub struct SymbolRouter {
    adapters: BTreeMap<Venue, Arc<dyn ProviderAdapter>>,
    default_venue: Venue,
    cache: Mutex<LruCache<String, Instrument>>,
}

impl SymbolRouter {
    pub fn new(
        adapters: BTreeMap<Venue, Arc<dyn ProviderAdapter>>,
        default_venue: Venue,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity)
            .or(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            adapters,
            default_venue,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn venues(&self) -> Vec<Venue> {
        self.adapters.keys().copied().collect()
    }

    pub fn adapter(&self, venue: Venue) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&venue).cloned()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.adapters.values()
    }

    /// Venue that owns `id`: an explicit venue prefix wins, then naming
    /// conventions, then the configured default.
    pub fn select_venue(&self, id: &str) -> Option<Venue> {
        let query = SymbolQuery::parse(id);
        let preferred = query.venue.or_else(|| {
            if query.asset_class == Some(AssetClass::Stock) {
                Some(Venue::Polygon)
            } else if query.symbol.contains('-') {
                Some(Venue::Okx)
            } else {
                None
            }
        });

        preferred
            .filter(|venue| self.adapters.contains_key(venue))
            .or_else(|| {
                self.adapters
                    .contains_key(&self.default_venue)
                    .then_some(self.default_venue)
            })
            .or_else(|| self.adapters.keys().next().copied())
    }

    pub fn select(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.select_venue(id).and_then(|venue| self.adapter(venue))
    }

    /// Resolves `id` to an instrument. A venue-prefixed id only asks that
    /// venue; otherwise every adapter is asked at once and the first success
    /// wins. When nothing resolves, every adapter's reason is reported.
    pub async fn resolve_symbol(&self, id: &str) -> Result<Instrument, MarketDataError> {
        let key = id.trim().to_ascii_uppercase();
        if let Some(instrument) = self.cache.lock().await.get(&key) {
            debug!("Resolved {} from cache", key);
            return Ok(instrument.clone());
        }

        let query = SymbolQuery::parse(id);
        if query.symbol.is_empty() {
            return Err(MarketDataError::NotFound(id.to_string()));
        }

        let candidates: Vec<Arc<dyn ProviderAdapter>> = match query.venue {
            Some(venue) => match self.adapter(venue) {
                Some(adapter) => vec![adapter],
                None => {
                    return Err(MarketDataError::NotFound(format!(
                        "{} (venue {} is not configured)",
                        id, venue
                    )))
                }
            },
            None => self.adapters.values().cloned().collect(),
        };

        let mut pending: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|adapter| {
                let symbol = query.symbol.clone();
                async move {
                    let venue = adapter.venue();
                    (venue, adapter.resolve_symbol(&symbol).await)
                }
            })
            .collect();

        let mut reasons = Vec::new();
        while let Some((venue, result)) = pending.next().await {
            match result {
                Ok(instrument) if query.asset_class.map_or(true, |class| class == instrument.asset_class) => {
                    info!("Resolved {} via {} as {}", id, venue.name(), instrument.canonical_id());
                    let mut cache = self.cache.lock().await;
                    cache.put(key, instrument.clone());
                    cache.put(instrument.canonical_id(), instrument.clone());
                    return Ok(instrument);
                }
                Ok(instrument) => reasons.push(format!(
                    "{}: {} is not a {:?} instrument",
                    venue.name(),
                    instrument.symbol,
                    query.asset_class
                )),
                Err(e) => {
                    debug!("{} could not resolve {}: {}", venue.name(), id, e);
                    reasons.push(format!("{}: {}", venue.name(), e));
                }
            }
        }

        warn!("No venue resolved {}", id);
        reasons.sort();
        Err(MarketDataError::AggregatedNotFound {
            symbol: id.trim().to_string(),
            reasons,
        })
    }

    /// Searches every adapter and merges the results. Duplicates by
    /// canonical id keep the later adapter's entry. A failing adapter
    /// contributes nothing.
    pub async fn search_symbols(&self, query: &str) -> Vec<Instrument> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        let results = join_all(self.adapters.values().map(|adapter| async move {
            (adapter.venue(), adapter.search_symbols(query).await)
        }))
        .await;

        let mut merged: Vec<Instrument> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (venue, result) in results {
            match result {
                Ok(instruments) => {
                    for instrument in instruments {
                        let id = instrument.canonical_id();
                        match index.get(&id) {
                            Some(&position) => merged[position] = instrument,
                            None => {
                                index.insert(id, merged.len());
                                merged.push(instrument);
                            }
                        }
                    }
                }
                Err(e) => warn!("Search for '{}' failed on {}: {}", query, venue.name(), e),
            }
        }
        debug!("Search '{}' matched {} instrument(s)", query, merged.len());
        merged
    }
}
