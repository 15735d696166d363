//! Adapter Factory
//!
//! Builds one adapter per configured venue. Adapters are created once at
//! startup and shared between the symbol router, the subscription registry
//! and the price feed bridge.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::domain::entities::venue::Venue;
use crate::domain::repositories::provider_adapter::ProviderAdapter;
use crate::infrastructure::adapters::{
    BinanceProtocol, OkxProtocol, PolygonProtocol, VenueAdapter,
};

pub struct AdapterFactory;

impl AdapterFactory {
    /// Create every adapter the configuration allows. Polygon needs an API
    /// key and is skipped without one.
    pub fn create_all(config: &AppConfig) -> BTreeMap<Venue, Arc<dyn ProviderAdapter>> {
        let mut adapters: BTreeMap<Venue, Arc<dyn ProviderAdapter>> = BTreeMap::new();
        let settings = config.adapter_settings();

        adapters.insert(
            Venue::Okx,
            Arc::new(VenueAdapter::new(
                OkxProtocol::new(&config.okx_ws_url, &config.okx_rest_url),
                settings.clone(),
            )),
        );
        adapters.insert(
            Venue::Binance,
            Arc::new(VenueAdapter::new(
                BinanceProtocol::new(&config.binance_ws_url, &config.binance_rest_url),
                settings.clone(),
            )),
        );

        match &config.polygon_api_key {
            Some(api_key) => {
                adapters.insert(
                    Venue::Polygon,
                    Arc::new(VenueAdapter::new(
                        PolygonProtocol::new(
                            &config.polygon_ws_url,
                            &config.polygon_rest_url,
                            api_key,
                        ),
                        settings,
                    )),
                );
            }
            None => warn!("POLYGON_API_KEY not set, stock data from Polygon is disabled"),
        }

        info!(
            "AdapterFactory created {} adapter(s): {}",
            adapters.len(),
            adapters
                .keys()
                .map(|venue| venue.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        adapters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_requires_api_key() {
        let adapters = AdapterFactory::create_all(&AppConfig::default());
        assert!(adapters.contains_key(&Venue::Okx));
        assert!(adapters.contains_key(&Venue::Binance));
        assert!(!adapters.contains_key(&Venue::Polygon));

        let config = AppConfig {
            polygon_api_key: Some("KEY".to_string()),
            ..AppConfig::default()
        };
        let adapters = AdapterFactory::create_all(&config);
        assert_eq!(adapters.len(), 3);
        assert_eq!(adapters[&Venue::Polygon].venue(), Venue::Polygon);
    }
}
