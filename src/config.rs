use std::str::FromStr;
use std::time::Duration;

use crate::domain::entities::venue::Venue;
use crate::domain::services::ledger::LedgerConfig;
use crate::infrastructure::adapters::AdapterSettings;

/// Runtime configuration for the market-data layer, the simulated broker
/// and the HTTP surface.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub okx_ws_url: String,
    pub okx_rest_url: String,
    pub binance_ws_url: String,
    pub binance_rest_url: String,
    pub polygon_ws_url: String,
    pub polygon_rest_url: String,
    /// Polygon is only wired when a key is configured.
    pub polygon_api_key: Option<String>,

    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub history_limit: usize,

    /// Adapter used when a symbol carries no venue prefix and no naming hint applies.
    pub default_venue: Venue,
    pub resolve_cache_size: usize,
    /// Symbols whose ticks feed the ledger from startup, e.g. `OKX:BTC-USDT`.
    pub watchlist: Vec<String>,

    pub identity: String,
    pub fill_latency: Duration,
    pub settlement_asset: String,
    pub default_leverage: f64,
    pub taker_fee_rate: f64,
    pub maintenance_margin_rate: f64,

    pub database_url: String,
    pub bind_address: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            okx_ws_url: "wss://ws.okx.com:8443/ws/v5/business".to_string(),
            okx_rest_url: "https://www.okx.com".to_string(),
            binance_ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            binance_rest_url: "https://api.binance.com".to_string(),
            polygon_ws_url: "wss://socket.polygon.io/stocks".to_string(),
            polygon_rest_url: "https://api.polygon.io".to_string(),
            polygon_api_key: None,

            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            history_limit: 300,

            default_venue: Venue::Okx,
            resolve_cache_size: 256,
            watchlist: vec!["OKX:BTC-USDT".to_string(), "OKX:ETH-USDT".to_string()],

            identity: "default".to_string(),
            fill_latency: Duration::from_millis(500),
            settlement_asset: "USDT".to_string(),
            default_leverage: 1.0,
            taker_fee_rate: 0.0,
            maintenance_margin_rate: 0.005,

            database_url: "sqlite://data/ledger.db".to_string(),
            bind_address: "127.0.0.1:3000".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, keeping the default for
    /// anything missing or invalid.
    pub fn from_env() -> AppConfig {
        let mut config = AppConfig::default();

        read_string("OKX_WS_URL", &mut config.okx_ws_url);
        read_string("OKX_REST_URL", &mut config.okx_rest_url);
        read_string("BINANCE_WS_URL", &mut config.binance_ws_url);
        read_string("BINANCE_REST_URL", &mut config.binance_rest_url);
        read_string("POLYGON_WS_URL", &mut config.polygon_ws_url);
        read_string("POLYGON_REST_URL", &mut config.polygon_rest_url);
        if let Ok(key) = std::env::var("POLYGON_API_KEY") {
            let key = key.trim();
            if !key.is_empty() {
                config.polygon_api_key = Some(key.to_string());
            }
        }

        read_millis("RECONNECT_DELAY_MS", &mut config.reconnect_delay);
        read_millis("HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval);
        read_millis("CONNECT_TIMEOUT_MS", &mut config.connect_timeout);
        read_millis("FILL_LATENCY_MS", &mut config.fill_latency);
        read_parsed("HISTORY_LIMIT", &mut config.history_limit, |v| *v > 0);
        read_parsed("RESOLVE_CACHE_SIZE", &mut config.resolve_cache_size, |v| *v > 0);

        read_parsed("DEFAULT_VENUE", &mut config.default_venue, |_| true);
        if let Ok(watchlist) = std::env::var("WATCHLIST") {
            config.watchlist = watchlist
                .split(',')
                .map(str::trim)
                .filter(|symbol| !symbol.is_empty())
                .map(str::to_string)
                .collect();
        }

        read_string("LEDGER_IDENTITY", &mut config.identity);
        read_string("SETTLEMENT_ASSET", &mut config.settlement_asset);
        config.settlement_asset = config.settlement_asset.to_ascii_uppercase();
        read_parsed("DEFAULT_LEVERAGE", &mut config.default_leverage, |v| {
            v.is_finite() && *v >= 1.0
        });
        read_parsed("TAKER_FEE_RATE", &mut config.taker_fee_rate, |v| {
            (0.0..0.1).contains(v)
        });
        read_parsed(
            "MAINTENANCE_MARGIN_RATE",
            &mut config.maintenance_margin_rate,
            |v| (0.0..1.0).contains(v),
        );

        read_string("DATABASE_URL", &mut config.database_url);
        read_string("BIND_ADDRESS", &mut config.bind_address);

        config
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            settlement_asset: self.settlement_asset.clone(),
            default_leverage: self.default_leverage,
            taker_fee_rate: self.taker_fee_rate,
            maintenance_margin_rate: self.maintenance_margin_rate,
        }
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            reconnect_delay: self.reconnect_delay,
            heartbeat_interval: self.heartbeat_interval,
            connect_timeout: self.connect_timeout,
            history_limit: self.history_limit,
        }
    }
}

fn read_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        let value = value.trim();
        if value.is_empty() {
            tracing::warn!("Ignoring empty {}, using default: {}", name, target);
        } else {
            *target = value.to_string();
        }
    }
}

fn read_millis(name: &str, target: &mut Duration) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<u64>() {
            Ok(0) => tracing::warn!("Invalid {} value: 0, using default: {:?}", name, target),
            Ok(millis) => *target = Duration::from_millis(millis),
            Err(e) => tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {:?}",
                name,
                raw,
                e,
                target
            ),
        }
    }
}

fn read_parsed<T>(name: &str, target: &mut T, valid: impl Fn(&T) -> bool)
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) if valid(&value) => *target = value,
            Ok(value) => tracing::warn!(
                "Invalid {} value: {:?}, using default: {:?}",
                name,
                value,
                target
            ),
            Err(e) => tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {:?}",
                name,
                raw,
                e,
                target
            ),
        }
    }
}
