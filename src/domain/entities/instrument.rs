use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::venue::Venue;
use crate::domain::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Crypto,
    Stock,
}

impl FromStr for AssetClass {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "crypto" | "spot" | "swap" => Ok(AssetClass::Crypto),
            "stock" | "stocks" | "equity" => Ok(AssetClass::Stock),
            other => Err(ValidationError::InvalidSymbol(format!(
                "unknown asset class '{other}'"
            ))),
        }
    }
}

/// A resolved tradable instrument. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub venue: Venue,
    /// Venue-native symbol (`BTC-USDT` on OKX, `BTCUSDT` on Binance, `AAPL` on Polygon).
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub asset_class: AssetClass,
    pub name: String,
    pub price_precision: u32,
}

impl Instrument {
    pub fn new(
        venue: Venue,
        symbol: impl Into<String>,
        base: impl Into<String>,
        quote: impl Into<String>,
        asset_class: AssetClass,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            venue,
            name: symbol.clone(),
            symbol,
            base: base.into(),
            quote: quote.into(),
            asset_class,
            price_precision: 2,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_price_precision(mut self, precision: u32) -> Self {
        self.price_precision = precision;
        self
    }

    /// `VENUE:SYMBOL`, unique across venues.
    pub fn canonical_id(&self) -> String {
        format!("{}:{}", self.venue.code(), self.symbol)
    }

    /// `BASE-QUOTE`, the key the ledger uses for prices and positions.
    pub fn ledger_symbol(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }
}

/// A parsed symbol request: optional venue code, optional asset-class hint,
/// and the bare symbol. `OKX:BTC-USDT`, `STOCK:AAPL` and `ETHUSDT` are all
/// valid inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolQuery {
    pub venue: Option<Venue>,
    pub asset_class: Option<AssetClass>,
    pub symbol: String,
}

impl SymbolQuery {
    pub fn parse(id: &str) -> Self {
        let id = id.trim();
        if let Some((prefix, rest)) = id.split_once(':') {
            if let Ok(venue) = prefix.parse::<Venue>() {
                return Self {
                    venue: Some(venue),
                    asset_class: None,
                    symbol: rest.trim().to_ascii_uppercase(),
                };
            }
            if let Ok(asset_class) = prefix.parse::<AssetClass>() {
                return Self {
                    venue: None,
                    asset_class: Some(asset_class),
                    symbol: rest.trim().to_ascii_uppercase(),
                };
            }
        }
        Self {
            venue: None,
            asset_class: None,
            symbol: id.to_ascii_uppercase(),
        }
    }

    pub fn with_asset_class(mut self, asset_class: AssetClass) -> Self {
        self.asset_class = Some(asset_class);
        self
    }
}
