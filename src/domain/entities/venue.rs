use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::errors::ValidationError;

/// Upstream market-data venues with a dedicated adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Okx,
    Binance,
    Polygon,
}

impl Venue {
    pub const ALL: [Venue; 3] = [Venue::Okx, Venue::Binance, Venue::Polygon];

    pub fn name(&self) -> &'static str {
        match self {
            Venue::Okx => "okx",
            Venue::Binance => "binance",
            Venue::Polygon => "polygon",
        }
    }

    /// Upper-case code used as the prefix of canonical identifiers (`OKX:BTC-USDT`).
    pub fn code(&self) -> &'static str {
        match self {
            Venue::Okx => "OKX",
            Venue::Binance => "BINANCE",
            Venue::Polygon => "POLYGON",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Venue {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OKX" | "OKEX" => Ok(Venue::Okx),
            "BINANCE" => Ok(Venue::Binance),
            "POLYGON" | "POLYGON.IO" => Ok(Venue::Polygon),
            other => Err(ValidationError::InvalidSymbol(format!(
                "unknown venue code '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_code() {
        assert_eq!(Venue::Okx.code(), "OKX");
        assert_eq!(Venue::Binance.code(), "BINANCE");
        assert_eq!(Venue::Polygon.code(), "POLYGON");
    }

    #[test]
    fn test_venue_from_str_is_case_insensitive() {
        assert_eq!("okx".parse::<Venue>().unwrap(), Venue::Okx);
        assert_eq!("Binance".parse::<Venue>().unwrap(), Venue::Binance);
        assert_eq!("polygon.io".parse::<Venue>().unwrap(), Venue::Polygon);
    }

    #[test]
    fn test_venue_from_str_unknown() {
        assert!("kraken".parse::<Venue>().is_err());
    }
}
