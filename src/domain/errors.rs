use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::persistence::PersistenceError;

/// Failures of the market-data layer: adapters, router and datafeed.
///
/// Transport and parse failures never cross the adapter boundary as panics;
/// adapters publish them on their event stream and the datafeed degrades
/// them to empty results where the caller only needs a best effort answer.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum MarketDataError {
    #[error("Symbol not found: {0}")]
    NotFound(String),

    #[error("Symbol {symbol} could not be resolved by any venue: {}", reasons.join("; "))]
    AggregatedNotFound { symbol: String, reasons: Vec<String> },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to parse venue payload: {0}")]
    Parse(String),

    #[error("Not supported by venue: {0}")]
    Unsupported(String),

    #[error("Adapter task is no longer running")]
    AdapterClosed,
}

impl From<reqwest::Error> for MarketDataError {
    fn from(e: reqwest::Error) -> Self {
        MarketDataError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(e: serde_json::Error) -> Self {
        MarketDataError::Parse(e.to_string())
    }
}

/// Business-rule violations reported synchronously by the ledger.
///
/// A rejected operation leaves the ledger untouched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Invalid amount {amount} for {asset}: must be a positive finite number")]
    InvalidAmount { asset: String, amount: f64 },

    #[error("Insufficient {asset} funds: requested {requested}, free {available}")]
    InsufficientFunds {
        asset: String,
        requested: f64,
        available: f64,
    },

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Order not found: {0}")]
    OrderNotFound(u64),

    #[error("Order {id} is {status} and can no longer change")]
    OrderNotWorking { id: u64, status: String },

    #[error("Position not found: {0}")]
    PositionNotFound(u64),

    #[error("No reference price known for {0}")]
    NoReferencePrice(String),
}

impl From<ValidationError> for LedgerError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::InvalidPrice(msg) => LedgerError::InvalidPrice(msg),
            ValidationError::InvalidQuantity(msg) => LedgerError::InvalidQuantity(msg),
            other => LedgerError::InvalidOrder(other.to_string()),
        }
    }
}

/// Errors surfaced by the broker actor handle.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Broker is not connected")]
    NotConnected,

    #[error("Broker channel closed: {0}")]
    ChannelClosed(String),

    #[error("No response received from broker actor")]
    NoResponse,

    #[error("Timeout waiting for broker actor")]
    Timeout,
}

impl<T> From<mpsc::error::SendError<T>> for BrokerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        BrokerError::ChannelClosed(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Value must be finite")]
    MustBeFinite,
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregated_not_found_lists_every_reason() {
        let error = MarketDataError::AggregatedNotFound {
            symbol: "XYZ".to_string(),
            reasons: vec!["okx: not listed".to_string(), "binance: not listed".to_string()],
        };
        let message = error.to_string();
        assert!(message.contains("XYZ"));
        assert!(message.contains("okx: not listed; binance: not listed"));
    }

    #[test]
    fn test_insufficient_funds_display() {
        let error = LedgerError::InsufficientFunds {
            asset: "USDT".to_string(),
            requested: 200000.0,
            available: 10000.0,
        };
        assert_eq!(
            error.to_string(),
            "Insufficient USDT funds: requested 200000, free 10000"
        );
    }

    #[test]
    fn test_validation_error_maps_into_ledger_error() {
        let error: LedgerError = ValidationError::InvalidQuantity("zero".to_string()).into();
        assert_eq!(error, LedgerError::InvalidQuantity("zero".to_string()));
    }

    #[test]
    fn test_market_data_error_serializes_with_tag() {
        let json = serde_json::to_value(MarketDataError::NotFound("AAPL".to_string())).unwrap();
        assert_eq!(json["type"], "NotFound");
        assert_eq!(json["message"], "AAPL");
    }
}
