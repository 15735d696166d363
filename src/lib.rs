//! Market Ledger Library
//!
//! Multi-venue market data (OKX, Binance, Polygon) behind one charting
//! datafeed, and a simulated brokerage ledger marked to the streamed prices.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
