//! Venue adapters: one websocket connection task per venue, driven by a
//! venue-specific [`protocol::VenueProtocol`].

pub mod binance;
pub mod okx;
pub mod polygon;
pub mod protocol;
pub mod venue_adapter;

#[cfg(test)]
mod tests;

pub use binance::BinanceProtocol;
pub use okx::OkxProtocol;
pub use polygon::PolygonProtocol;
pub use venue_adapter::{AdapterSettings, VenueAdapter};
