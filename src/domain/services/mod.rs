pub mod candle_builder;
pub mod clock;
pub mod events;
pub mod ledger;
