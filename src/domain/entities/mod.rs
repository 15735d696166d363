pub mod account;
pub mod execution;
pub mod instrument;
pub mod order;
pub mod position;
pub mod venue;
