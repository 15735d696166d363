pub mod bar;
pub mod channel;
pub mod period;
pub mod price;
