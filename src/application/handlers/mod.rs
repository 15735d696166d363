pub mod api;

pub use api::{router, ApiState};
