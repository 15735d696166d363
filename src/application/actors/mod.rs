pub mod broker_actor;

pub use broker_actor::{BrokerActor, BrokerHandle, BrokerSettings};
