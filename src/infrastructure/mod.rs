pub mod adapter_factory;
pub mod adapters;
