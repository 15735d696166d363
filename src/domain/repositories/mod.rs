pub mod provider_adapter;
pub mod snapshot_store;
