// Shared fakes for router, registry and datafeed tests.

pub mod fake_adapter;

pub use fake_adapter::FakeAdapter;
