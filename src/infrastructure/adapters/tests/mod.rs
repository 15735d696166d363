// In-process venue server and adapter connection tests.

pub mod mock_venue_server;
pub mod venue_adapter_tests;

pub use mock_venue_server::MockVenueServer;
