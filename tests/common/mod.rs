//! Common test utilities for connection integration tests.

pub mod mock_transport;

pub use mock_transport::{MockServer, MockTransport};
