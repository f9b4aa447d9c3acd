// aw-test-utils: shared test utilities for the realtime client.
//
// Provides an in-process mock broker (a WebSocket server speaking the wire
// protocol) so connection, channel, and codec behavior can be exercised
// end-to-end without a real deployment.

pub mod mock_broker;

pub use mock_broker::{AckMode, BrokerConfig, MockBroker};
