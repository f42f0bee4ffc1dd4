//! Shared test doubles for the gateway's upstream and exchange plumbing.
//!
//! [`MockUpstreamServer`] stands in for an exchange's WebSocket endpoint so
//! `UpstreamSession` can be driven through connect/subscribe/stream/backfill
//! without a network dependency; [`TestConnector`] is a minimal
//! `ExchangeConnector` that talks the mock server's own wire format.

pub mod mock_upstream;
pub mod test_connector;

pub use mock_upstream::{MockUpstreamConnection, MockUpstreamServer};
pub use test_connector::{BackfillOutcome, TestConnector, TEST_CONTRACT_TYPES};
