//! Integration test crate for the Arxen DHT.
//!
//! This crate has no library code. It only contains integration tests that
//! run several nodes over loopback UDP and exercise lookups, storage and
//! failure handling end to end.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p arxen-integration-tests
//! ```
