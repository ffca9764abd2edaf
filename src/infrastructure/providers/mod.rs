//! Provider implementations.
//!
//! Real transports live outside this crate behind the `Provider`
//! port; the mock ships in-tree for tests and local development.

pub mod mock;

pub use mock::{shared, MockOutcome, MockProvider};
