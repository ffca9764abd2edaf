//! Infrastructure layer
//!
//! Implementations of the domain ports plus process-level concerns:
//! configuration loading, logging setup, in-memory stores, and the
//! mock provider used by tests.

pub mod config;
pub mod logging;
pub mod providers;
pub mod store;
