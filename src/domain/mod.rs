//! Domain layer: models, ports, and errors.
//!
//! Everything here is transport- and storage-agnostic. Services borrow
//! these types; infrastructure implements the ports.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{OrchestratorError, OrchestratorResult};
