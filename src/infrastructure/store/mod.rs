//! Store implementations for the task and workflow ports.

pub mod memory;

pub use memory::{MemoryTaskStore, MemoryWorkflowStore};
