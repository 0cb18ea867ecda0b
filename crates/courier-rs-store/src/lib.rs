//! Shared key-value store capability used for cross-node coordination.

pub mod error;
pub mod memory;
pub mod store;

/// Store error type.
pub use error::StoreError;
/// In-process store for single-node deployments and tests.
pub use memory::MemoryStore;
/// Store capability interface.
pub use store::{ScoredMember, SharedStore};
