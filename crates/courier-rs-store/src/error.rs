//! Error types for shared store operations.

/// Errors returned by shared store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A key holds a value of a different kind than the operation expects.
    #[error("wrong type for key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },
}
