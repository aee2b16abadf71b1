//! Error taxonomy shared by every operation.
//!
//! Validation failures are raised synchronously, before an operation touches
//! any state it owns. Backend unavailability is never an error; it only
//! surfaces here when a backend was explicitly mandated through
//! [`BackendConfig`](crate::backend::BackendConfig).

use thiserror::Error;

/// Errors produced by tensor construction, operation validation and backend
/// execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Wrong element type (or a type-level rank requirement), e.g. non-integer
    /// embedding indices.
    #[error("type mismatch in {op}: expected {expected}, got {actual}")]
    Type {
        /// Operation or constructor that rejected the input.
        op: &'static str,
        /// Human readable description of the accepted type.
        expected: String,
        /// Description of the type that was supplied.
        actual: String,
    },

    /// Rank or dimension mismatch between cooperating tensors.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Invalid epsilon for a mandated backend, missing pending state, or a
    /// malformed input count.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An accelerator failed while executing and no fallback was allowed.
    #[error("accelerator failure: {0}")]
    Accelerator(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
