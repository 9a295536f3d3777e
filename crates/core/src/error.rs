//! Domain error model.

use thiserror::Error;

/// Result type used across the core primitives.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic parsing/validation failures of the
/// primitives in this crate. I/O and collaborator failures belong to the
/// infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A release version string could not be parsed.
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    /// An integrity signature is not a 40-character hex digest.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An unknown status literal was read from storage.
    #[error("unknown status: {0}")]
    UnknownStatus(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_version(msg: impl Into<String>) -> Self {
        Self::InvalidVersion(msg.into())
    }

    pub fn invalid_signature(msg: impl Into<String>) -> Self {
        Self::InvalidSignature(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_status(msg: impl Into<String>) -> Self {
        Self::UnknownStatus(msg.into())
    }
}
