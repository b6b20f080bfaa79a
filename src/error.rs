//! Error types for the storage controller core
//!
//! Provides structured error types for the entity repository, the
//! transaction machinery, the property and flag containers and the
//! persistence drivers.

use thiserror::Error;

/// Unified error type for the controller core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A violated programming contract. Never caught and retried.
    #[error("Implementation error: {0}")]
    Implementation(String),

    // =========================================================================
    // Repository Errors
    // =========================================================================
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Access to deleted {kind}: {key}")]
    AccessToDeleted { kind: &'static str, key: String },

    #[error("UUID mismatch for {kind} {key}: local {local}, remote {remote}")]
    UuidMismatch {
        kind: &'static str,
        key: String,
        local: uuid::Uuid,
        remote: uuid::Uuid,
    },

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("{kind} {key} is still in use: {reason}")]
    InUse {
        kind: &'static str,
        key: String,
        reason: String,
    },

    // =========================================================================
    // Security Errors
    // =========================================================================
    #[error("Access denied: identity {identity} (role {role}) lacks {requested} access to {object}")]
    AccessDenied {
        identity: String,
        role: String,
        requested: String,
        object: String,
    },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid {kind} name '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Invalid property key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Unknown flag '{name}' for {kind}")]
    UnknownFlag { kind: &'static str, name: String },

    #[error("Invalid flags 0x{bits:x} for {kind}")]
    InvalidFlags { kind: &'static str, bits: u64 },

    #[error("{what} {value} out of range {min}..={max}")]
    ValueOutOfRange {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    // =========================================================================
    // Number Pool Errors
    // =========================================================================
    #[error("Number {number} is already in use")]
    NumberInUse { number: u32 },

    #[error("Number pool exhausted: {start}..={end}")]
    PoolExhausted { start: u32, end: u32 },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller-facing condition, report and move on
    Recoverable,
    /// Storage hiccup, a new transaction may succeed
    Transient,
    /// Contract violation, abort the request
    Fatal,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::BackendUnavailable { .. } | Error::Persistence(_) | Error::Io(_) => {
                ErrorClass::Transient
            }

            Error::Implementation(_) | Error::Internal(_) => ErrorClass::Fatal,

            _ => ErrorClass::Recoverable,
        }
    }

    /// Check if a fresh transaction may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error indicates a bug in the calling code
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub(crate) fn implementation(msg: impl Into<String>) -> Self {
        Error::Implementation(msg.into())
    }
}

/// Result type alias for the controller core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = Error::AlreadyExists {
            kind: "Node",
            key: "alpha".into(),
        };
        assert_eq!(err.class(), ErrorClass::Recoverable);

        let err = Error::implementation("double attach");
        assert_eq!(err.class(), ErrorClass::Fatal);

        let err = Error::Persistence("row missing".into());
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::BackendUnavailable {
            backend: "controller-db".into(),
        };
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal());

        let contract = Error::implementation("commit without context");
        assert!(!contract.is_retryable());
        assert!(contract.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnknownFlag {
            kind: "NodeFlag",
            name: "BOGUS".into(),
        };
        assert_eq!(err.to_string(), "Unknown flag 'BOGUS' for NodeFlag");
    }
}
