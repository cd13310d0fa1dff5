//! Error types for flexblock.
//!
//! This module provides a unified error type [`FlexError`] for all flexblock
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Capacity**: `InsufficientCapacity`, `PoolCapacityExceeded`. The caller
//!   may retry with a smaller allocation or a different pool.
//! - **Authorization / availability**: `AccessDenied`, `TokenInvalid`,
//!   `VolumeUnavailable`. Recoverable after a mapping fix or a rebuild.
//! - **Data path**: `NoReplicaAvailable`, `PartialIoFailure` are surfaced to
//!   the application issuing IO. `ReplicaUnavailable` is local to one replica;
//!   the initiator fails over on it.
//! - **Resources**: not found, conflicts, invalid arguments.
//! - **Infrastructure**: network, timeouts, IO, serialization, configuration.
//!
//! Errors cross process boundaries as a [`WireError`] and are rebuilt with
//! [`FlexError::from_wire`], so a typed error raised by a storage node is the
//! same typed error at the initiator.
//!
//! ```rust
//! use flexblock::error::{ErrorKind, FlexError};
//!
//! let err = FlexError::ReplicaUnavailable("chunk 7 on node 3".into());
//! assert!(err.is_retryable());
//!
//! let wire = err.to_wire();
//! assert_eq!(wire.kind, ErrorKind::ReplicaUnavailable);
//! assert!(matches!(FlexError::from_wire(wire), FlexError::ReplicaUnavailable(_)));
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Main error type for flexblock operations.
#[derive(Error, Debug)]
pub enum FlexError {
    // Capacity errors
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("Pool capacity exceeded: {0}")]
    PoolCapacityExceeded(String),

    // Authorization and availability errors
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    #[error("Volume unavailable: {0}")]
    VolumeUnavailable(String),

    // Data path errors
    #[error("No replica available: {0}")]
    NoReplicaAvailable(String),

    #[error("Partial IO failure: {0}")]
    PartialIoFailure(String),

    #[error("Replica unavailable: {0}")]
    ReplicaUnavailable(String),

    // Resource errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Volume in use: {0}")]
    VolumeInUse(String),

    #[error("Not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Network errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable error tag used on the wire and in the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InsufficientCapacity,
    PoolCapacityExceeded,
    AccessDenied,
    TokenInvalid,
    VolumeUnavailable,
    NoReplicaAvailable,
    PartialIoFailure,
    ReplicaUnavailable,
    NotFound,
    AlreadyExists,
    VolumeInUse,
    NotEmpty,
    InvalidArgument,
    InvalidState,
    ChecksumMismatch,
    Timeout,
    Network,
    Protocol,
    Config,
    Io,
    Serialization,
    Internal,
}

/// An error as carried inside a protocol frame or an HTTP body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FlexError {
    /// Stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlexError::InsufficientCapacity(_) => ErrorKind::InsufficientCapacity,
            FlexError::PoolCapacityExceeded(_) => ErrorKind::PoolCapacityExceeded,
            FlexError::AccessDenied(_) => ErrorKind::AccessDenied,
            FlexError::TokenInvalid(_) => ErrorKind::TokenInvalid,
            FlexError::VolumeUnavailable(_) => ErrorKind::VolumeUnavailable,
            FlexError::NoReplicaAvailable(_) => ErrorKind::NoReplicaAvailable,
            FlexError::PartialIoFailure(_) => ErrorKind::PartialIoFailure,
            FlexError::ReplicaUnavailable(_) => ErrorKind::ReplicaUnavailable,
            FlexError::NotFound(_) => ErrorKind::NotFound,
            FlexError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FlexError::VolumeInUse(_) => ErrorKind::VolumeInUse,
            FlexError::NotEmpty(_) => ErrorKind::NotEmpty,
            FlexError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FlexError::InvalidState(_) => ErrorKind::InvalidState,
            FlexError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            FlexError::Timeout(_) => ErrorKind::Timeout,
            FlexError::Network(_) => ErrorKind::Network,
            FlexError::Protocol(_) => ErrorKind::Protocol,
            FlexError::Config(_) | FlexError::InvalidConfig { .. } => ErrorKind::Config,
            FlexError::Io(_) => ErrorKind::Io,
            FlexError::Serialization(_) => ErrorKind::Serialization,
            FlexError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlexError::Timeout(_)
                | FlexError::Network(_)
                | FlexError::ReplicaUnavailable(_)
                | FlexError::VolumeUnavailable(_)
        )
    }

    /// Whether a read should move on to the next replica after this error.
    pub fn allows_failover(&self) -> bool {
        matches!(
            self,
            FlexError::ReplicaUnavailable(_)
                | FlexError::Timeout(_)
                | FlexError::Network(_)
                | FlexError::Io(_)
                | FlexError::ChecksumMismatch { .. }
        )
    }

    /// HTTP status used by the admin API.
    pub fn status_code(&self) -> u16 {
        match self {
            FlexError::NotFound(_) => 404,
            FlexError::AlreadyExists(_)
            | FlexError::VolumeInUse(_)
            | FlexError::NotEmpty(_)
            | FlexError::InvalidState(_) => 409,
            FlexError::InvalidArgument(_)
            | FlexError::Config(_)
            | FlexError::InvalidConfig { .. } => 400,
            FlexError::AccessDenied(_) => 403,
            FlexError::TokenInvalid(_) => 401,
            FlexError::InsufficientCapacity(_) | FlexError::PoolCapacityExceeded(_) => 507,
            FlexError::VolumeUnavailable(_)
            | FlexError::NoReplicaAvailable(_)
            | FlexError::ReplicaUnavailable(_) => 503,
            FlexError::Timeout(_) => 504,
            FlexError::Network(_) | FlexError::PartialIoFailure(_) => 502,
            _ => 500,
        }
    }

    /// Convert into the serializable form.
    pub fn to_wire(&self) -> WireError {
        let message = match self {
            FlexError::InsufficientCapacity(m)
            | FlexError::PoolCapacityExceeded(m)
            | FlexError::AccessDenied(m)
            | FlexError::TokenInvalid(m)
            | FlexError::VolumeUnavailable(m)
            | FlexError::NoReplicaAvailable(m)
            | FlexError::PartialIoFailure(m)
            | FlexError::ReplicaUnavailable(m)
            | FlexError::NotFound(m)
            | FlexError::AlreadyExists(m)
            | FlexError::VolumeInUse(m)
            | FlexError::NotEmpty(m)
            | FlexError::InvalidArgument(m)
            | FlexError::InvalidState(m)
            | FlexError::Timeout(m)
            | FlexError::Network(m)
            | FlexError::Protocol(m)
            | FlexError::Config(m)
            | FlexError::Serialization(m)
            | FlexError::Internal(m) => m.clone(),
            other => other.to_string(),
        };
        WireError {
            kind: self.kind(),
            message,
        }
    }

    /// Rebuild a typed error from its serializable form.
    pub fn from_wire(wire: WireError) -> Self {
        let m = wire.message;
        match wire.kind {
            ErrorKind::InsufficientCapacity => FlexError::InsufficientCapacity(m),
            ErrorKind::PoolCapacityExceeded => FlexError::PoolCapacityExceeded(m),
            ErrorKind::AccessDenied => FlexError::AccessDenied(m),
            ErrorKind::TokenInvalid => FlexError::TokenInvalid(m),
            ErrorKind::VolumeUnavailable => FlexError::VolumeUnavailable(m),
            ErrorKind::NoReplicaAvailable => FlexError::NoReplicaAvailable(m),
            ErrorKind::PartialIoFailure => FlexError::PartialIoFailure(m),
            ErrorKind::ReplicaUnavailable => FlexError::ReplicaUnavailable(m),
            ErrorKind::NotFound => FlexError::NotFound(m),
            ErrorKind::AlreadyExists => FlexError::AlreadyExists(m),
            ErrorKind::VolumeInUse => FlexError::VolumeInUse(m),
            ErrorKind::NotEmpty => FlexError::NotEmpty(m),
            ErrorKind::InvalidArgument => FlexError::InvalidArgument(m),
            ErrorKind::InvalidState => FlexError::InvalidState(m),
            ErrorKind::Timeout => FlexError::Timeout(m),
            ErrorKind::Network => FlexError::Network(m),
            ErrorKind::Protocol => FlexError::Protocol(m),
            ErrorKind::Config => FlexError::Config(m),
            ErrorKind::Serialization => FlexError::Serialization(m),
            // Local-only kinds arrive as opaque remote failures.
            ErrorKind::ChecksumMismatch | ErrorKind::Io | ErrorKind::Internal => {
                FlexError::Internal(m)
            }
        }
    }
}

impl From<bincode::Error> for FlexError {
    fn from(e: bincode::Error) -> Self {
        FlexError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FlexError {
    fn from(e: serde_json::Error) -> Self {
        FlexError::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FlexError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        FlexError::Timeout(e.to_string())
    }
}

/// Result type alias for flexblock operations.
pub type Result<T> = std::result::Result<T, FlexError>;
