// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the messaging service.
//!
//! Every public operation returns [`Result<T>`]. Transport failures are
//! wrapped with the operation that produced them so logs show *what* was
//! being attempted, not just what the backend said.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `NotInitialized` | No | Transport was unavailable when the service was built |
//! | `InvalidEndpoint` | No | Unknown key, or key configured for another socket type |
//! | `MissingRequestId` | No | Dealer send without a `requestId` field |
//! | `RequestTimeout` | Yes | REQ reply did not arrive in time (socket already recycled) |
//! | `Transport` | Depends | Backend failures retry; closed/unknown sockets do not |
//! | `Config` | No | Configuration failed validation |
//!
//! # Retry Behavior
//!
//! One-shot operations never retry internally. Callers use
//! [`MessagingError::is_retryable()`] to decide. The continuous receive
//! loops use the same classification: retryable errors back off and retry,
//! anything else ends the loop.

use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors surfaced by the messaging service.
#[derive(Error, Debug)]
pub enum MessagingError {
    /// The transport was unavailable at construction time.
    ///
    /// Not retryable against this instance; build a new service once the
    /// transport is available.
    #[error("Messaging service not initialized: transport unavailable")]
    NotInitialized,

    /// The endpoint key is unknown, or configured for a different socket type
    /// than the operation needs.
    #[error("Invalid endpoint '{key}': {reason}")]
    InvalidEndpoint { key: String, reason: String },

    /// A dealer message was sent without a `requestId` field.
    #[error("Dealer message is missing a string 'requestId' field")]
    MissingRequestId,

    /// A REQ exchange did not complete within the configured timeout.
    ///
    /// The socket has been released by the time the caller sees this, so a
    /// retry gets a fresh connection.
    #[error("Request to '{key}' timed out after {timeout_ms}ms")]
    RequestTimeout { key: String, timeout_ms: i64 },

    /// A transport call failed.
    #[error("Transport error ({operation}): {source}")]
    Transport {
        operation: String,
        #[source]
        source: TransportError,
    },

    /// Configuration failed to parse or validate.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MessagingError {
    /// Create an `InvalidEndpoint` error.
    pub fn invalid_endpoint(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a transport failure with the operation that produced it.
    pub fn transport(operation: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            operation: operation.into(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotInitialized => false,
            Self::InvalidEndpoint { .. } => false,
            Self::MissingRequestId => false,
            Self::RequestTimeout { .. } => true,
            Self::Transport { source, .. } => source.is_retryable(),
            Self::Config(_) => false,
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}
