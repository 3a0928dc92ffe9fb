// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport gateway boundary.
//!
//! The service never touches a socket library directly. Everything goes
//! through [`Transport`], which deals in whole application messages and
//! opaque [`SocketId`]s.
//!
//! # Example
//!
//! ```rust,no_run
//! use zmq_service::transport::{BoxFuture, Message, SocketId, SubscriptionMessage, Transport};
//! use zmq_service::SocketType;
//!
//! struct Backend { /* ... */ }
//!
//! impl Transport for Backend {
//!     fn create_socket(&self, _socket_type: SocketType) -> BoxFuture<'_, SocketId> {
//!         Box::pin(async move { Ok(1) })
//!     }
//!     fn connect<'a>(&'a self, _socket: SocketId, _url: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn set_identity<'a>(&'a self, _socket: SocketId, _identity: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn send(&self, _socket: SocketId, _message: Message) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn receive(&self, _socket: SocketId) -> BoxFuture<'_, Message> {
//!         Box::pin(async move { Ok(Message::Null) })
//!     }
//!     fn subscribe<'a>(&'a self, _socket: SocketId, _topic: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn unsubscribe<'a>(&'a self, _socket: SocketId, _topic: &'a str) -> BoxFuture<'a, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn receive_subscription(&self, _socket: SocketId) -> BoxFuture<'_, SubscriptionMessage> {
//!         Box::pin(async move { Ok(SubscriptionMessage::new("t", Message::Null)) })
//!     }
//!     fn close(&self, _socket: SocketId) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::config::SocketType;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Opaque socket identifier handed out by the transport.
pub type SocketId = u64;

/// A whole application-level message.
pub type Message = serde_json::Value;

/// Field carrying the dealer correlation identifier.
pub const REQUEST_ID_FIELD: &str = "requestId";

/// Extract the correlation identifier from a message, if it has one.
///
/// Only a non-empty string `requestId` on a JSON object counts.
pub fn request_id_of(message: &Message) -> Option<&str> {
    message
        .get(REQUEST_ID_FIELD)
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
}

/// A message delivered on a topic-aware receive.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMessage {
    pub topic: String,
    pub message: Message,
}

impl SubscriptionMessage {
    pub fn new(topic: impl Into<String>, message: Message) -> Self {
        Self {
            topic: topic.into(),
            message,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// Errors reported by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The socket was closed, either locally or by the backend.
    #[error("socket {0} is closed")]
    Closed(SocketId),

    /// The transport has no record of this socket.
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),

    /// Any other backend failure (connect refused, EAGAIN, decode error).
    #[error("{0}")]
    Backend(String),
}

impl TransportError {
    /// Backend hiccups are transient. A closed or unknown socket will never
    /// come back, so retrying against it is pointless.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// The asynchronous socket primitives the service is built on.
///
/// Implementations must be safe to call concurrently from many tasks; the
/// service never holds a lock across a transport call other than the
/// per-key creation lock.
pub trait Transport: Send + Sync + 'static {
    /// Whether the backend is usable. Checked once when the service is built.
    fn is_available(&self) -> bool {
        true
    }

    fn create_socket(&self, socket_type: SocketType) -> BoxFuture<'_, SocketId>;

    fn connect<'a>(&'a self, socket: SocketId, url: &'a str) -> BoxFuture<'a, ()>;

    fn set_identity<'a>(&'a self, socket: SocketId, identity: &'a str) -> BoxFuture<'a, ()>;

    fn send(&self, socket: SocketId, message: Message) -> BoxFuture<'_, ()>;

    /// Wait for the next message on a non-topic socket.
    fn receive(&self, socket: SocketId) -> BoxFuture<'_, Message>;

    fn subscribe<'a>(&'a self, socket: SocketId, topic: &'a str) -> BoxFuture<'a, ()>;

    fn unsubscribe<'a>(&'a self, socket: SocketId, topic: &'a str) -> BoxFuture<'a, ()>;

    /// Wait for the next message on a SUB socket, with its delivered topic.
    fn receive_subscription(&self, socket: SocketId) -> BoxFuture<'_, SubscriptionMessage>;

    fn close(&self, socket: SocketId) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_of_string_field() {
        let msg = json!({"requestId": "r1", "text": "hi"});
        assert_eq!(request_id_of(&msg), Some("r1"));
    }

    #[test]
    fn test_request_id_of_missing_or_wrong_type() {
        assert_eq!(request_id_of(&json!({})), None);
        assert_eq!(request_id_of(&json!({"requestId": 42})), None);
        assert_eq!(request_id_of(&json!({"requestId": ""})), None);
        assert_eq!(request_id_of(&json!("requestId")), None);
        assert_eq!(request_id_of(&Message::Null), None);
    }

    #[test]
    fn test_transport_error_retryable() {
        assert!(TransportError::Backend("timeout".into()).is_retryable());
        assert!(!TransportError::Closed(3).is_retryable());
        assert!(!TransportError::UnknownSocket(3).is_retryable());
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Closed(9).to_string(), "socket 9 is closed");
        assert_eq!(TransportError::UnknownSocket(2).to_string(), "unknown socket 2");
    }
}
