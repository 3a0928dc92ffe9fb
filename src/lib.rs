// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # ZMQ Service
//!
//! Key-based messaging over ZeroMQ-style socket patterns.
//!
//! Callers address logical endpoint keys ("echo", "jobs", "ticks") rather than
//! sockets. Each key maps to a configured port and socket type; the service
//! creates, reuses and closes the underlying sockets itself.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           MessagingService                               │
//! │                                                                          │
//! │  request / push / dealer_send            pull / subscribe                │
//! │         │                                      │                         │
//! │         ▼                                      ▼                         │
//! │  ┌────────────────┐   ┌──────────────┐   ┌──────────────────────────┐    │
//! │  │ SocketRegistry │◄──│ ReceiverSet  │──►│ MessageFanout            │    │
//! │  │ (one per key)  │   │ (one loop    │   │ (bounded backlog,        │    │
//! │  └────────────────┘   │  per stream) │   │  replay, listeners)      │    │
//! │         │             └──────────────┘   └──────────────────────────┘    │
//! │         │                    │                                           │
//! │         │                    ▼                                           │
//! │         │             ┌──────────────────┐                               │
//! │         │             │ DealerCorrelator │  requestId → callback          │
//! │         │             └──────────────────┘                               │
//! └─────────┼────────────────────────────────────────────────────────────────┘
//!           ▼
//!     dyn Transport  (create / connect / send / receive / subscribe / close)
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zmq_service::{EndpointConfig, MemoryTransport, MessagingConfig, MessagingService, SocketType};
//!
//! #[tokio::main]
//! async fn main() -> zmq_service::Result<()> {
//!     let config = MessagingConfig::default()
//!         .with_endpoint("echo", EndpointConfig::new(5555, SocketType::Req))
//!         .with_endpoint("ticks", EndpointConfig::new(5556, SocketType::Sub));
//!     let service = MessagingService::new(config, Arc::new(MemoryTransport::echo()));
//!
//!     let reply = service.request("echo", serde_json::json!({"text": "hi"})).await?;
//!     println!("{reply}");
//!
//!     let sub = service
//!         .subscribe("ticks", "btc", |msg| println!("tick: {msg}"))
//!         .await?;
//!     sub.unsubscribe().await;
//!
//!     service.cleanup().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dealer;
pub mod error;
pub mod fanout;
pub mod memory;
pub mod metrics;
pub mod receiver;
pub mod registry;
pub mod service;
pub mod transport;

// Re-exports for convenience
pub use config::{EndpointConfig, MessagingConfig, MessagingOptions, SocketType};
pub use error::{MessagingError, Result};
pub use fanout::{MessageListener, SubscriptionKey};
pub use memory::MemoryTransport;
pub use receiver::{ReceiverKey, ReceiverState};
pub use registry::SocketHandle;
pub use service::{DealerHandle, MessagingService, SendOutcome, ServiceHealth, Subscription, SubscriptionHealth};
pub use transport::{Message, SocketId, SubscriptionMessage, Transport, TransportError};
