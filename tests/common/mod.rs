// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A standard endpoint table over every socket type
//! - Recording listeners for asserting on delivered messages

pub mod listeners;

pub use listeners::*;

use std::sync::Arc;
use std::time::Duration;
use zmq_service::{EndpointConfig, MemoryTransport, MessagingConfig, MessagingService, SocketType};

/// One endpoint of each type, keyed by role.
pub fn test_config() -> MessagingConfig {
    MessagingConfig::for_testing()
        .with_endpoint("echo", EndpointConfig::new(5555, SocketType::Req))
        .with_endpoint("jobs", EndpointConfig::new(5556, SocketType::Push))
        .with_endpoint("inbox", EndpointConfig::new(5557, SocketType::Pull))
        .with_endpoint("ticks", EndpointConfig::new(5558, SocketType::Sub))
        .with_endpoint(
            "work",
            EndpointConfig::new(5559, SocketType::Dealer).with_identity("ui-client"),
        )
}

/// A service over `transport` using [`test_config`].
pub fn service_with(transport: &Arc<MemoryTransport>) -> MessagingService<MemoryTransport> {
    MessagingService::new(test_config(), Arc::clone(transport))
}

/// Give spawned receive loops a chance to drain their inboxes.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
