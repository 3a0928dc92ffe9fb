// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Result and introspection types for the service facade.

use crate::fanout::SubscriptionKey;
use crate::receiver::ReceiverState;
use crate::transport::Message;

/// What [`send()`](super::MessagingService::send) did.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// REQ endpoint: the reply.
    Reply(Message),
    /// PUSH endpoint: the message was handed to the transport.
    Delivered(bool),
}

impl SendOutcome {
    pub fn into_reply(self) -> Option<Message> {
        match self {
            Self::Reply(message) => Some(message),
            Self::Delivered(_) => None,
        }
    }
}

/// Health of one live subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionHealth {
    pub key: SubscriptionKey,
    pub listeners: usize,
    pub backlog: usize,
    pub receiver: ReceiverState,
}

/// Snapshot returned by [`health()`](super::MessagingService::health).
///
/// Built from in-memory state only; no transport calls are made.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHealth {
    pub initialized: bool,
    pub sockets_open: usize,
    pub active_receivers: usize,
    pub pending_dealer_requests: usize,
    pub subscriptions: Vec<SubscriptionHealth>,
}

impl ServiceHealth {
    /// Initialized, and every subscription has a running receive loop.
    pub fn is_healthy(&self) -> bool {
        self.initialized
            && self
                .subscriptions
                .iter()
                .all(|s| s.receiver == ReceiverState::Running)
    }
}
