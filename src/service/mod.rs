// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The messaging service facade.
//!
//! [`MessagingService`] is a cheap-to-clone handle over the shared state:
//! socket registry, subscription fan-out, receive loops and pending dealer
//! requests. Construct it once and hand clones to whoever needs it.
//!
//! # Operations
//!
//! | Pattern | Call | Returns |
//! |---------|------|---------|
//! | REQ | [`request`](MessagingService::request) | reply, or `RequestTimeout` |
//! | DEALER | [`dealer_send`](MessagingService::dealer_send) | [`DealerHandle`] (resend / cancel) |
//! | PUSH | [`push`](MessagingService::push) | `true` once sent |
//! | PULL | [`pull`](MessagingService::pull) | [`Subscription`] |
//! | SUB | [`subscribe`](MessagingService::subscribe) | [`Subscription`] |
//!
//! [`send`](MessagingService::send) and [`receive`](MessagingService::receive)
//! dispatch on the endpoint's configured type.

mod exchange;
mod streams;
mod types;

pub use exchange::DealerHandle;
pub use streams::Subscription;
pub use types::{SendOutcome, ServiceHealth, SubscriptionHealth};

use crate::config::{EndpointConfig, MessagingConfig, SocketType};
use crate::dealer::DealerCorrelator;
use crate::error::{MessagingError, Result};
use crate::fanout::{MessageFanout, SubscriptionKey};
use crate::receiver::{ReceiverKey, ReceiverSet, ReceiverState};
use crate::registry::{KeyedLocks, SocketHandle, SocketRegistry};
use crate::transport::{Message, Transport};
use std::sync::Arc;
use tracing::{error, info};

pub(crate) struct ServiceInner<T: Transport> {
    config: Arc<MessagingConfig>,
    transport: Arc<T>,
    initialized: bool,
    registry: SocketRegistry<T>,
    fanout: MessageFanout,
    receivers: ReceiverSet,
    dealer: DealerCorrelator,
    stream_locks: KeyedLocks<SubscriptionKey>,
}

/// Key-based messaging over configured endpoints.
pub struct MessagingService<T: Transport> {
    inner: Arc<ServiceInner<T>>,
}

impl<T: Transport> Clone for MessagingService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> MessagingService<T> {
    /// Build the service.
    ///
    /// The config is validated here as well as in
    /// [`MessagingConfig::from_json`]. If it is invalid, or the transport
    /// reports itself unavailable, the service is created uninitialized: the
    /// failure is logged and every operation returns
    /// [`MessagingError::NotInitialized`].
    pub fn new(config: MessagingConfig, transport: Arc<T>) -> Self {
        let valid = match config.validate() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Invalid messaging config, service not initialized");
                false
            }
        };
        let available = transport.is_available();
        if !available {
            error!("Transport unavailable, messaging service not initialized");
        }
        let initialized = valid && available;
        if initialized {
            info!(
                endpoints = config.endpoints.len(),
                hostname = %config.options.hostname,
                timeout_ms = config.options.timeout_ms,
                "Messaging service initialized"
            );
        }

        let config = Arc::new(config);
        let inner = ServiceInner {
            registry: SocketRegistry::new(Arc::clone(&config), Arc::clone(&transport), initialized),
            fanout: MessageFanout::new(config.options.cache_capacity),
            receivers: ReceiverSet::new(),
            dealer: DealerCorrelator::new(),
            stream_locks: KeyedLocks::default(),
            config,
            transport,
            initialized,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    /// Configuration for `key`, if any.
    pub fn endpoint_config(&self, key: &str) -> Option<&EndpointConfig> {
        self.inner.config.endpoint(key)
    }

    /// The socket currently held for `key`.
    pub fn socket(&self, key: &str) -> Option<SocketHandle> {
        self.inner.registry.current(key)
    }

    /// Cached backlog for a subscription, oldest first.
    pub fn backlog(&self, key: &SubscriptionKey) -> Vec<Message> {
        self.inner.fanout.backlog(key)
    }

    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.inner.fanout.listener_count(key)
    }

    pub fn receiver_state(&self, key: &ReceiverKey) -> ReceiverState {
        self.inner.receivers.state(key)
    }

    pub fn pending_dealer_requests(&self) -> usize {
        self.inner.dealer.pending_count()
    }

    /// Snapshot of sockets, loops and subscriptions.
    pub fn health(&self) -> ServiceHealth {
        let inner = &self.inner;
        let subscriptions = inner
            .fanout
            .snapshot()
            .into_iter()
            .map(|(key, listeners, backlog)| SubscriptionHealth {
                receiver: inner.receivers.state(&ReceiverKey::Stream(key.clone())),
                key,
                listeners,
                backlog,
            })
            .collect();

        ServiceHealth {
            initialized: inner.initialized,
            sockets_open: inner.registry.len(),
            active_receivers: inner.receivers.running(),
            pending_dealer_requests: inner.dealer.pending_count(),
            subscriptions,
        }
    }

    /// Send on a REQ or PUSH endpoint, whichever `key` is configured as.
    pub async fn send(&self, key: &str, message: Message) -> Result<SendOutcome> {
        let socket_type = self.configured_type(key)?;
        match socket_type {
            SocketType::Req => self.request(key, message).await.map(SendOutcome::Reply),
            SocketType::Push => self.push(key, message).await.map(SendOutcome::Delivered),
            SocketType::Dealer => Err(MessagingError::invalid_endpoint(
                key,
                "dealer endpoints need a response callback, use dealer_send",
            )),
            SocketType::Sub => Err(MessagingError::invalid_endpoint(
                key,
                "sub endpoints are receive-only, use subscribe",
            )),
            other => Err(MessagingError::invalid_endpoint(
                key,
                format!("send is not supported for {} endpoints", other),
            )),
        }
    }

    /// Listen on a SUB or PULL endpoint, whichever `key` is configured as.
    ///
    /// SUB endpoints require `topic`; PULL endpoints ignore it.
    pub async fn receive<F>(&self, key: &str, topic: Option<&str>, on_message: F) -> Result<Subscription<T>>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let socket_type = self.configured_type(key)?;
        match socket_type {
            SocketType::Sub => {
                let topic = topic.ok_or_else(|| {
                    MessagingError::invalid_endpoint(key, "a topic is required for sub endpoints")
                })?;
                self.subscribe(key, topic, on_message).await
            }
            SocketType::Pull => self.pull(key, on_message).await,
            other => Err(MessagingError::invalid_endpoint(
                key,
                format!("receive is not supported for {} endpoints", other),
            )),
        }
    }

    /// Close every socket and drop all subscription and dealer state.
    ///
    /// Receive loops are signalled to stop and exit once their current
    /// receive fails on the closed socket. Idempotent; a no-op when the
    /// service never initialized.
    pub async fn cleanup(&self) {
        let inner = &self.inner;
        if !inner.initialized {
            return;
        }
        let receivers_stopped = inner.receivers.stop_all();
        let sockets_closed = inner.registry.close_all().await;
        inner.fanout.clear();
        let dealer_requests_cleared = inner.dealer.clear();
        inner.stream_locks.prune_idle();
        info!(
            sockets_closed,
            receivers_stopped,
            dealer_requests_cleared,
            "Messaging service cleaned up"
        );
    }

    fn configured_type(&self, key: &str) -> Result<SocketType> {
        if !self.inner.initialized {
            return Err(MessagingError::NotInitialized);
        }
        self.inner
            .config
            .endpoint(key)
            .map(|e| e.socket_type)
            .ok_or_else(|| MessagingError::invalid_endpoint(key, "no such endpoint configured"))
    }

    /// Check initialization and that `key` is configured as `expected`.
    fn require(&self, key: &str, expected: SocketType) -> Result<()> {
        if !self.inner.initialized {
            return Err(MessagingError::NotInitialized);
        }
        self.inner.config.endpoint_for(key, expected).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::json;

    fn config() -> MessagingConfig {
        MessagingConfig::for_testing()
            .with_endpoint("echo", EndpointConfig::new(5555, SocketType::Req))
            .with_endpoint("jobs", EndpointConfig::new(5556, SocketType::Push))
            .with_endpoint("work", EndpointConfig::new(5557, SocketType::Dealer))
            .with_endpoint("ticks", EndpointConfig::new(5558, SocketType::Sub))
            .with_endpoint("inbox", EndpointConfig::new(5559, SocketType::Pull))
            .with_endpoint("server", EndpointConfig::new(5560, SocketType::Rep))
    }

    #[tokio::test]
    async fn test_uninitialized_rejects_everything() {
        let transport = Arc::new(MemoryTransport::unavailable());
        let service = MessagingService::new(config(), Arc::clone(&transport));
        assert!(!service.is_initialized());

        assert!(matches!(service.request("echo", json!({})).await, Err(MessagingError::NotInitialized)));
        assert!(matches!(service.push("jobs", json!({})).await, Err(MessagingError::NotInitialized)));
        assert!(matches!(
            service.dealer_send("work", json!({"requestId": "r"}), |_| {}).await,
            Err(MessagingError::NotInitialized)
        ));
        assert!(matches!(service.pull("inbox", |_| {}).await, Err(MessagingError::NotInitialized)));
        assert!(matches!(service.subscribe("ticks", "a", |_| {}).await, Err(MessagingError::NotInitialized)));
        assert!(matches!(service.send("echo", json!({})).await, Err(MessagingError::NotInitialized)));

        service.cleanup().await;
        assert_eq!(transport.calls().len(), 0);
        assert!(!service.health().is_healthy());
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_service_uninitialized() {
        let bad_configs = [
            config().with_endpoint("zero", EndpointConfig::new(0, SocketType::Push)),
            config().with_cache_capacity(0),
            MessagingConfig {
                options: crate::config::MessagingOptions {
                    hostname: " ".into(),
                    ..Default::default()
                },
                ..config()
            },
        ];
        for bad in bad_configs {
            let transport = Arc::new(MemoryTransport::echo());
            let service = MessagingService::new(bad, Arc::clone(&transport));
            assert!(!service.is_initialized());
            assert!(matches!(
                service.request("echo", json!({})).await,
                Err(MessagingError::NotInitialized)
            ));
            assert!(transport.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_endpoint_config_lookup() {
        let service = MessagingService::new(config(), Arc::new(MemoryTransport::new()));
        assert_eq!(service.endpoint_config("echo").unwrap().port, 5555);
        assert!(service.endpoint_config("missing").is_none());
    }

    #[tokio::test]
    async fn test_send_dispatches_by_type() {
        let transport = Arc::new(MemoryTransport::echo());
        let service = MessagingService::new(config(), Arc::clone(&transport));

        let reply = service.send("echo", json!({"n": 1})).await.unwrap();
        assert_eq!(reply, SendOutcome::Reply(json!({"n": 1})));

        let pushed = service.send("jobs", json!({"n": 2})).await.unwrap();
        assert_eq!(pushed, SendOutcome::Delivered(true));

        for key in ["work", "ticks", "server", "nope"] {
            let err = service.send(key, json!({})).await.unwrap_err();
            assert!(matches!(err, MessagingError::InvalidEndpoint { .. }), "{key}: {err}");
        }
    }

    #[tokio::test]
    async fn test_receive_dispatches_by_type() {
        let transport = Arc::new(MemoryTransport::new());
        let service = MessagingService::new(config(), Arc::clone(&transport));

        let err = service.receive("ticks", None, |_| {}).await.unwrap_err();
        assert!(err.to_string().contains("topic is required"));

        let sub = service.receive("ticks", Some("btc"), |_| {}).await.unwrap();
        assert_eq!(sub.key(), &SubscriptionKey::sub("ticks", "btc"));

        let pull = service.receive("inbox", Some("ignored"), |_| {}).await.unwrap();
        assert_eq!(pull.key(), &SubscriptionKey::pull("inbox"));

        assert!(service.receive("echo", None, |_| {}).await.is_err());

        sub.unsubscribe().await;
        pull.unsubscribe().await;
        service.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_resets_state() {
        let transport = Arc::new(MemoryTransport::new());
        let service = MessagingService::new(config(), Arc::clone(&transport));

        let _sub = service.subscribe("ticks", "btc", |_| {}).await.unwrap();
        let _handle = service.dealer_send("work", json!({"requestId": "r1"}), |_| {}).await.unwrap();
        service.push("jobs", json!(1)).await.unwrap();

        let before = service.health();
        assert_eq!(before.sockets_open, 3);
        assert_eq!(before.pending_dealer_requests, 1);
        assert_eq!(before.subscriptions.len(), 1);
        assert!(before.is_healthy());

        service.cleanup().await;
        let after = service.health();
        assert_eq!(after.sockets_open, 0);
        assert_eq!(after.pending_dealer_requests, 0);
        assert!(after.subscriptions.is_empty());
        assert_eq!(transport.open_sockets(), 0);

        // Idempotent.
        service.cleanup().await;
    }
}
