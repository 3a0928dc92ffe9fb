// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound exchanges: REQ, DEALER and PUSH.
//!
//! REQ and PUSH failures force-close the endpoint's socket before the error
//! reaches the caller, so the next call reconnects. Neither retries.

use super::MessagingService;
use crate::config::SocketType;
use crate::dealer::{run_dealer_receiver, ResponseCallback};
use crate::error::{MessagingError, Result};
use crate::metrics;
use crate::receiver::{LoopExit, ReceiverKey};
use crate::transport::{request_id_of, Message, SocketId, Transport};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

impl<T: Transport> MessagingService<T> {
    /// Send `message` on a REQ endpoint and wait for the reply.
    ///
    /// The send and the receive together race the configured timeout. On
    /// timeout or transport error the socket is released and the error
    /// returned.
    pub async fn request(&self, key: &str, message: Message) -> Result<Message> {
        self.require(key, SocketType::Req)?;
        let started = Instant::now();

        match self.round_trip(key, message).await {
            Ok(reply) => {
                metrics::record_request(key, "ok", started.elapsed());
                Ok(reply)
            }
            Err(e) => {
                let outcome = match e {
                    MessagingError::RequestTimeout { .. } => "timeout",
                    _ => "error",
                };
                metrics::record_request(key, outcome, started.elapsed());
                warn!(endpoint = %key, error = %e, "Request failed");
                self.inner.registry.release(key).await;
                Err(e)
            }
        }
    }

    async fn round_trip(&self, key: &str, message: Message) -> Result<Message> {
        let socket = self.inner.registry.acquire(key, SocketType::Req).await?;
        let transport = &self.inner.transport;
        let options = &self.inner.config.options;

        let exchange = async {
            transport
                .send(socket.id, message)
                .await
                .map_err(|e| MessagingError::transport("send", e))?;
            transport
                .receive(socket.id)
                .await
                .map_err(|e| MessagingError::transport("receive", e))
        };

        tokio::time::timeout(options.request_timeout(), exchange)
            .await
            .unwrap_or_else(|_| {
                Err(MessagingError::RequestTimeout {
                    key: key.to_string(),
                    timeout_ms: options.timeout_ms,
                })
            })
    }

    /// Send `message` on a PUSH endpoint.
    pub async fn push(&self, key: &str, message: Message) -> Result<bool> {
        self.require(key, SocketType::Push)?;

        let sent = async {
            let socket = self.inner.registry.acquire(key, SocketType::Push).await?;
            self.inner
                .transport
                .send(socket.id, message)
                .await
                .map_err(|e| MessagingError::transport("send", e))
        }
        .await;

        match sent {
            Ok(()) => {
                metrics::record_push(key, true);
                Ok(true)
            }
            Err(e) => {
                metrics::record_push(key, false);
                warn!(endpoint = %key, error = %e, "Push failed");
                self.inner.registry.release(key).await;
                Err(e)
            }
        }
    }

    /// Send `message` on a DEALER endpoint; `on_response` gets the reply
    /// carrying the same `requestId`.
    ///
    /// Fails with [`MessagingError::MissingRequestId`] before touching the
    /// transport if the message has no id. A send failure releases the
    /// socket and drops the pending entry. A timeout after a successful send
    /// is only logged: the request stays pending until a response arrives or
    /// the returned handle cancels it.
    pub async fn dealer_send<F>(&self, key: &str, message: Message, on_response: F) -> Result<DealerHandle<T>>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.require(key, SocketType::Dealer)?;
        let request_id = request_id_of(&message)
            .ok_or(MessagingError::MissingRequestId)?
            .to_string();

        let socket = match self.inner.registry.acquire(key, SocketType::Dealer).await {
            Ok(socket) => socket,
            Err(e) => {
                self.inner.registry.release(key).await;
                return Err(e);
            }
        };

        let callback: ResponseCallback = Arc::new(on_response);
        self.arm_dealer_request(key, &request_id, Arc::clone(&callback), socket.id);

        if let Err(e) = self.inner.transport.send(socket.id, message).await {
            let e = MessagingError::transport("send", e);
            warn!(endpoint = %key, request_id = %request_id, error = %e, "Dealer send failed");
            self.inner.dealer.cancel(&request_id);
            self.inner.registry.release(key).await;
            return Err(e);
        }
        debug!(endpoint = %key, request_id = %request_id, socket_id = socket.id, "Dealer request sent");

        Ok(DealerHandle {
            service: self.clone(),
            endpoint: key.to_string(),
            request_id: Mutex::new(request_id),
            callback,
        })
    }

    /// Register the callback, make sure the endpoint's response loop runs on
    /// `socket`, and arm the warning timer.
    fn arm_dealer_request(&self, key: &str, request_id: &str, callback: ResponseCallback, socket: SocketId) {
        let inner = &self.inner;
        inner.dealer.register(key, request_id, callback);

        if let Some(token) = inner.receivers.start(ReceiverKey::Dealer(key.to_string()), socket) {
            let service = self.clone();
            let endpoint = key.to_string();
            tokio::spawn(async move {
                let inner = &service.inner;
                let exit = run_dealer_receiver(
                    Arc::clone(&inner.transport),
                    inner.dealer.clone(),
                    endpoint.clone(),
                    socket,
                    inner.config.options.receive_backoff(),
                    token,
                )
                .await;
                if let LoopExit::SocketLost(error) = exit {
                    warn!(endpoint = %endpoint, socket_id = socket, error = %error, "Dealer socket lost");
                    inner.registry.release_socket(&endpoint, socket).await;
                }
            });
        }

        if let Some(timeout) = inner.config.options.dealer_timeout() {
            inner.dealer.arm_timeout(request_id, timeout);
        }
    }
}

/// Returned by [`MessagingService::dealer_send`].
///
/// Dropping the handle leaves the request pending.
pub struct DealerHandle<T: Transport> {
    service: MessagingService<T>,
    endpoint: String,
    request_id: Mutex<String>,
    callback: ResponseCallback,
}

impl<T: Transport> fmt::Debug for DealerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DealerHandle")
            .field("endpoint", &self.endpoint)
            .field("request_id", &*self.current_id())
            .finish()
    }
}

impl<T: Transport> DealerHandle<T> {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The id the request is currently pending under.
    pub fn request_id(&self) -> String {
        self.current_id().clone()
    }

    fn current_id(&self) -> std::sync::MutexGuard<'_, String> {
        self.request_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send `message` again with the same callback.
    ///
    /// The pending entry moves to the new message's `requestId` if it
    /// differs, the timer is re-armed, and the endpoint's existing response
    /// loop is reused. Errors are returned without closing the socket.
    pub async fn resend(&self, message: Message) -> Result<()> {
        let new_id = request_id_of(&message)
            .ok_or(MessagingError::MissingRequestId)?
            .to_string();
        let service = &self.service;
        service.require(&self.endpoint, SocketType::Dealer)?;

        let socket = service
            .inner
            .registry
            .acquire(&self.endpoint, SocketType::Dealer)
            .await
            .map_err(|e| {
                warn!(endpoint = %self.endpoint, request_id = %new_id, error = %e, "Dealer resend failed");
                e
            })?;

        let old_id = std::mem::replace(&mut *self.current_id(), new_id.clone());
        if old_id != new_id {
            service.inner.dealer.cancel(&old_id);
            debug!(endpoint = %self.endpoint, from = %old_id, to = %new_id, "Dealer request re-keyed");
        }
        service.arm_dealer_request(&self.endpoint, &new_id, Arc::clone(&self.callback), socket.id);

        service
            .inner
            .transport
            .send(socket.id, message)
            .await
            .map_err(|e| {
                let e = MessagingError::transport("send", e);
                warn!(endpoint = %self.endpoint, request_id = %new_id, error = %e, "Dealer resend failed");
                e
            })
    }

    /// Drop the pending entry and its timer. The response loop keeps running.
    pub fn cancel(&self) {
        let id = self.request_id();
        if self.service.inner.dealer.cancel(&id) {
            debug!(endpoint = %self.endpoint, request_id = %id, "Dealer request cancelled by caller");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, MessagingConfig};
    use crate::memory::MemoryTransport;
    use crate::receiver::ReceiverState;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn service(transport: &Arc<MemoryTransport>, timeout_ms: i64) -> MessagingService<MemoryTransport> {
        let config = MessagingConfig::for_testing()
            .with_timeout_ms(timeout_ms)
            .with_endpoint("echo", EndpointConfig::new(5555, SocketType::Req))
            .with_endpoint("jobs", EndpointConfig::new(5556, SocketType::Push))
            .with_endpoint("work", EndpointConfig::new(5557, SocketType::Dealer).with_identity("ui"));
        MessagingService::new(config, Arc::clone(transport))
    }

    #[tokio::test]
    async fn test_request_echo() {
        let transport = Arc::new(MemoryTransport::echo());
        let service = service(&transport, 500);
        let reply = service.request("echo", json!({"requestId": "1", "text": "hi"})).await.unwrap();
        assert_eq!(reply, json!({"requestId": "1", "text": "hi"}));
        assert!(service.socket("echo").is_some());
    }

    #[tokio::test]
    async fn test_request_wrong_type_is_invalid_endpoint() {
        let transport = Arc::new(MemoryTransport::echo());
        let service = service(&transport, 500);
        let err = service.request("jobs", json!({})).await.unwrap_err();
        assert!(matches!(err, MessagingError::InvalidEndpoint { .. }));
        assert_eq!(transport.create_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_releases_socket() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport, 200);

        let err = service.request("echo", json!({"q": 1})).await.unwrap_err();
        assert!(matches!(err, MessagingError::RequestTimeout { timeout_ms: 200, .. }));
        assert!(service.socket("echo").is_none());
        assert_eq!(transport.open_sockets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_fires_immediately() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport, 0);

        let started = tokio::time::Instant::now();
        let err = service.request("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, MessagingError::RequestTimeout { timeout_ms: 0, .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_push_failure_releases_socket() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport, 500);

        assert!(service.push("jobs", json!(1)).await.unwrap());
        let first = service.socket("jobs").unwrap();

        transport.fail_next_sends(1);
        let err = service.push("jobs", json!(2)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!transport.is_open(first.id));

        assert!(service.push("jobs", json!(3)).await.unwrap());
        assert_ne!(service.socket("jobs").unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_dealer_missing_request_id_touches_nothing() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport, 500);

        let err = service.dealer_send("work", json!({"text": "x"}), |_| {}).await.unwrap_err();
        assert!(matches!(err, MessagingError::MissingRequestId));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dealer_roundtrip_and_single_loop() {
        let transport = Arc::new(MemoryTransport::echo());
        let service = service(&transport, 500);
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = Arc::clone(&hits);
        let a = service
            .dealer_send("work", json!({"requestId": "a"}), move |_| {
                h1.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        let h2 = Arc::clone(&hits);
        let _b = service
            .dealer_send("work", json!({"requestId": "b"}), move |_| {
                h2.fetch_add(10, Ordering::SeqCst);
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(service.pending_dealer_requests(), 0);
        assert_eq!(service.health().active_receivers, 1);
        assert_eq!(a.request_id(), "a");

        let socket = service.socket("work").unwrap();
        assert_eq!(transport.identity_of(socket.id).as_deref(), Some("ui"));
    }

    #[tokio::test]
    async fn test_dealer_send_failure_drops_pending() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport, 500);

        transport.fail_next_sends(1);
        let err = service.dealer_send("work", json!({"requestId": "r1"}), |_| {}).await;
        assert!(err.is_err());
        assert_eq!(service.pending_dealer_requests(), 0);
        assert!(service.socket("work").is_none());
    }

    #[tokio::test]
    async fn test_resend_rekeys_and_cancel() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport, 500);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);

        let handle = service
            .dealer_send("work", json!({"requestId": "r1"}), move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        let socket = service.socket("work").unwrap().id;

        handle.resend(json!({"requestId": "r2"})).await.unwrap();
        assert_eq!(handle.request_id(), "r2");
        assert_eq!(service.pending_dealer_requests(), 1);
        assert_eq!(transport.sent_to(socket).len(), 2);

        // Old id no longer routes; new one does.
        transport.deliver(socket, json!({"requestId": "r1"})).unwrap();
        transport.deliver(socket, json!({"requestId": "r2"})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        handle.resend(json!({"requestId": "r3"})).await.unwrap();
        handle.cancel();
        assert_eq!(service.pending_dealer_requests(), 0);
        assert!(handle.resend(json!({})).await.is_err());

        // Cancelling one request leaves the shared response loop serving others.
        assert_eq!(
            service.receiver_state(&ReceiverKey::Dealer("work".into())),
            ReceiverState::Running
        );
        let h = Arc::clone(&hits);
        service
            .dealer_send("work", json!({"requestId": "r4"}), move |_| {
                h.fetch_add(100, Ordering::SeqCst);
            })
            .await
            .unwrap();
        transport.deliver(socket, json!({"requestId": "r3"})).unwrap();
        transport.deliver(socket, json!({"requestId": "r4"})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 101);
        assert_eq!(service.pending_dealer_requests(), 0);
        assert_eq!(transport.create_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dealer_timeout_keeps_request_pending() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(&transport, 50);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);

        let handle = service
            .dealer_send("work", json!({"requestId": "slow"}), move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(service.pending_dealer_requests(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(handle.request_id(), "slow");

        let socket = service.socket("work").unwrap().id;
        transport.deliver(socket, json!({"requestId": "slow", "late": true})).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(service.pending_dealer_requests(), 0);
    }

    #[tokio::test]
    async fn test_lost_dealer_socket_reconnects_on_next_send() {
        let transport = Arc::new(MemoryTransport::echo());
        let service = service(&transport, 500);

        let _first = service.dealer_send("work", json!({"requestId": "a"}), |_| {}).await.unwrap();
        let dead = service.socket("work").unwrap().id;
        transport.close(dead).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(service.socket("work").is_none());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        service
            .dealer_send("work", json!({"requestId": "b"}), move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(transport.create_count(), 2);
    }
}
