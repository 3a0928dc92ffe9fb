// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound streams: PULL and SUB.
//!
//! Opening and closing a stream for the same [`SubscriptionKey`] is
//! serialized, so a transport-level subscribe issued for a new first
//! listener can never be overtaken by the unsubscribe of the previous last
//! one.
//!
//! A stream outlives its socket. When the receive loop reports the socket
//! lost, the dead socket is released, a new one is acquired (and, for SUB,
//! the topic re-subscribed) and the same listeners keep being fed. Only the
//! last unsubscribe or `cleanup` ends a stream.

use super::MessagingService;
use crate::config::SocketType;
use crate::error::{MessagingError, Result};
use crate::fanout::{Detach, ListenerId, MessageListener, SubscriptionKey};
use crate::receiver::{run_stream_receiver, LoopExit, ReceiverKey, ReceiverToken};
use crate::transport::{Message, SocketId, Transport};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl<T: Transport> MessagingService<T> {
    /// Listen on a PULL endpoint.
    ///
    /// Late listeners are first replayed the cached backlog.
    pub async fn pull<F>(&self, key: &str, on_message: F) -> Result<Subscription<T>>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.require(key, SocketType::Pull)?;
        self.open_stream(SubscriptionKey::pull(key), SocketType::Pull, Arc::new(on_message))
            .await
    }

    /// Listen to `topic` on a SUB endpoint.
    ///
    /// The transport subscription is issued when the first local listener for
    /// `topic` attaches and withdrawn when the last one leaves.
    pub async fn subscribe<F>(&self, key: &str, topic: &str, on_message: F) -> Result<Subscription<T>>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.require(key, SocketType::Sub)?;
        self.open_stream(SubscriptionKey::sub(key, topic), SocketType::Sub, Arc::new(on_message))
            .await
    }

    async fn open_stream(
        &self,
        key: SubscriptionKey,
        socket_type: SocketType,
        listener: MessageListener,
    ) -> Result<Subscription<T>> {
        let inner = &self.inner;
        let endpoint = key.endpoint().to_string();

        let lock = inner.stream_locks.lock_for(&key);
        let _guard = lock.lock().await;

        let socket = match inner.registry.acquire(&endpoint, socket_type).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(subscription = %key, error = %e, "Could not open stream socket");
                inner.registry.release(&endpoint).await;
                return Err(e);
            }
        };

        let attachment = inner.fanout.attach(&key, listener);
        if attachment.first {
            if let Some(topic) = key.topic() {
                if let Err(e) = inner.transport.subscribe(socket.id, topic).await {
                    inner.fanout.detach(&key, attachment.id);
                    let e = MessagingError::transport("subscribe", e);
                    warn!(subscription = %key, error = %e, "Transport subscribe failed");
                    return Err(e);
                }
            }
            info!(subscription = %key, socket_id = socket.id, "Stream opened");
        } else {
            debug!(subscription = %key, listener = attachment.id, replayed = attachment.replayed, "Listener attached");
        }

        if let Some(token) = inner.receivers.start(ReceiverKey::Stream(key.clone()), socket.id) {
            tokio::spawn(self.clone().serve_stream(key.clone(), socket.id, token));
        }

        Ok(Subscription {
            service: self.clone(),
            key,
            listener: attachment.id,
            socket: socket.id,
        })
    }
}

impl<T: Transport> MessagingService<T> {
    /// Feed `key` from `socket`, reconnecting whenever the socket is lost.
    async fn serve_stream(self, key: SubscriptionKey, mut socket: SocketId, mut token: ReceiverToken) {
        let inner = &self.inner;
        let backoff = inner.config.options.receive_backoff();

        loop {
            let exit = run_stream_receiver(
                Arc::clone(&inner.transport),
                inner.fanout.clone(),
                key.clone(),
                socket,
                backoff,
                &token,
            )
            .await;
            let LoopExit::SocketLost(error) = exit else {
                return;
            };

            warn!(subscription = %key, socket_id = socket, error = %error, "Stream socket lost, reconnecting");
            inner.registry.release_socket(key.endpoint(), socket).await;

            match self.reconnect_stream(&key, &token).await {
                Some((next_socket, next_token)) => {
                    info!(subscription = %key, socket_id = next_socket, "Stream reconnected");
                    socket = next_socket;
                    token = next_token;
                }
                None => return,
            }
        }
    }

    /// Retry with backoff until the stream has a fresh socket and loop slot.
    ///
    /// Gives up when the stream is stopped or torn down, or when another
    /// caller already started a loop on the new socket.
    async fn reconnect_stream(
        &self,
        key: &SubscriptionKey,
        token: &ReceiverToken,
    ) -> Option<(SocketId, ReceiverToken)> {
        let inner = &self.inner;
        let backoff = inner.config.options.receive_backoff();
        let socket_type = match key.topic() {
            Some(_) => SocketType::Sub,
            None => SocketType::Pull,
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }

            let lock = inner.stream_locks.lock_for(key);
            let _guard = lock.lock().await;
            if token.is_cancelled() || !inner.fanout.contains(key) {
                return None;
            }

            let attempt = async {
                let socket = inner.registry.acquire(key.endpoint(), socket_type).await?;
                if let Some(topic) = key.topic() {
                    inner
                        .transport
                        .subscribe(socket.id, topic)
                        .await
                        .map_err(|e| MessagingError::transport("subscribe", e))?;
                }
                Ok::<_, MessagingError>(socket.id)
            };
            match attempt.await {
                Ok(socket) => {
                    let next = inner.receivers.start(ReceiverKey::Stream(key.clone()), socket);
                    if next.is_none() {
                        debug!(subscription = %key, socket_id = socket, "Loop already running on new socket");
                    }
                    return next.map(|token| (socket, token));
                }
                Err(e) => {
                    warn!(subscription = %key, error = %e, "Stream reconnect failed, retrying");
                }
            }
        }
    }
}

/// One listener on a PULL or SUB stream.
///
/// Dropping it does not detach the listener; call
/// [`unsubscribe`](Self::unsubscribe).
#[must_use = "the listener stays attached until unsubscribe() is called"]
pub struct Subscription<T: Transport> {
    service: MessagingService<T>,
    key: SubscriptionKey,
    listener: ListenerId,
    socket: SocketId,
}

impl<T: Transport> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("listener", &self.listener)
            .field("socket", &self.socket)
            .finish()
    }
}

impl<T: Transport> Subscription<T> {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn listener_id(&self) -> ListenerId {
        self.listener
    }

    /// Detach this listener.
    ///
    /// Other listeners on the same key are unaffected. When this was the last
    /// one the receive loop is stopped and, for SUB, the transport
    /// unsubscribe is issued exactly once.
    pub async fn unsubscribe(self) {
        let inner = &self.service.inner;
        let lock = inner.stream_locks.lock_for(&self.key);
        {
            let _guard = lock.lock().await;
            match inner.fanout.detach(&self.key, self.listener) {
                Detach::Remaining(remaining) => {
                    debug!(subscription = %self.key, remaining, "Listener detached");
                }
                Detach::NotFound => {
                    debug!(subscription = %self.key, "Listener already gone");
                }
                Detach::LastListener => {
                    inner.receivers.stop(&ReceiverKey::Stream(self.key.clone()));
                    if let Some(topic) = self.key.topic() {
                        let socket = inner
                            .registry
                            .current(self.key.endpoint())
                            .map(|h| h.id)
                            .unwrap_or(self.socket);
                        if let Err(e) = inner.transport.unsubscribe(socket, topic).await {
                            warn!(subscription = %self.key, error = %e, "Transport unsubscribe failed");
                        }
                    }
                    info!(subscription = %self.key, "Stream closed");
                }
            }
        }
        drop(lock);
        inner.stream_locks.prune(&self.key);
    }
}
