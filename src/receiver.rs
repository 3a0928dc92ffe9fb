// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Continuous receive loops.
//!
//! One task per [`ReceiverKey`], started lazily and at most once at a time.
//! Each task owns a [`ReceiverToken`]; stopping a loop cancels the token.
//!
//! # State Machine
//!
//! ```text
//!          start()              stop() / stop_all()
//!   Idle ──────────► Running ─────────────────────► Stopping
//!    ▲                                                  │
//!    └──────────── task exits, token dropped ───────────┘
//! ```
//!
//! The token is checked before every receive. An in-flight receive is never
//! interrupted, so a stop takes effect once the current call returns or
//! fails. Only the backoff sleep is cut short.
//!
//! # Error policy
//!
//! | Error | Action |
//! |-------|--------|
//! | Retryable (`TransportError::Backend`) | warn, sleep backoff, retry |
//! | Socket closed / unknown | return [`LoopExit::SocketLost`] to the owner |
//!
//! A lost socket is not the end of a stream: its owner releases the dead
//! socket, reconnects and runs the loop again on the new one.

use crate::fanout::{MessageFanout, SubscriptionKey};
use crate::metrics;
use crate::transport::{Message, SocketId, Transport, TransportError, TransportResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// What a receive loop is feeding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReceiverKey {
    /// A PULL or SUB stream.
    Stream(SubscriptionKey),
    /// The shared response loop of a dealer endpoint.
    Dealer(String),
}

impl fmt::Display for ReceiverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(key) => key.fmt(f),
            Self::Dealer(endpoint) => write!(f, "dealer:{}", endpoint),
        }
    }
}

/// Lifecycle of one receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Running,
    Stopping,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

struct ReceiverEntry {
    token: CancellationToken,
    generation: u64,
    socket: SocketId,
    state: ReceiverState,
}

/// Registry of running receive loops.
#[derive(Clone, Default)]
pub struct ReceiverSet {
    entries: Arc<DashMap<ReceiverKey, ReceiverEntry>>,
    generation: Arc<AtomicU64>,
}

impl ReceiverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the loop for `key` reading from `socket`.
    ///
    /// Returns `None` if a loop is already running on that socket. A loop
    /// still winding down after a stop, or one bound to a socket that has
    /// since been replaced, is superseded: it is cancelled and the new token
    /// gets its own generation so the old task's exit does not remove it.
    pub fn start(&self, key: ReceiverKey, socket: SocketId) -> Option<ReceiverToken> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let entry = ReceiverEntry {
            token: token.clone(),
            generation,
            socket,
            state: ReceiverState::Running,
        };

        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied)
                if occupied.get().state == ReceiverState::Running && occupied.get().socket == socket =>
            {
                return None;
            }
            Entry::Occupied(mut occupied) => {
                debug!(
                    receiver = %key,
                    old_socket = occupied.get().socket,
                    new_socket = socket,
                    "Superseding receive loop"
                );
                occupied.get().token.cancel();
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        metrics::set_active_receivers(self.running());

        Some(ReceiverToken {
            set: self.clone(),
            key,
            generation,
            token,
        })
    }

    /// Signal the loop for `key` to stop. Returns false if none was running.
    pub fn stop(&self, key: &ReceiverKey) -> bool {
        let stopped = match self.entries.get_mut(key) {
            Some(mut entry) if entry.state == ReceiverState::Running => {
                entry.state = ReceiverState::Stopping;
                entry.token.cancel();
                true
            }
            _ => false,
        };
        if stopped {
            debug!(receiver = %key, "Receive loop stop requested");
            metrics::set_active_receivers(self.running());
        }
        stopped
    }

    /// Signal every loop to stop. Returns how many were running.
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.state == ReceiverState::Running {
                entry.state = ReceiverState::Stopping;
                entry.token.cancel();
                stopped += 1;
            }
        }
        metrics::set_active_receivers(self.running());
        stopped
    }

    pub fn state(&self, key: &ReceiverKey) -> ReceiverState {
        self.entries
            .get(key)
            .map(|e| e.state)
            .unwrap_or(ReceiverState::Idle)
    }

    /// Socket the current loop for `key` reads from.
    pub fn socket(&self, key: &ReceiverKey) -> Option<SocketId> {
        self.entries.get(key).map(|e| e.socket)
    }

    pub fn is_running(&self, key: &ReceiverKey) -> bool {
        self.state(key) == ReceiverState::Running
    }

    /// Number of loops in `Running`.
    pub fn running(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == ReceiverState::Running)
            .count()
    }

    fn finish(&self, key: &ReceiverKey, generation: u64) {
        self.entries.remove_if(key, |_, e| e.generation == generation);
        metrics::set_active_receivers(self.running());
    }
}

/// Why a receive loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The token was cancelled.
    Stopped,
    /// The socket failed with a non-retryable error while still wanted.
    SocketLost(TransportError),
}

/// Held by a running loop. Dropping it marks the loop `Idle`.
pub struct ReceiverToken {
    set: ReceiverSet,
    key: ReceiverKey,
    generation: u64,
    token: CancellationToken,
}

impl ReceiverToken {
    pub fn key(&self) -> &ReceiverKey {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Drop for ReceiverToken {
    fn drop(&mut self) {
        self.set.finish(&self.key, self.generation);
    }
}

/// Drive `receive` until the token is cancelled or the socket is gone.
///
/// Every successful receive is handed to `handle`.
pub(crate) async fn receive_loop<R, Fut, M, H>(
    token: &ReceiverToken,
    backoff: Duration,
    mut receive: R,
    mut handle: H,
) -> LoopExit
where
    R: FnMut() -> Fut,
    Fut: Future<Output = TransportResult<M>>,
    H: FnMut(M),
{
    let name = token.key().to_string();
    info!("Receive loop started");

    let exit = loop {
        if token.is_cancelled() {
            break LoopExit::Stopped;
        }
        match receive().await {
            Ok(received) => handle(received),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Receive failed, retrying");
                metrics::record_receive_error(&name, true);
                tokio::select! {
                    _ = token.cancelled() => break LoopExit::Stopped,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => {
                metrics::record_receive_error(&name, false);
                if token.is_cancelled() {
                    debug!(error = %e, "Socket gone after stop");
                    break LoopExit::Stopped;
                }
                warn!(error = %e, "Socket unusable, leaving receive loop");
                break LoopExit::SocketLost(e);
            }
        }
    };

    info!(cancelled = token.is_cancelled(), "Receive loop stopped");
    exit
}

/// Run the receive loop for a PULL or SUB stream on one socket.
///
/// Returns when stopped or when the socket is lost; reconnecting is up to the
/// caller, which keeps the token.
pub async fn run_stream_receiver<T: Transport>(
    transport: Arc<T>,
    fanout: MessageFanout,
    key: SubscriptionKey,
    socket: SocketId,
    backoff: Duration,
    token: &ReceiverToken,
) -> LoopExit {
    let span = info_span!("receiver", subscription = %key, socket_id = socket);

    async move {
        let is_sub = key.topic().is_some();
        receive_loop(
            token,
            backoff,
            || {
                let transport = Arc::clone(&transport);
                async move {
                    if is_sub {
                        let delivered = transport.receive_subscription(socket).await?;
                        Ok::<_, TransportError>((Some(delivered.topic), delivered.message))
                    } else {
                        Ok((None, transport.receive(socket).await?))
                    }
                }
            },
            |(topic, message)| route(&fanout, &key, topic, message),
        )
        .await
    }
    .instrument(span)
    .await
}

/// Publish a received message to the stream it belongs to.
///
/// A SUB message tagged with another topic never lands under `key`. If a
/// stream for its topic is live on the same endpoint it goes there, otherwise
/// it is dropped.
fn route(fanout: &MessageFanout, key: &SubscriptionKey, topic: Option<String>, message: Message) {
    let target = match (key, topic) {
        (SubscriptionKey::Sub { endpoint, topic: wanted }, Some(got)) if &got != wanted => {
            let other = SubscriptionKey::sub(endpoint.clone(), got);
            if !fanout.contains(&other) {
                trace!(delivered = %other, "Dropping message for unsubscribed topic");
                metrics::record_message_dropped(&key.to_string(), "topic_mismatch");
                return;
            }
            other
        }
        _ => key.clone(),
    };

    match fanout.publish(&target, &message) {
        Some(listeners) => {
            trace!(subscription = %target, listeners, "Message published");
            metrics::record_message_received(&target.to_string());
        }
        None => {
            debug!(subscription = %target, "Stream torn down, dropping message");
            metrics::record_message_dropped(&target.to_string(), "no_stream");
        }
    }
}
