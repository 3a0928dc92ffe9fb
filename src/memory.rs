// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory transport for tests and simulations.
//!
//! Each socket gets an unbounded inbox. Messages enter it through
//! [`MemoryTransport::deliver`] / [`MemoryTransport::deliver_topic`], or
//! through `send` when echo mode is on. Every state-changing call is recorded
//! as a [`TransportCall`] so tests can assert on exactly what the service did.
//!
//! No topic filtering happens here: a SUB socket sees whatever is delivered to
//! it, which is what makes receive-side filtering testable.
//!
//! # Fault injection
//!
//! - [`fail_next_sends`](MemoryTransport::fail_next_sends) /
//!   [`fail_next_receives`](MemoryTransport::fail_next_receives) /
//!   [`fail_next_connects`](MemoryTransport::fail_next_connects) /
//!   [`fail_next_subscribes`](MemoryTransport::fail_next_subscribes): the next
//!   N calls fail with a retryable backend error
//! - [`set_create_delay`](MemoryTransport::set_create_delay): socket creation
//!   suspends, widening race windows
//! - [`MemoryTransport::unavailable`]: reports the backend as missing

use crate::config::SocketType;
use crate::transport::{
    BoxFuture, Message, SocketId, SubscriptionMessage, Transport, TransportError, TransportResult,
};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Create { socket: SocketId, socket_type: SocketType },
    Connect { socket: SocketId, url: String },
    SetIdentity { socket: SocketId, identity: String },
    Send { socket: SocketId, message: Message },
    Subscribe { socket: SocketId, topic: String },
    Unsubscribe { socket: SocketId, topic: String },
    Close { socket: SocketId },
}

struct Inbound {
    topic: Option<String>,
    message: Message,
}

struct MemorySocket {
    socket_type: SocketType,
    url: Mutex<Option<String>>,
    identity: Mutex<Option<String>>,
    topics: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    closed: CancellationToken,
}

impl MemorySocket {
    fn new(socket_type: SocketType) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            socket_type,
            url: Mutex::new(None),
            identity: Mutex::new(None),
            topics: Mutex::new(HashSet::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Wait for the next inbound item, failing if the socket closes first.
    async fn next(&self, id: SocketId) -> TransportResult<Inbound> {
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed(id)),
            guard = self.rx.lock() => guard,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed(id)),
            item = rx.recv() => item.ok_or(TransportError::Closed(id)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consume one pending fault from `counter`, if any.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-process [`Transport`] implementation.
pub struct MemoryTransport {
    available: bool,
    echo: AtomicBool,
    next_id: AtomicU64,
    sockets: DashMap<SocketId, Arc<MemorySocket>>,
    calls: Mutex<Vec<TransportCall>>,
    create_delay: Mutex<Duration>,
    fail_sends: AtomicUsize,
    fail_receives: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_subscribes: AtomicUsize,
    receive_failures: AtomicUsize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            available: true,
            echo: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            sockets: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            create_delay: Mutex::new(Duration::ZERO),
            fail_sends: AtomicUsize::new(0),
            fail_receives: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
            fail_subscribes: AtomicUsize::new(0),
            receive_failures: AtomicUsize::new(0),
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message sent on a socket is queued back onto that socket's inbox.
    pub fn echo() -> Self {
        let transport = Self::default();
        transport.set_echo(true);
        transport
    }

    /// A transport that reports itself unavailable.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    pub fn set_echo(&self, enabled: bool) {
        self.echo.store(enabled, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = delay;
    }

    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_receives(&self, n: usize) {
        self.fail_receives.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.fail_subscribes.store(n, Ordering::SeqCst);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Injection
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue a message for a plain `receive` on `socket`.
    pub fn deliver(&self, socket: SocketId, message: Message) -> TransportResult<()> {
        self.enqueue(socket, Inbound { topic: None, message })
    }

    /// Queue a topic-tagged message for `receive_subscription` on `socket`.
    pub fn deliver_topic(
        &self,
        socket: SocketId,
        topic: impl Into<String>,
        message: Message,
    ) -> TransportResult<()> {
        self.enqueue(
            socket,
            Inbound {
                topic: Some(topic.into()),
                message,
            },
        )
    }

    fn enqueue(&self, socket: SocketId, inbound: Inbound) -> TransportResult<()> {
        let entry = self.get(socket)?;
        entry
            .tx
            .send(inbound)
            .map_err(|_| TransportError::Closed(socket))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    pub fn create_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Create { .. }))
    }

    pub fn close_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Close { .. }))
    }

    pub fn send_count(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Send { .. }))
    }

    pub fn subscribe_count(&self, socket: SocketId, topic: &str) -> usize {
        self.count(|c| matches!(c, TransportCall::Subscribe { socket: s, topic: t } if *s == socket && t == topic))
    }

    pub fn unsubscribe_count(&self, socket: SocketId, topic: &str) -> usize {
        self.count(|c| matches!(c, TransportCall::Unsubscribe { socket: s, topic: t } if *s == socket && t == topic))
    }

    /// Messages sent on `socket`, in order.
    pub fn sent_to(&self, socket: SocketId) -> Vec<Message> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                TransportCall::Send { socket: s, message } if *s == socket => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of receive calls that failed, injected or not.
    pub fn receive_failures(&self) -> usize {
        self.receive_failures.load(Ordering::SeqCst)
    }

    pub fn is_open(&self, socket: SocketId) -> bool {
        self.sockets.contains_key(&socket)
    }

    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    pub fn socket_type_of(&self, socket: SocketId) -> Option<SocketType> {
        self.sockets.get(&socket).map(|s| s.socket_type)
    }

    pub fn url_of(&self, socket: SocketId) -> Option<String> {
        self.sockets.get(&socket).and_then(|s| lock(&s.url).clone())
    }

    pub fn identity_of(&self, socket: SocketId) -> Option<String> {
        self.sockets.get(&socket).and_then(|s| lock(&s.identity).clone())
    }

    pub fn topics_of(&self, socket: SocketId) -> HashSet<String> {
        self.sockets
            .get(&socket)
            .map(|s| lock(&s.topics).clone())
            .unwrap_or_default()
    }

    fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }

    fn get(&self, socket: SocketId) -> TransportResult<Arc<MemorySocket>> {
        self.sockets
            .get(&socket)
            .map(|s| Arc::clone(s.value()))
            .ok_or(TransportError::UnknownSocket(socket))
    }

    fn receive_fault(&self) -> TransportResult<()> {
        if take_fault(&self.fail_receives) {
            self.receive_failures.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Backend("injected receive failure".into()));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn is_available(&self) -> bool {
        self.available
    }

    fn create_socket(&self, socket_type: SocketType) -> BoxFuture<'_, SocketId> {
        Box::pin(async move {
            let delay = *lock(&self.create_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let socket = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.sockets
                .insert(socket, Arc::new(MemorySocket::new(socket_type)));
            self.record(TransportCall::Create { socket, socket_type });
            Ok(socket)
        })
    }

    fn connect<'a>(&'a self, socket: SocketId, url: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let entry = self.get(socket)?;
            if take_fault(&self.fail_connects) {
                return Err(TransportError::Backend(format!("connection refused: {}", url)));
            }
            *lock(&entry.url) = Some(url.to_string());
            self.record(TransportCall::Connect {
                socket,
                url: url.to_string(),
            });
            Ok(())
        })
    }

    fn set_identity<'a>(&'a self, socket: SocketId, identity: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let entry = self.get(socket)?;
            *lock(&entry.identity) = Some(identity.to_string());
            self.record(TransportCall::SetIdentity {
                socket,
                identity: identity.to_string(),
            });
            Ok(())
        })
    }

    fn send(&self, socket: SocketId, message: Message) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let entry = self.get(socket)?;
            if take_fault(&self.fail_sends) {
                return Err(TransportError::Backend("injected send failure".into()));
            }
            self.record(TransportCall::Send {
                socket,
                message: message.clone(),
            });
            if self.echo.load(Ordering::SeqCst) {
                entry
                    .tx
                    .send(Inbound { topic: None, message })
                    .map_err(|_| TransportError::Closed(socket))?;
            }
            Ok(())
        })
    }

    fn receive(&self, socket: SocketId) -> BoxFuture<'_, Message> {
        Box::pin(async move {
            let entry = self.get(socket)?;
            self.receive_fault()?;
            let inbound = entry.next(socket).await?;
            Ok(inbound.message)
        })
    }

    fn subscribe<'a>(&'a self, socket: SocketId, topic: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let entry = self.get(socket)?;
            if take_fault(&self.fail_subscribes) {
                return Err(TransportError::Backend(format!("subscribe to {} refused", topic)));
            }
            lock(&entry.topics).insert(topic.to_string());
            self.record(TransportCall::Subscribe {
                socket,
                topic: topic.to_string(),
            });
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, socket: SocketId, topic: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let entry = self.get(socket)?;
            lock(&entry.topics).remove(topic);
            self.record(TransportCall::Unsubscribe {
                socket,
                topic: topic.to_string(),
            });
            Ok(())
        })
    }

    fn receive_subscription(&self, socket: SocketId) -> BoxFuture<'_, SubscriptionMessage> {
        Box::pin(async move {
            let entry = self.get(socket)?;
            self.receive_fault()?;
            let inbound = entry.next(socket).await?;
            Ok(SubscriptionMessage::new(
                inbound.topic.unwrap_or_default(),
                inbound.message,
            ))
        })
    }

    fn close(&self, socket: SocketId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let (_, entry) = self
                .sockets
                .remove(&socket)
                .ok_or(TransportError::UnknownSocket(socket))?;
            entry.closed.cancel();
            self.record(TransportCall::Close { socket });
            Ok(())
        })
    }
}
