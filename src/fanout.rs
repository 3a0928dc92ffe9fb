// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message cache and fan-out per subscription.
//!
//! Each [`SubscriptionKey`] owns a bounded backlog of the most recent messages
//! and a set of listeners. Publishing appends to the backlog (evicting the
//! oldest when full) and calls every listener outside the map lock.
//!
//! # Replay
//!
//! A listener attached while a backlog exists is replayed that backlog on a
//! spawned task. Until the replay finishes, live messages for that listener
//! are queued behind it, so it always sees backlog first, then live traffic,
//! in receive order.
//!
//! # Listener failures
//!
//! A panicking listener is caught, logged and counted. Other listeners and the
//! publisher are unaffected.

use crate::metrics;
use crate::transport::Message;
use dashmap::DashMap;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Callback invoked for every message on a subscription.
pub type MessageListener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identifies one attached listener.
pub type ListenerId = u64;

/// A logical receive stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKey {
    /// `pull:<endpoint>`
    Pull { endpoint: String },
    /// `sub:<endpoint>:<topic>`
    Sub { endpoint: String, topic: String },
}

impl SubscriptionKey {
    pub fn pull(endpoint: impl Into<String>) -> Self {
        Self::Pull {
            endpoint: endpoint.into(),
        }
    }

    pub fn sub(endpoint: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::Sub {
            endpoint: endpoint.into(),
            topic: topic.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            Self::Pull { endpoint } | Self::Sub { endpoint, .. } => endpoint,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Pull { .. } => None,
            Self::Sub { topic, .. } => Some(topic),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pull { endpoint } => write!(f, "pull:{}", endpoint),
            Self::Sub { endpoint, topic } => write!(f, "sub:{}:{}", endpoint, topic),
        }
    }
}

/// Result of [`MessageFanout::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub id: ListenerId,
    /// No other listener was attached to this key.
    pub first: bool,
    /// Backlog size scheduled for replay.
    pub replayed: usize,
}

/// Result of [`MessageFanout::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// Listener removed; this many remain.
    Remaining(usize),
    /// Listener removed and the stream torn down.
    LastListener,
    /// No such listener.
    NotFound,
}

struct ListenerSlot {
    callback: MessageListener,
    /// Live messages held back while the backlog replay is in flight.
    pending: Option<VecDeque<Message>>,
}

#[derive(Default)]
struct StreamState {
    backlog: VecDeque<Message>,
    listeners: BTreeMap<ListenerId, ListenerSlot>,
}

/// Backlogs and listener sets for every live subscription.
#[derive(Clone)]
pub struct MessageFanout {
    streams: Arc<DashMap<SubscriptionKey, StreamState>>,
    capacity: usize,
    next_id: Arc<AtomicU64>,
}

impl MessageFanout {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a listener. A non-empty backlog is replayed to it asynchronously.
    ///
    /// Must be called from within a Tokio runtime when a backlog may exist.
    pub fn attach(&self, key: &SubscriptionKey, listener: MessageListener) -> Attachment {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (first, backlog) = {
            let mut state = self.streams.entry(key.clone()).or_default();
            let first = state.listeners.is_empty();
            let backlog: Vec<Message> = state.backlog.iter().cloned().collect();
            let pending = (!backlog.is_empty()).then(VecDeque::new);
            state.listeners.insert(
                id,
                ListenerSlot {
                    callback: Arc::clone(&listener),
                    pending,
                },
            );
            (first, backlog)
        };

        let replayed = backlog.len();
        if replayed > 0 {
            debug!(subscription = %key, listener = id, replayed, "Replaying backlog");
            let fanout = self.clone();
            let key = key.clone();
            tokio::spawn(async move { fanout.replay(key, id, listener, backlog) });
        }

        Attachment { id, first, replayed }
    }

    fn replay(&self, key: SubscriptionKey, id: ListenerId, listener: MessageListener, backlog: Vec<Message>) {
        let source = key.to_string();
        for message in &backlog {
            invoke_guarded(&listener, message, &source);
        }
        // Drain live messages that arrived during replay, then switch the
        // slot to direct delivery.
        loop {
            let next = {
                let Some(mut state) = self.streams.get_mut(&key) else {
                    return;
                };
                let Some(slot) = state.listeners.get_mut(&id) else {
                    return;
                };
                match slot.pending.as_mut().and_then(VecDeque::pop_front) {
                    Some(message) => message,
                    None => {
                        slot.pending = None;
                        return;
                    }
                }
            };
            invoke_guarded(&listener, &next, &source);
        }
    }

    /// Cache `message` and deliver it to every listener of `key`.
    ///
    /// Returns `None` when the key has no stream (nothing is cached), or the
    /// number of listeners the message was handed to.
    pub fn publish(&self, key: &SubscriptionKey, message: &Message) -> Option<usize> {
        let (live, queued) = {
            let mut state = self.streams.get_mut(key)?;
            while state.backlog.len() >= self.capacity {
                state.backlog.pop_front();
            }
            state.backlog.push_back(message.clone());

            let mut live: Vec<MessageListener> = Vec::with_capacity(state.listeners.len());
            let mut queued = 0usize;
            for slot in state.listeners.values_mut() {
                match slot.pending.as_mut() {
                    Some(pending) => {
                        pending.push_back(message.clone());
                        queued += 1;
                    }
                    None => live.push(Arc::clone(&slot.callback)),
                }
            }
            if queued > 0 {
                debug!(subscription = %key, queued, "Queued behind replay");
            }
            (live, queued)
        };

        let source = key.to_string();
        for listener in &live {
            invoke_guarded(listener, message, &source);
        }
        Some(live.len() + queued)
    }

    /// Remove a listener. The stream is torn down with its last listener.
    pub fn detach(&self, key: &SubscriptionKey, id: ListenerId) -> Detach {
        let mut found = false;
        let mut remaining = 0usize;
        let removed = self.streams.remove_if_mut(key, |_, state| {
            found = state.listeners.remove(&id).is_some();
            remaining = state.listeners.len();
            remaining == 0
        });

        match (found, removed.is_some()) {
            (false, _) => Detach::NotFound,
            (true, true) => {
                debug!(subscription = %key, "Last listener detached, stream torn down");
                Detach::LastListener
            }
            (true, false) => Detach::Remaining(remaining),
        }
    }

    /// Snapshot of the cached backlog, oldest first.
    pub fn backlog(&self, key: &SubscriptionKey) -> Vec<Message> {
        self.streams
            .get(key)
            .map(|s| s.backlog.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.streams.get(key).map(|s| s.listeners.len()).unwrap_or(0)
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.streams.contains_key(key)
    }

    /// `(key, listeners, backlog)` for every live stream, sorted by key.
    pub fn snapshot(&self) -> Vec<(SubscriptionKey, usize, usize)> {
        let mut out: Vec<_> = self
            .streams
            .iter()
            .map(|e| (e.key().clone(), e.listeners.len(), e.backlog.len()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drop every stream, backlog and listener.
    pub fn clear(&self) {
        self.streams.clear();
    }
}

/// Call `listener`, containing any panic. Returns false if it panicked.
pub(crate) fn invoke_guarded(listener: &MessageListener, message: &Message, source: &str) -> bool {
    match catch_unwind(AssertUnwindSafe(|| listener(message))) {
        Ok(()) => true,
        Err(panic) => {
            error!(source, panic = %panic_message(panic.as_ref()), "Listener panicked");
            metrics::record_listener_failure(source);
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
