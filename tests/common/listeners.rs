// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recording listeners.
//!
//! A [`Recorder`] hands out closures that push every message they see, in
//! order, so tests can assert on exactly what a listener received.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use zmq_service::Message;

#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Message>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener closure feeding this recorder.
    pub fn listener(&self) -> impl Fn(&Message) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |m: &Message| seen.lock().unwrap().push(m.clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    #[allow(dead_code)] // Used by chaos tests only
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Counts invocations without keeping the messages.
#[derive(Clone, Default)]
#[allow(dead_code)] // Used by integration tests only
pub struct Counter {
    hits: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> impl Fn(&Message) + Send + Sync + 'static {
        let hits = Arc::clone(&self.hits);
        move |_m: &Message| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}
