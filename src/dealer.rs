// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dealer request correlation.
//!
//! Many requests share one dealer socket. Each is registered under its
//! caller-supplied `requestId`, and a single receive loop per endpoint routes
//! responses back by that id.
//!
//! ```text
//! Send:
//!   1. register(requestId, callback)     last writer wins
//!   2. start endpoint loop (idempotent)
//!   3. arm warning timer (timeout > 0)
//!   4. transport send
//!
//! Response:
//!   5. loop receives message
//!   6. remove pending[requestId]         unknown id: warn + drop
//!   7. abort timer, invoke callback once
//!
//! Timeout:
//!   6'. warn + count; entry stays so a late response still lands
//! ```

use crate::fanout::{invoke_guarded, MessageListener};
use crate::metrics;
use crate::receiver::{receive_loop, LoopExit, ReceiverToken};
use crate::transport::{request_id_of, Message, SocketId, Transport};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::{debug, info_span, warn, Instrument};

/// Callback invoked with a dealer response.
pub type ResponseCallback = MessageListener;

struct PendingDealerRequest {
    endpoint: String,
    callback: ResponseCallback,
    timer: Option<AbortHandle>,
    sent_at: Instant,
}

impl PendingDealerRequest {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// In-flight dealer requests keyed by `requestId`.
#[derive(Clone, Default)]
pub struct DealerCorrelator {
    pending: Arc<DashMap<String, PendingDealerRequest>>,
}

impl DealerCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `request_id`.
    ///
    /// An existing entry for the same id is replaced and its timer aborted.
    /// Returns true if an entry was replaced.
    pub fn register(&self, endpoint: &str, request_id: &str, callback: ResponseCallback) -> bool {
        let previous = self.pending.insert(
            request_id.to_string(),
            PendingDealerRequest {
                endpoint: endpoint.to_string(),
                callback,
                timer: None,
                sent_at: Instant::now(),
            },
        );
        metrics::set_pending_dealer_requests(self.pending.len());

        match previous {
            Some(mut previous) => {
                previous.disarm();
                debug!(endpoint, request_id, "Replaced pending dealer request");
                true
            }
            None => false,
        }
    }

    /// Arm the warning timer for `request_id`, replacing any earlier one.
    ///
    /// On expiry the timeout is logged and counted. The entry is left in
    /// place so a late response still reaches its callback.
    pub fn arm_timeout(&self, request_id: &str, timeout: Duration) {
        let Some(mut entry) = self.pending.get_mut(request_id) else {
            return;
        };
        let endpoint = entry.endpoint.clone();
        let id = request_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(
                endpoint = %endpoint,
                request_id = %id,
                timeout_ms = timeout.as_millis() as u64,
                "Dealer request timed out, still awaiting response"
            );
            metrics::record_dealer_timeout(&endpoint);
        })
        .abort_handle();

        entry.disarm();
        entry.timer = Some(timer);
    }

    /// Forget `request_id`. Returns false if it was not pending.
    pub fn cancel(&self, request_id: &str) -> bool {
        let removed = self.pending.remove(request_id);
        metrics::set_pending_dealer_requests(self.pending.len());
        match removed {
            Some((_, mut request)) => {
                request.disarm();
                debug!(endpoint = %request.endpoint, request_id, "Dealer request cancelled");
                true
            }
            None => false,
        }
    }

    /// Route a response to its pending request.
    ///
    /// The entry is removed before the callback runs, so each request is
    /// answered at most once. Returns false if the response was dropped.
    pub fn dispatch(&self, endpoint: &str, message: Message) -> bool {
        let Some(request_id) = request_id_of(&message) else {
            warn!(endpoint, "Dealer response without requestId, dropping");
            metrics::record_dealer_response(endpoint, false);
            return false;
        };

        let Some((request_id, mut request)) = self.pending.remove(request_id) else {
            warn!(endpoint, request_id, "Dealer response for unknown requestId, dropping");
            metrics::record_dealer_response(endpoint, false);
            return false;
        };
        request.disarm();
        metrics::set_pending_dealer_requests(self.pending.len());
        metrics::record_dealer_response(endpoint, true);
        debug!(
            endpoint,
            request_id = %request_id,
            elapsed_ms = request.sent_at.elapsed().as_millis() as u64,
            "Dealer response matched"
        );

        invoke_guarded(&request.callback, &message, endpoint);
        true
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending request and abort its timer.
    pub fn clear(&self) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut cleared = 0;
        for id in ids {
            if let Some((_, mut request)) = self.pending.remove(&id) {
                request.disarm();
                cleared += 1;
            }
        }
        metrics::set_pending_dealer_requests(0);
        cleared
    }
}

/// Run the shared response loop for one dealer endpoint.
///
/// The token is released when this returns, so the next send on the endpoint
/// starts a fresh loop.
pub async fn run_dealer_receiver<T: Transport>(
    transport: Arc<T>,
    correlator: DealerCorrelator,
    endpoint: String,
    socket: SocketId,
    backoff: Duration,
    token: ReceiverToken,
) -> LoopExit {
    let span = info_span!("dealer_receiver", endpoint = %endpoint, socket_id = socket);

    async move {
        receive_loop(
            &token,
            backoff,
            || {
                let transport = Arc::clone(&transport);
                async move { transport.receive(socket).await }
            },
            |message| {
                correlator.dispatch(&endpoint, message);
            },
        )
        .await
    }
    .instrument(span)
    .await
}
