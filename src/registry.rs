// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Socket registry: one socket per endpoint key.
//!
//! Creation is serialized per key through a lazily created async mutex, so
//! concurrent callers for the same key never race to open two sockets while
//! callers for different keys proceed independently.
//!
//! ```text
//! acquire(key, type)
//!   │
//!   ├─ lock(key) ──► cached handle with same type? ──yes──► return it
//!   │                        │ no
//!   │                        ▼
//!   │               close old handle (if any)
//!   │               create ─► set identity (dealer) ─► connect tcp://host:port
//!   │                        │
//!   └────────────────────────┴──► cache + return
//! ```

use crate::config::{MessagingConfig, SocketType};
use crate::error::{MessagingError, Result};
use crate::metrics;
use crate::transport::{SocketId, Transport};
use dashmap::DashMap;
use futures::future::join_all;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lazily created async mutex per key.
///
/// Locks are created through the map's entry API, so two tasks asking for the
/// same key always get the same lock.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Drop the lock for `key` unless another task still holds a clone of it.
    ///
    /// Callers must release their own clone first.
    pub fn prune(&self, key: &K) {
        self.locks.remove_if(key, |_, l| Arc::strong_count(l) == 1);
    }

    /// Drop every lock no task is holding or waiting on.
    pub fn prune_idle(&self) {
        self.locks.retain(|_, l| Arc::strong_count(l) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// A live socket owned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle {
    pub id: SocketId,
    pub socket_type: SocketType,
}

/// Owns every socket the service opens.
pub struct SocketRegistry<T: Transport> {
    config: Arc<MessagingConfig>,
    transport: Arc<T>,
    initialized: bool,
    sockets: DashMap<String, SocketHandle>,
    locks: KeyedLocks<String>,
}

impl<T: Transport> SocketRegistry<T> {
    pub fn new(config: Arc<MessagingConfig>, transport: Arc<T>, initialized: bool) -> Self {
        Self {
            config,
            transport,
            initialized,
            sockets: DashMap::new(),
            locks: KeyedLocks::default(),
        }
    }

    /// Return the socket for `key`, creating or replacing it as needed.
    pub async fn acquire(&self, key: &str, socket_type: SocketType) -> Result<SocketHandle> {
        if !self.initialized {
            return Err(MessagingError::NotInitialized);
        }
        let endpoint = self
            .config
            .endpoint(key)
            .ok_or_else(|| MessagingError::invalid_endpoint(key, "no such endpoint configured"))?;

        let lock = self.locks.lock_for(&key.to_string());
        let _guard = lock.lock().await;

        if let Some(existing) = self.current(key) {
            if existing.socket_type == socket_type {
                return Ok(existing);
            }
            info!(
                endpoint = %key,
                socket_id = existing.id,
                from = %existing.socket_type,
                to = %socket_type,
                "Socket type changed, replacing socket"
            );
            self.sockets.remove(key);
            self.close_socket(key, existing.id, "type_change").await;
        }

        let id = self
            .transport
            .create_socket(socket_type)
            .await
            .map_err(|e| MessagingError::transport("create_socket", e))?;

        let url = endpoint.url(&self.config.options.hostname);
        let identity = match socket_type {
            SocketType::Dealer => endpoint.identity.as_deref(),
            _ => None,
        };
        if let Err(e) = self.configure(id, identity, &url).await {
            warn!(endpoint = %key, socket_id = id, error = %e, "Socket setup failed, closing");
            if let Err(close_err) = self.transport.close(id).await {
                debug!(socket_id = id, error = %close_err, "Close after failed setup also failed");
            }
            return Err(e);
        }

        let handle = SocketHandle { id, socket_type };
        self.sockets.insert(key.to_string(), handle);
        metrics::record_socket_created(key, socket_type.as_str());
        metrics::set_open_sockets(self.sockets.len());
        info!(endpoint = %key, socket_id = id, socket_type = %socket_type, url = %url, "Socket connected");
        Ok(handle)
    }

    async fn configure(&self, id: SocketId, identity: Option<&str>, url: &str) -> Result<()> {
        if let Some(identity) = identity {
            self.transport
                .set_identity(id, identity)
                .await
                .map_err(|e| MessagingError::transport("set_identity", e))?;
        }
        self.transport
            .connect(id, url)
            .await
            .map_err(|e| MessagingError::transport("connect", e))
    }

    /// Close the socket for `key` and forget it, so the next `acquire` starts fresh.
    pub async fn release(&self, key: &str) {
        let key_owned = key.to_string();
        let lock = self.locks.lock_for(&key_owned);
        {
            let _guard = lock.lock().await;
            if let Some((_, handle)) = self.sockets.remove(key) {
                warn!(endpoint = %key, socket_id = handle.id, "Force-closing socket");
                self.close_socket(key, handle.id, "release").await;
                metrics::set_open_sockets(self.sockets.len());
            }
        }
        drop(lock);
        self.locks.prune(&key_owned);
    }

    /// Close `socket` if it is still the one held for `key`.
    ///
    /// Used when a receive loop finds its socket dead. A socket that has
    /// already been replaced is left alone, as is its successor.
    pub async fn release_socket(&self, key: &str, socket: SocketId) {
        let key_owned = key.to_string();
        let lock = self.locks.lock_for(&key_owned);
        {
            let _guard = lock.lock().await;
            if self.sockets.remove_if(key, |_, h| h.id == socket).is_some() {
                warn!(endpoint = %key, socket_id = socket, "Releasing dead socket");
                self.close_socket(key, socket, "lost").await;
                metrics::set_open_sockets(self.sockets.len());
            }
        }
        drop(lock);
        self.locks.prune(&key_owned);
    }

    /// Close every socket. Returns how many were closed.
    ///
    /// Each key's lock is taken before its socket is dropped, so an
    /// `acquire` already in flight either finishes first or starts over
    /// under the same lock.
    pub async fn close_all(&self) -> usize {
        let keys: Vec<String> = self.sockets.iter().map(|e| e.key().clone()).collect();

        let closes = keys.iter().map(|key| async move {
            let lock = self.locks.lock_for(key);
            let _guard = lock.lock().await;
            match self.sockets.remove(key) {
                Some((_, handle)) => {
                    self.close_socket(key, handle.id, "cleanup").await;
                    true
                }
                None => false,
            }
        });
        let closed = join_all(closes).await.into_iter().filter(|c| *c).count();

        self.locks.prune_idle();
        metrics::set_open_sockets(self.sockets.len());
        closed
    }

    pub fn current(&self, key: &str) -> Option<SocketHandle> {
        self.sockets.get(key).map(|h| *h)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    async fn close_socket(&self, key: &str, id: SocketId, reason: &'static str) {
        match self.transport.close(id).await {
            Ok(()) => debug!(endpoint = %key, socket_id = id, reason, "Socket closed"),
            Err(e) => warn!(endpoint = %key, socket_id = id, error = %e, "Socket close failed"),
        }
        metrics::record_socket_closed(key, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::memory::{MemoryTransport, TransportCall};
    use std::time::Duration;

    fn registry(transport: Arc<MemoryTransport>) -> SocketRegistry<MemoryTransport> {
        let config = MessagingConfig::for_testing()
            .with_endpoint("echo", EndpointConfig::new(5555, SocketType::Req))
            .with_endpoint("work", EndpointConfig::new(5560, SocketType::Dealer).with_identity("client-a"))
            .with_endpoint("feed", EndpointConfig::new(5561, SocketType::Push).with_identity("ignored"));
        SocketRegistry::new(Arc::new(config), transport, true)
    }

    #[tokio::test]
    async fn test_acquire_reuses_same_type() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = registry(Arc::clone(&transport));

        let a = registry.acquire("echo", SocketType::Req).await.unwrap();
        let b = registry.acquire("echo", SocketType::Req).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(transport.create_count(), 1);
        assert_eq!(transport.url_of(a.id).as_deref(), Some("tcp://127.0.0.1:5555"));
    }

    #[tokio::test]
    async fn test_acquire_type_change_replaces_socket() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = registry(Arc::clone(&transport));

        let a = registry.acquire("echo", SocketType::Req).await.unwrap();
        let b = registry.acquire("echo", SocketType::Dealer).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(!transport.is_open(a.id));
        assert!(transport.is_open(b.id));
        assert_eq!(registry.current("echo"), Some(b));
    }

    #[tokio::test]
    async fn test_dealer_identity_set_before_connect() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = registry(Arc::clone(&transport));

        let handle = registry.acquire("work", SocketType::Dealer).await.unwrap();
        let calls = transport.calls();
        assert_eq!(
            calls[1..],
            [
                TransportCall::SetIdentity { socket: handle.id, identity: "client-a".into() },
                TransportCall::Connect { socket: handle.id, url: "tcp://127.0.0.1:5560".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_identity_ignored_for_non_dealer() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = registry(Arc::clone(&transport));

        let handle = registry.acquire("feed", SocketType::Push).await.unwrap();
        assert_eq!(transport.identity_of(handle.id), None);
    }

    #[tokio::test]
    async fn test_not_initialized_and_unknown_key() {
        let transport = Arc::new(MemoryTransport::new());
        let config = Arc::new(MessagingConfig::for_testing());
        let uninit = SocketRegistry::new(Arc::clone(&config), Arc::clone(&transport), false);
        assert!(matches!(
            uninit.acquire("echo", SocketType::Req).await,
            Err(MessagingError::NotInitialized)
        ));

        let registry = registry(Arc::clone(&transport));
        assert!(matches!(
            registry.acquire("nope", SocketType::Req).await,
            Err(MessagingError::InvalidEndpoint { .. })
        ));
        assert_eq!(transport.create_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_creates_once() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_create_delay(Duration::from_millis(50));
        let registry = Arc::new(registry(Arc::clone(&transport)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&registry);
                tokio::spawn(async move { r.acquire("echo", SocketType::Req).await.unwrap() })
            })
            .collect();

        let handles: Vec<SocketHandle> = join_all(tasks).await.into_iter().map(|h| h.unwrap()).collect();
        assert!(handles.iter().all(|h| *h == handles[0]));
        assert_eq!(transport.create_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_new_socket() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = registry(Arc::clone(&transport));

        transport.fail_next_connects(1);
        let err = registry.acquire("echo", SocketType::Req).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.open_sockets(), 0);
        assert!(registry.current("echo").is_none());

        assert!(registry.acquire("echo", SocketType::Req).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_forces_fresh_socket() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = registry(Arc::clone(&transport));

        let a = registry.acquire("echo", SocketType::Req).await.unwrap();
        registry.release("echo").await;
        assert!(!transport.is_open(a.id));
        assert!(registry.is_empty());

        let b = registry.acquire("echo", SocketType::Req).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(transport.create_count(), 2);
    }

    #[tokio::test]
    async fn test_close_all() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = registry(Arc::clone(&transport));

        registry.acquire("echo", SocketType::Req).await.unwrap();
        registry.acquire("feed", SocketType::Push).await.unwrap();
        assert_eq!(registry.close_all().await, 2);
        assert_eq!(transport.open_sockets(), 0);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.close_all().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all_during_acquire_keeps_one_lock() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_create_delay(Duration::from_millis(50));
        let registry = Arc::new(registry(Arc::clone(&transport)));

        let first = tokio::spawn({
            let r = Arc::clone(&registry);
            async move { r.acquire("echo", SocketType::Req).await.unwrap() }
        });
        tokio::task::yield_now().await;

        // The in-flight acquire holds the key's lock; cleanup must not orphan it.
        assert_eq!(registry.close_all().await, 0);
        let second = tokio::spawn({
            let r = Arc::clone(&registry);
            async move { r.acquire("echo", SocketType::Req).await.unwrap() }
        });

        let (a, b) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(a, b);
        assert_eq!(transport.create_count(), 1);
    }

    #[tokio::test]
    async fn test_release_socket_only_closes_matching_handle() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = registry(Arc::clone(&transport));

        let old = registry.acquire("echo", SocketType::Req).await.unwrap();
        registry.release_socket("echo", old.id).await;
        assert!(registry.current("echo").is_none());
        assert!(!transport.is_open(old.id));

        let fresh = registry.acquire("echo", SocketType::Req).await.unwrap();
        registry.release_socket("echo", old.id).await;
        assert_eq!(registry.current("echo"), Some(fresh));
        assert!(transport.is_open(fresh.id));
    }

    #[tokio::test]
    async fn test_keyed_locks_prune_idle_keeps_held() {
        let locks: KeyedLocks<String> = KeyedLocks::default();
        let held = locks.lock_for(&"a".to_string());
        drop(locks.lock_for(&"b".to_string()));

        locks.prune_idle();
        assert_eq!(locks.len(), 1);
        assert!(Arc::ptr_eq(&held, &locks.lock_for(&"a".to_string())));
    }

    #[tokio::test]
    async fn test_keyed_locks_share_and_prune() {
        let locks: KeyedLocks<String> = KeyedLocks::default();
        let a = locks.lock_for(&"k".to_string());
        let b = locks.lock_for(&"k".to_string());
        assert!(Arc::ptr_eq(&a, &b));

        let guard = a.lock().await;
        assert!(b.try_lock().is_err());
        drop(guard);

        locks.prune(&"k".to_string());
        assert_eq!(locks.len(), 1, "still referenced by a and b");
        drop(a);
        drop(b);
        locks.prune(&"k".to_string());
        assert!(locks.is_empty());
    }
}
