// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the messaging service.
//!
//! Configuration is passed to
//! [`MessagingService::new()`](crate::MessagingService::new) and can be
//! built programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use zmq_service::config::{EndpointConfig, MessagingConfig, SocketType};
//!
//! let config = MessagingConfig::for_testing()
//!     .with_endpoint("echo", EndpointConfig::new(5555, SocketType::Req))
//!     .with_endpoint("ticks", EndpointConfig::new(5556, SocketType::Sub).with_topics(["btc"]));
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MessagingConfig
//! ├── endpoints: { <key>: EndpointConfig }
//! │   ├── port: u16
//! │   ├── type: req|rep|pub|sub|router|dealer|push|pull
//! │   ├── identity?: String        # dealer sockets only
//! │   └── topics?: [String]
//! └── options: MessagingOptions
//!     ├── timeout: i64 (ms)        # REQ timeout and dealer warning timer
//!     ├── hostname: String         # tcp://<hostname>:<port>
//!     ├── cacheCapacity: usize     # backlog per subscription
//!     └── receiveBackoffMs: u64    # retry delay for receive loops
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "endpoints": {
//!     "echo":   { "port": 5555, "type": "req" },
//!     "jobs":   { "port": 5557, "type": "dealer", "identity": "ui-1" },
//!     "ticks":  { "port": 5556, "type": "sub", "topics": ["btc", "eth"] }
//!   },
//!   "options": { "timeout": 5000, "hostname": "localhost" }
//! }
//! ```

use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// SocketType: the eight messaging patterns an endpoint can speak
// ═══════════════════════════════════════════════════════════════════════════════

/// Socket pattern an endpoint is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    Req,
    Rep,
    Pub,
    Sub,
    Router,
    Dealer,
    Push,
    Pull,
}

impl SocketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Req => "req",
            Self::Rep => "rep",
            Self::Pub => "pub",
            Self::Sub => "sub",
            Self::Router => "router",
            Self::Dealer => "dealer",
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EndpointConfig: one logical channel
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a single named endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub port: u16,

    #[serde(rename = "type")]
    pub socket_type: SocketType,

    /// Routing identity. Only applied to dealer sockets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Topics this endpoint is expected to carry. Informational; the service
    /// subscribes to whatever topic a caller asks for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
}

impl EndpointConfig {
    pub fn new(port: u16, socket_type: SocketType) -> Self {
        Self {
            port,
            socket_type,
            identity: None,
            topics: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    /// Connect URL for this endpoint on the given host.
    pub fn url(&self, hostname: &str) -> String {
        format!("tcp://{}:{}", hostname, self.port)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MessagingOptions: process-wide knobs
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-wide options shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingOptions {
    /// Timeout in milliseconds.
    ///
    /// REQ: a non-positive value fires immediately (the exchange gets one
    /// poll before the deadline is checked). DEALER: the warning timer is
    /// only armed for positive values.
    #[serde(rename = "timeout", default = "default_timeout_ms")]
    pub timeout_ms: i64,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Messages retained per subscription for replay to late listeners.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Fixed delay before a receive loop retries after a transport error.
    #[serde(default = "default_receive_backoff_ms")]
    pub receive_backoff_ms: u64,
}

fn default_timeout_ms() -> i64 {
    5000
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_cache_capacity() -> usize {
    100
}

fn default_receive_backoff_ms() -> u64 {
    100
}

impl Default for MessagingOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            hostname: default_hostname(),
            cache_capacity: default_cache_capacity(),
            receive_backoff_ms: default_receive_backoff_ms(),
        }
    }
}

impl MessagingOptions {
    /// Deadline for a REQ exchange. Non-positive values map to zero.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(0) as u64)
    }

    /// Dealer warning timer, or `None` when disabled.
    pub fn dealer_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms as u64))
    }

    pub fn receive_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_backoff_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MessagingConfig: top-level structure
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `MessagingService::new()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,

    #[serde(default)]
    pub options: MessagingOptions,
}

impl MessagingConfig {
    /// Create an empty config with short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            endpoints: HashMap::new(),
            options: MessagingOptions {
                timeout_ms: 500,
                hostname: "127.0.0.1".to_string(),
                cache_capacity: default_cache_capacity(),
                receive_backoff_ms: 10,
            },
        }
    }

    pub fn with_endpoint(mut self, key: impl Into<String>, endpoint: EndpointConfig) -> Self {
        self.endpoints.insert(key.into(), endpoint);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.options.timeout_ms = timeout_ms;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.options.cache_capacity = capacity;
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.options.hostname.trim().is_empty() {
            return Err(MessagingError::Config("hostname must not be empty".into()));
        }
        if self.options.cache_capacity == 0 {
            return Err(MessagingError::Config("cacheCapacity must be at least 1".into()));
        }
        if let Some((key, _)) = self.endpoints.iter().find(|(_, e)| e.port == 0) {
            return Err(MessagingError::Config(format!("endpoint '{}' has port 0", key)));
        }
        Ok(())
    }

    pub fn endpoint(&self, key: &str) -> Option<&EndpointConfig> {
        self.endpoints.get(key)
    }

    /// Look up an endpoint and check it is configured for `expected`.
    pub fn endpoint_for(&self, key: &str, expected: SocketType) -> Result<&EndpointConfig> {
        let endpoint = self
            .endpoint(key)
            .ok_or_else(|| MessagingError::invalid_endpoint(key, "no such endpoint configured"))?;
        if endpoint.socket_type != expected {
            return Err(MessagingError::invalid_endpoint(
                key,
                format!("configured as {}, expected {}", endpoint.socket_type, expected),
            ));
        }
        Ok(endpoint)
    }
}
