// SPDX-License-Identifier: MIT OR Apache-2.0
//! agentspy-backends
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Pluggable-backend interfaces for cross-cutting concerns the core
//! doesn't own: cache, session, and rate-limit state. Each is a capability
//! trait with an in-process implementation shipped here; Redis-backed
//! implementations are a drop-in alternative behind the same trait and are
//! out of scope for this repository.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// A key-value cache with per-entry TTL.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a value if present and not expired.
    async fn get(&self, key: &str) -> Option<String>;
    /// Insert or overwrite a value with the given time-to-live.
    async fn set(&self, key: &str, value: String, ttl: Duration);
    /// Remove a value, if present.
    async fn delete(&self, key: &str);
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// In-process [`Cache`] implementation. Expired entries are reaped lazily,
/// on the next `get` or `set` that touches them.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl InMemoryCache {
    /// Construct an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.inner.lock().await;
        match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut guard = self.inner.lock().await;
        guard.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.inner.lock().await.remove(key);
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A server-side session store keyed by an opaque session id.
#[async_trait]
pub trait Session: Send + Sync {
    /// Create a new session, returning its id.
    async fn create(&self, data: HashMap<String, String>, ttl: Duration) -> String;
    /// Fetch a session's data, if it exists and hasn't expired.
    async fn get(&self, session_id: &str) -> Option<HashMap<String, String>>;
    /// Destroy a session.
    async fn destroy(&self, session_id: &str);
}

struct SessionEntry {
    data: HashMap<String, String>,
    expires_at: Instant,
}

/// In-process [`Session`] implementation, ids minted from a process-local
/// counter composed with a random suffix to avoid collisions across
/// restarts within the same test run.
#[derive(Clone, Default)]
pub struct InMemorySession {
    inner: Arc<Mutex<HashMap<String, SessionEntry>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl InMemorySession {
    /// Construct an empty session store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn create(&self, data: HashMap<String, String>, ttl: Duration) -> String {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let session_id = format!("sess_{id:x}");
        self.inner.lock().await.insert(
            session_id.clone(),
            SessionEntry {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
        session_id
    }

    async fn get(&self, session_id: &str) -> Option<HashMap<String, String>> {
        let mut guard = self.inner.lock().await;
        match guard.get(session_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.data.clone()),
            Some(_) => {
                guard.remove(session_id);
                None
            }
            None => None,
        }
    }

    async fn destroy(&self, session_id: &str) {
        self.inner.lock().await.remove(session_id);
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// A sliding-window rate limiter, checked once per request.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Returns `true` if a call identified by `key` is allowed right now
    /// (and records it), `false` if the caller is over budget.
    async fn check(&self, key: &str) -> bool;
}

struct WindowState {
    timestamps: VecDeque<Instant>,
}

/// In-process sliding-window [`RateLimiter`], keyed (e.g. by API key or
/// remote address) so one noisy client doesn't exhaust another's budget.
#[derive(Clone)]
pub struct SlidingWindowRateLimiter {
    inner: Arc<Mutex<HashMap<String, WindowState>>>,
    max_requests: u32,
    window: Duration,
}

impl SlidingWindowRateLimiter {
    /// Create a limiter that allows `max_requests` within `window`, per key.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window,
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let state = guard.entry(key.to_string()).or_insert_with(|| WindowState {
            timestamps: VecDeque::new(),
        });

        while let Some(&front) = state.timestamps.front() {
            if now.duration_since(front) > self.window {
                state.timestamps.pop_front();
            } else {
                break;
            }
        }

        if state.timestamps.len() as u32 >= self.max_requests {
            return false;
        }

        state.timestamps.push_back(now);
        true
    }
}
