//! Per-identity token cache with sliding TTL
//!
//! Maps an [`IdentityKey`] to the downstream tokens obtained for it, one
//! [`TokenRecord`] per scope. Every write refreshes the entry's TTL clock;
//! an entry not written within the TTL is treated as absent on read and
//! removed either lazily or by the background sweep.
//!
//! The TTL is independent of each token's own `expires_at`: the engine
//! applies token expiry, the cache only bounds how long an idle session
//! stays in memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;

use super::identity::IdentityKey;

/// Default session TTL (one hour since last write)
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Current Unix time in seconds
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A downstream token obtained for one (identity, scope) pair
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Access token presented to the upstream API
    pub access_token: String,
    /// Refresh token, when the identity provider issued one
    pub refresh_token: Option<String>,
    /// Expiry (Unix timestamp, seconds)
    pub expires_at: u64,
}

impl TokenRecord {
    /// Build a record from a grant response received at `now`
    #[must_use]
    pub fn issued(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: u64,
        now: u64,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: now.saturating_add(expires_in),
        }
    }

    /// Seconds left before expiry (negative once expired)
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn seconds_remaining(&self, now: u64) -> i64 {
        self.expires_at as i64 - now as i64
    }

    /// Whether the token outlives the drift window and may be reused as-is
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn is_reusable(&self, now: u64, drift: Duration) -> bool {
        self.seconds_remaining(now) > drift.as_secs() as i64
    }

    /// Whether the token is past its expiry
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.seconds_remaining(now) <= 0
    }
}

// Tokens never end up in logs
impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// All tokens held for one identity
struct SessionEntry {
    /// Token per scope
    tokens: HashMap<String, TokenRecord>,
    /// Last write
    written_at: Instant,
}

impl SessionEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.written_at.elapsed() >= ttl
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Process-wide session cache, safe for concurrent use
pub struct SessionCache {
    /// Session entries keyed by identity
    entries: DashMap<IdentityKey, SessionEntry>,
    /// Sliding time-to-live per entry
    ttl: Duration,
    stats: CacheStats,
}

impl SessionCache {
    /// Create an empty cache with the default one-hour TTL
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }

    /// Create an empty cache with a custom TTL
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            stats: CacheStats::default(),
        }
    }

    /// Configured TTL
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get the token for `(key, scope)` if the session is still live
    pub fn get(&self, key: &IdentityKey, scope: &str) -> Option<TokenRecord> {
        let Some(entry) = self.entries.get(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(self.ttl) {
            // Release the shard lock before removing
            drop(entry);
            if self
                .entries
                .remove_if(key, |_, e| e.is_expired(self.ttl))
                .is_some()
            {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let record = entry.tokens.get(scope).cloned();
        let counter = if record.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        record
    }

    /// Like [`get`](Self::get), without touching the statistics or evicting
    pub fn peek(&self, key: &IdentityKey, scope: &str) -> Option<TokenRecord> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(self.ttl))
            .and_then(|entry| entry.tokens.get(scope).cloned())
    }

    /// Store the token for `(key, scope)`, replacing any previous one, and
    /// restart the session's TTL clock
    pub fn put(&self, key: IdentityKey, scope: &str, record: TokenRecord) {
        let ttl = self.ttl;
        let mut entry = self.entries.entry(key).or_insert_with(|| SessionEntry {
            tokens: HashMap::new(),
            written_at: Instant::now(),
        });

        // An idle session that was never swept must not resurrect its other scopes
        if entry.is_expired(ttl) {
            entry.tokens.clear();
        }
        entry.tokens.insert(scope.to_string(), record);
        entry.written_at = Instant::now();
    }

    /// Remove every token held for `key`. Returns whether a live session existed.
    pub fn delete(&self, key: &IdentityKey) -> bool {
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(self.ttl))
    }

    /// Number of sessions currently held (including not yet swept ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove expired sessions (background maintenance). Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut removed = 0usize;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(ttl);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Snapshot of cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            sessions: self.entries.len(),
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups that found a token
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Sessions removed by TTL
    pub evictions: u64,
    /// Sessions currently held
    pub sessions: usize,
}
