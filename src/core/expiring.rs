//! Expiring keyed hit counter
//!
//! A mutexed map from string key to a hit counter with a per-entry expiry.
//! Reaping is amortized: a pass runs from [`ExpiringCounter::set`] only once
//! the map is large enough and enough time has passed since the last pass,
//! and deletes a bounded number of expired entries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Reap at most this many entries per pass.
const MAX_REAP_PER_PASS: usize = 100;

/// A pass only runs when the map has at least this many entries.
const REAP_SIZE_THRESHOLD: usize = 500;

/// Minimum interval between reap passes.
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Hit counts saturate here.
const SATURATION: u32 = 30;

#[derive(Debug, Clone)]
struct Entry {
    expiry: Instant,
    hits: u32,
}

struct Inner {
    m: HashMap<String, Entry>,
    last_reap: Instant,
}

/// Expiring keyed counter.
///
/// `get` increments a live counter, resets an expired one, and creates a
/// zero-hit entry (expiring immediately) for an unseen key so that a
/// following `set` can extend it.
pub struct ExpiringCounter {
    inner: Mutex<Inner>,
}

impl ExpiringCounter {
    /// Create an empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                m: HashMap::new(),
                last_reap: Instant::now(),
            }),
        }
    }

    /// Look up `key`, incrementing its live hit count.
    ///
    /// Unseen keys are created with zero hits and an already-passed expiry;
    /// expired entries are reset to zero hits. Both cases return 0.
    pub fn get(&self, key: &str) -> u32 {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(e) = inner.m.get_mut(key) {
            if now > e.expiry {
                e.hits = 0;
            } else {
                // Saturate: the stall policy clamps at 30s, so counting
                // past 30 carries no signal.
                e.hits = (e.hits + 1).min(SATURATION);
            }
            return e.hits;
        }

        inner.m.insert(
            key.to_string(),
            Entry {
                expiry: now,
                hits: 0,
            },
        );
        0
    }

    /// Extend `key`'s life by `ttl` from now.
    ///
    /// The expiry only moves forward: if the new deadline is later than the
    /// current one the entry is extended in place (hits preserved),
    /// otherwise the entry is replaced with a fresh zero-hit one. Returns
    /// the entry's hits.
    pub fn set(&self, key: &str, ttl: Duration) -> u32 {
        let deadline = Instant::now() + ttl;
        let mut inner = self.inner.lock();

        let extended = match inner.m.get_mut(key) {
            Some(e) if deadline > e.expiry => {
                e.expiry = deadline;
                Some(e.hits)
            }
            _ => None,
        };
        let hits = extended.unwrap_or_else(|| {
            inner.m.insert(
                key.to_string(),
                Entry {
                    expiry: deadline,
                    hits: 0,
                },
            );
            0
        });

        Self::reap(&mut inner);
        hits
    }

    /// Drop `key`.
    pub fn remove(&self, key: &str) {
        self.inner.lock().m.remove(key);
    }

    /// Number of tracked keys, live or expired.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().m.len()
    }

    /// True when no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().m.is_empty()
    }

    /// Drop every entry, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.m.len();
        inner.m.clear();
        n
    }

    fn reap(inner: &mut Inner) {
        if inner.m.len() < REAP_SIZE_THRESHOLD {
            return;
        }

        let now = Instant::now();
        if now.duration_since(inner.last_reap) <= REAP_INTERVAL {
            return;
        }
        inner.last_reap = now;

        let doomed: Vec<String> = inner
            .m
            .iter()
            .filter(|(_, e)| now > e.expiry)
            .take(MAX_REAP_PER_PASS)
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            inner.m.remove(&k);
        }
    }
}

impl Default for ExpiringCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExpiringCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringCounter")
            .field("len", &self.len())
            .finish()
    }
}
