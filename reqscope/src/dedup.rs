//! Deduplication of operation records within a request.
//!
//! The [`OperationLedger`] is the per-request set of operation keys that
//! have already been emitted. Marking is atomic: when two sub-operations race
//! on the same key, exactly one of them wins the right to emit.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// How repeated operation keys within one request are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "policy", content = "value")]
pub enum DedupPolicy {
    /// Each key is emitted at most once per request.
    #[default]
    Strict,
    /// A key may be emitted again once the window has elapsed.
    TimeWindow(Duration),
    /// A key may be emitted up to this many times.
    CountBased(u32),
    /// Every attempt is emitted.
    Disabled,
}

impl fmt::Display for DedupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::TimeWindow(window) => write!(f, "time_window:{}", window.as_secs_f64()),
            Self::CountBased(limit) => write!(f, "count:{limit}"),
            Self::Disabled => write!(f, "none"),
        }
    }
}

impl FromStr for DedupPolicy {
    type Err = ConfigError;

    /// Parses `strict`, `time_window:<secs>`, `count:<n>` or `none`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_ascii_lowercase();
        let (name, arg) = raw
            .split_once(':')
            .map_or((raw.as_str(), None), |(n, a)| (n, Some(a)));

        match (name, arg) {
            ("strict", None) => Ok(Self::Strict),
            ("none" | "disabled", None) => Ok(Self::Disabled),
            ("time_window" | "window", Some(secs)) => secs
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v > 0.0)
                .map(|v| Self::TimeWindow(Duration::from_secs_f64(v)))
                .ok_or_else(|| {
                    ConfigError::invalid("dedup_policy", s, "window must be positive seconds")
                }),
            ("count" | "count_based", Some(limit)) => limit
                .parse::<u32>()
                .ok()
                .filter(|v| *v > 0)
                .map(Self::CountBased)
                .ok_or_else(|| {
                    ConfigError::invalid("dedup_policy", s, "count must be a positive integer")
                }),
            _ => Err(ConfigError::invalid(
                "dedup_policy",
                s,
                "expected strict, time_window:<secs>, count:<n> or none",
            )),
        }
    }
}

#[derive(Debug)]
struct LedgerEntry {
    emitted: u32,
    last_emitted: Instant,
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: HashMap<String, LedgerEntry>,
    order: VecDeque<String>,
    evicted: usize,
}

/// Bounded, append-only set of emitted operation keys.
///
/// Once the set holds more than `capacity` keys, the oldest 10% are evicted.
#[derive(Debug)]
pub struct OperationLedger {
    inner: Mutex<LedgerInner>,
    capacity: usize,
}

impl OperationLedger {
    /// Creates a ledger holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Atomically decides whether `key` may be emitted under `policy`, and
    /// records the emission if so.
    pub fn try_mark(&self, key: &str, policy: DedupPolicy) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            let allowed = match policy {
                DedupPolicy::Strict => false,
                DedupPolicy::TimeWindow(window) => now.duration_since(entry.last_emitted) >= window,
                DedupPolicy::CountBased(limit) => entry.emitted < limit,
                DedupPolicy::Disabled => true,
            };
            if allowed {
                entry.emitted = entry.emitted.saturating_add(1);
                entry.last_emitted = now;
            }
            return allowed;
        }

        inner.entries.insert(
            key.to_string(),
            LedgerEntry {
                emitted: 1,
                last_emitted: now,
            },
        );
        inner.order.push_back(key.to_string());
        self.evict_if_needed(&mut inner);
        true
    }

    fn evict_if_needed(&self, inner: &mut LedgerInner) {
        if inner.entries.len() <= self.capacity {
            return;
        }
        let batch = (self.capacity / 10).max(1);
        for _ in 0..batch {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                    inner.evicted += 1;
                }
                None => break,
            }
        }
        tracing::debug!(
            capacity = self.capacity,
            evicted = batch,
            "Operation ledger exceeded capacity, evicted oldest keys"
        );
    }

    /// Returns true if `key` is currently recorded.
    pub fn has_logged(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if no key is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of keys evicted so far.
    pub fn evicted(&self) -> usize {
        self.inner.lock().evicted
    }

    /// Configured capacity.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
