//! Layer-aware performance budgets.
//!
//! Each layer has a latency budget. [`PerformanceTracker::record_timing`]
//! classifies a duration against its layer's budget in constant time. The
//! ring buffer of recent timings is kept for introspection only and plays
//! no part in the classification.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::Layer;

/// Per-layer latency budgets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    /// Entry/boundary layer budget
    pub api: Duration,
    /// Business-logic layer budget
    pub service: Duration,
    /// Domain layer budget
    pub domain: Duration,
    /// External-integration layer budget
    pub external: Duration,
    /// Budget for layers without their own entry
    pub fallback: Duration,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            api: Duration::from_millis(100),
            service: Duration::from_millis(500),
            domain: Duration::from_millis(300),
            external: Duration::from_secs(1),
            fallback: Duration::from_secs(1),
        }
    }
}

impl PerformanceThresholds {
    /// Budget for the named layer, falling back for unknown layers.
    pub fn threshold_for(&self, layer: &str) -> Duration {
        match Layer::from(layer) {
            Layer::Api => self.api,
            Layer::Service => self.service,
            Layer::Domain => self.domain,
            Layer::External => self.external,
            Layer::Other(_) => self.fallback,
        }
    }

    /// Overrides the budget of one layer.
    #[must_use]
    pub fn with_layer(mut self, layer: &Layer, threshold: Duration) -> Self {
        match layer {
            Layer::Api => self.api = threshold,
            Layer::Service => self.service = threshold,
            Layer::Domain => self.domain = threshold,
            Layer::External => self.external = threshold,
            Layer::Other(_) => self.fallback = threshold,
        }
        self
    }

    /// Classifies a duration without recording it.
    pub fn check(&self, layer: &str, duration: Duration) -> TimingCheck {
        let threshold = self.threshold_for(layer);
        TimingCheck {
            exceeds_threshold: duration > threshold,
            threshold,
        }
    }
}

/// Outcome of classifying one timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimingCheck {
    /// Whether the duration exceeded the layer budget
    pub exceeds_threshold: bool,
    /// The budget it was compared against
    pub threshold: Duration,
}

/// One recorded timing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSample {
    /// Layer of the operation
    pub layer: String,
    /// Operation name
    pub operation: String,
    /// Measured duration
    pub duration: Duration,
    /// Whether it exceeded the budget
    pub exceeded: bool,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Records per-operation durations and flags budget violations.
#[derive(Debug)]
pub struct PerformanceTracker {
    thresholds: PerformanceThresholds,
    recent: Mutex<VecDeque<TimingSample>>,
    capacity: usize,
    recorded: AtomicUsize,
    violations: AtomicUsize,
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(PerformanceThresholds::default(), 100)
    }
}

impl PerformanceTracker {
    /// Creates a tracker retaining the last `history` timings.
    pub fn new(thresholds: PerformanceThresholds, history: usize) -> Self {
        Self {
            thresholds,
            recent: Mutex::new(VecDeque::with_capacity(history.min(1024))),
            capacity: history.max(1),
            recorded: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
        }
    }

    /// Records a timing and classifies it against the layer's budget.
    pub fn record_timing(&self, layer: &str, operation: &str, duration: Duration) -> TimingCheck {
        let check = self.thresholds.check(layer, duration);

        self.recorded.fetch_add(1, Ordering::Relaxed);
        if check.exceeds_threshold {
            self.violations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                layer,
                operation,
                duration_ms = duration.as_millis(),
                threshold_ms = check.threshold.as_millis(),
                "Performance budget exceeded"
            );
        }

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(TimingSample {
            layer: layer.to_string(),
            operation: operation.to_string(),
            duration,
            exceeded: check.exceeds_threshold,
            recorded_at: Utc::now(),
        });

        check
    }

    /// The budgets in effect.
    pub const fn thresholds(&self) -> &PerformanceThresholds {
        &self.thresholds
    }

    /// Number of budget violations recorded.
    pub fn violation_count(&self) -> usize {
        self.violations.load(Ordering::Relaxed)
    }

    /// Number of timings recorded.
    pub fn recorded_count(&self) -> usize {
        self.recorded.load(Ordering::Relaxed)
    }

    /// The retained recent timings, oldest first.
    pub fn recent_timings(&self) -> Vec<TimingSample> {
        self.recent.lock().iter().cloned().collect()
    }
}
