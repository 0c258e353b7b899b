//! Consecutive-failure circuit breaker for external clients.
//!
//! # States
//!
//! - **Closed**: calls pass through; each failure increments the
//!   consecutive-failure count and a success resets it.
//! - **Open**: reached when the count hits the threshold; calls fail fast
//!   until the cooldown elapses.
//! - **HalfOpen**: after the cooldown exactly one trial call is let through.
//!   Its success closes the breaker; its failure reopens it and restarts the
//!   cooldown.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nutype::nutype;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::BoundaryError;

/// Consecutive failures that open the breaker.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct FailureThreshold(u32);

/// Time an open breaker waits before allowing a trial call.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600_000),
    default = 30_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct CooldownMs(u64);

impl From<CooldownMs> for Duration {
    fn from(cooldown: CooldownMs) -> Self {
        Self::from_millis(cooldown.into_inner())
    }
}

/// Circuit breaker configuration with validated parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: FailureThreshold,
    /// Wait before the half-open trial
    pub cooldown: CooldownMs,
    /// Whether the breaker is consulted at all
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FailureThreshold::default(),
            cooldown: CooldownMs::default(),
            enabled: true,
        }
    }
}

/// Circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// One trial call is allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    open_since: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            open_since: None,
            trial_in_flight: false,
            total_calls: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.open_since = Some(Utc::now());
        self.trial_in_flight = false;
    }
}

/// Tracks consecutive failures of one external client.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Name of the guarded client.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks permission to call the client.
    ///
    /// Fails with [`BoundaryError::CircuitOpen`] while the breaker is open,
    /// or while another caller holds the half-open trial.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, BoundaryError> {
        if !self.config.enabled {
            return Ok(self.permit(false));
        }

        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= Duration::from(self.config.cooldown));
                if cooled {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    debug!(client = %self.name, "Circuit breaker moved to half-open state");
                    Ok(self.permit(true))
                } else {
                    Err(self.reject(&mut state))
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    Err(self.reject(&mut state))
                } else {
                    state.trial_in_flight = true;
                    Ok(self.permit(true))
                }
            }
        }
    }

    const fn permit(&self, trial: bool) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            trial,
            settled: false,
        }
    }

    fn reject(&self, state: &mut BreakerState) -> BoundaryError {
        state.rejected_calls += 1;
        BoundaryError::CircuitOpen {
            client: self.name.clone(),
            open_since: state.open_since.unwrap_or_else(Utc::now),
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Only the trial call decides a half-open breaker; calls admitted
    /// before it opened just count.
    fn record_success(&self, trial: bool) {
        let mut state = self.state.lock();
        state.total_calls += 1;
        state.consecutive_failures = 0;
        if trial && state.state == CircuitState::HalfOpen {
            state.state = CircuitState::Closed;
            state.trial_in_flight = false;
            state.opened_at = None;
            state.open_since = None;
            info!(client = %self.name, "Circuit breaker closed after successful trial");
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut state = self.state.lock();
        state.total_calls += 1;
        state.total_failures += 1;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        match state.state {
            CircuitState::HalfOpen if trial => {
                state.open();
                warn!(client = %self.name, "Circuit breaker trial failed, reopening");
            }
            CircuitState::Closed
                if state.consecutive_failures >= self.config.failure_threshold.into_inner() =>
            {
                state.open();
                warn!(
                    client = %self.name,
                    consecutive_failures = state.consecutive_failures,
                    "Circuit breaker opened due to consecutive failures"
                );
            }
            _ => {}
        }
    }

    /// Current state. An open breaker whose cooldown has elapsed still
    /// reports `Open` until the next call attempt.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Gets circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_calls: state.total_calls,
            total_failures: state.total_failures,
            rejected_calls: state.rejected_calls,
            open_since: state.open_since,
            config: self.config,
        }
    }
}

/// Permission for one call. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure).
///
/// A half-open trial permit dropped without an outcome counts as a failure,
/// so an abandoned trial cannot leave the breaker stuck half-open.
#[derive(Debug)]
#[must_use = "report the call outcome through the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Returns true if this is the half-open trial.
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    /// Records a successful call.
    pub fn success(mut self) {
        self.settled = true;
        if self.breaker.config.enabled {
            self.breaker.record_success(self.trial);
        }
    }

    /// Records a failed call.
    pub fn failure(mut self) {
        self.settled = true;
        if self.breaker.config.enabled {
            self.breaker.record_failure(self.trial);
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.record_failure(self.trial);
        }
    }
}

/// Circuit breaker statistics for monitoring and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Guarded client
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Calls whose outcome was recorded
    pub total_calls: u64,
    /// Failed calls
    pub total_failures: u64,
    /// Calls rejected without being attempted
    pub rejected_calls: u64,
    /// When the breaker last opened, while open or half-open
    pub open_since: Option<DateTime<Utc>>,
    /// Configuration
    pub config: CircuitBreakerConfig,
}
