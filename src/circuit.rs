//! Circuit breaker: a `Closed / Open / HalfOpen` state machine guarding a
//! node against cascading failures.
//!
//! A breaker records operation outcomes in a rolling window (a bounded ring
//! of `(timestamp, outcome)` entries) and trips according to its configured
//! [`ThresholdMode`]. While `Open`, calls are rejected immediately with
//! [`PipelineError::CircuitBreakerTripped`]; after
//! [`CircuitBreakerOptions::open_duration`] the breaker admits a limited
//! number of trial calls (`HalfOpen`) and closes again after enough
//! consecutive successes.
//!
//! The state machine is pure: it records transitions internally and the
//! executor drains them via [`CircuitBreaker::take_transitions`] to emit
//! observer events, so this module stays independent of the observer
//! surface's delivery concerns.
//!
//! Locking: one mutex per breaker; no user code runs under it.

use crate::error::{PipelineError, Result};
use crate::observer::CircuitStateKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// When a closed breaker trips.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ThresholdMode {
    /// Trip after this many consecutive failures.
    ConsecutiveCount(u32),
    /// Trip after this many failures inside the rolling window.
    RollingWindowCount(u32),
    /// Trip when the failure rate inside the rolling window reaches `rate`,
    /// provided at least `min_samples` outcomes were observed.
    RollingWindowRate {
        /// Failure ratio in `[0, 1]` that trips the breaker.
        rate: f64,
        /// Minimum outcomes before the rate is considered meaningful.
        min_samples: u32,
    },
    /// Trip when either the count or the rate criterion is met.
    Hybrid {
        /// Consecutive-failure count criterion.
        count: u32,
        /// Failure-rate criterion.
        rate: f64,
        /// Minimum outcomes gating the rate criterion.
        min_samples: u32,
    },
}

/// Breaker configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    /// Trip criterion.
    pub threshold: ThresholdMode,
    /// Length of the rolling outcome window.
    pub rolling_window: Duration,
    /// How long the breaker stays `Open` before admitting trial calls.
    pub open_duration: Duration,
    /// Trial calls admitted while `HalfOpen`.
    pub half_open_max_attempts: u32,
    /// Consecutive successes required to close again.
    pub half_open_success_threshold: u32,
    /// Ring-buffer capacity of the rolling window.
    pub window_capacity: usize,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            threshold: ThresholdMode::ConsecutiveCount(5),
            rolling_window: Duration::from_secs(30),
            open_duration: Duration::from_secs(30),
            half_open_max_attempts: 2,
            half_open_success_threshold: 1,
            window_capacity: 256,
        }
    }
}

/// A recorded state change, drained by the executor for observer emission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State before the change.
    pub from: CircuitStateKind,
    /// State after the change.
    pub to: CircuitStateKind,
}

/// Internal breaker state.
#[derive(Clone, Copy, Debug)]
enum State {
    Closed,
    Open { reopen_at: Instant },
    HalfOpen { attempts_left: u32, successes: u32 },
}

impl State {
    fn kind(&self) -> CircuitStateKind {
        match self {
            State::Closed => CircuitStateKind::Closed,
            State::Open { .. } => CircuitStateKind::Open,
            State::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }
}

/// Rolling ring buffer of `(timestamp, success)` outcomes.
#[derive(Debug)]
struct RollingWindow {
    entries: VecDeque<(Instant, bool)>,
    capacity: usize,
    span: Duration,
}

impl RollingWindow {
    fn new(capacity: usize, span: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            span,
        }
    }

    fn record(&mut self, now: Instant, success: bool) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((now, success));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.entries.front() {
            if now.duration_since(t) > self.span {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> u32 {
        self.entries.iter().filter(|(_, ok)| !ok).count() as u32
    }

    fn samples(&self) -> u32 {
        self.entries.len() as u32
    }

    fn failure_rate(&self) -> f64 {
        if self.entries.is_empty() {
            0.0
        } else {
            f64::from(self.failures()) / f64::from(self.samples())
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    window: RollingWindow,
    consecutive_failures: u32,
    pending: Vec<Transition>,
}

/// Per-node circuit breaker shared across attempts.
#[derive(Debug)]
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    node: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker guarding `node`.
    pub fn new(node: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: RollingWindow::new(options.window_capacity, options.rolling_window),
                consecutive_failures: 0,
                pending: Vec::new(),
            }),
            node: node.into(),
            options,
        }
    }

    /// Ask permission to run one operation.
    ///
    /// `Closed` always grants. `Open` rejects until the open period has
    /// elapsed, then moves to `HalfOpen` and grants trial permits up to the
    /// configured budget.
    pub fn try_acquire(&self) -> Result<()> {
        self.try_acquire_at(Instant::now())
    }

    /// Clock-explicit variant of [`try_acquire`](Self::try_acquire).
    pub fn try_acquire_at(&self, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.state {
            State::Closed => Ok(()),
            State::Open { reopen_at } => {
                if now >= reopen_at {
                    let attempts = self.options.half_open_max_attempts.max(1);
                    Self::shift(&mut inner, State::HalfOpen {
                        attempts_left: attempts - 1,
                        successes: 0,
                    });
                    Ok(())
                } else {
                    Err(self.tripped())
                }
            }
            State::HalfOpen { attempts_left, successes } => {
                if attempts_left == 0 {
                    Err(self.tripped())
                } else {
                    inner.state = State::HalfOpen {
                        attempts_left: attempts_left - 1,
                        successes,
                    };
                    Ok(())
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    /// Clock-explicit variant of [`record_success`](Self::record_success).
    pub fn record_success_at(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        inner.consecutive_failures = 0;
        match inner.state {
            State::Closed => inner.window.record(now, true),
            State::HalfOpen { attempts_left, successes } => {
                let successes = successes + 1;
                if successes >= self.options.half_open_success_threshold {
                    inner.window.clear();
                    Self::shift(&mut inner, State::Closed);
                } else {
                    inner.state = State::HalfOpen { attempts_left, successes };
                }
            }
            // A success while Open can only come from an operation admitted
            // before the trip; it does not reopen the circuit.
            State::Open { .. } => {}
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Clock-explicit variant of [`record_failure`](Self::record_failure).
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        inner.consecutive_failures += 1;
        match inner.state {
            State::Closed => {
                inner.window.record(now, false);
                if self.should_trip(&inner) {
                    Self::shift(&mut inner, State::Open {
                        reopen_at: now + self.options.open_duration,
                    });
                }
            }
            State::HalfOpen { .. } => {
                Self::shift(&mut inner, State::Open {
                    reopen_at: now + self.options.open_duration,
                });
            }
            State::Open { .. } => {}
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        match self.options.threshold {
            ThresholdMode::ConsecutiveCount(n) => inner.consecutive_failures >= n,
            ThresholdMode::RollingWindowCount(n) => inner.window.failures() >= n,
            ThresholdMode::RollingWindowRate { rate, min_samples } => {
                inner.window.samples() >= min_samples && inner.window.failure_rate() >= rate
            }
            ThresholdMode::Hybrid { count, rate, min_samples } => {
                inner.consecutive_failures >= count
                    || (inner.window.samples() >= min_samples && inner.window.failure_rate() >= rate)
            }
        }
    }

    fn shift(inner: &mut Inner, next: State) {
        let from = inner.state.kind();
        inner.state = next;
        let to = inner.state.kind();
        if from != to {
            inner.pending.push(Transition { from, to });
        }
    }

    fn tripped(&self) -> PipelineError {
        PipelineError::CircuitBreakerTripped {
            node: Some(self.node.clone()),
            threshold: match self.options.threshold {
                ThresholdMode::ConsecutiveCount(n) | ThresholdMode::RollingWindowCount(n) => Some(n),
                ThresholdMode::Hybrid { count, .. } => Some(count),
                ThresholdMode::RollingWindowRate { .. } => None,
            },
        }
    }

    /// Current state as an observer-facing kind.
    pub fn state_kind(&self) -> CircuitStateKind {
        self.inner.lock().expect("breaker poisoned").state.kind()
    }

    /// Failures currently inside the rolling window.
    pub fn window_failures(&self) -> u32 {
        self.inner.lock().expect("breaker poisoned").window.failures()
    }

    /// Drain transitions recorded since the last call.
    pub fn take_transitions(&self) -> Vec<Transition> {
        std::mem::take(&mut self.inner.lock().expect("breaker poisoned").pending)
    }

    /// The node this breaker guards.
    pub fn node(&self) -> &str {
        &self.node
    }
}

/// Owns the per-node breakers for one runner lifetime.
#[derive(Default)]
pub struct CircuitBreakerManager {
    defaults: Option<CircuitBreakerOptions>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    /// Manager with pipeline-wide default options (nodes may override).
    pub fn new(defaults: Option<CircuitBreakerOptions>) -> Self {
        Self {
            defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `node`, creating it on first use. Returns `None` when
    /// neither the node nor the pipeline configured one.
    pub fn breaker_for(
        &self,
        node: &str,
        node_options: Option<&CircuitBreakerOptions>,
    ) -> Option<Arc<CircuitBreaker>> {
        let options = node_options.copied().or(self.defaults)?;
        let mut map = self.breakers.lock().expect("breaker registry poisoned");
        Some(
            map.entry(node.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(node, options)))
                .clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(threshold: ThresholdMode) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            threshold,
            open_duration: Duration::from_millis(50),
            half_open_max_attempts: 2,
            half_open_success_threshold: 2,
            ..CircuitBreakerOptions::default()
        }
    }

    #[test]
    fn consecutive_count_trips_and_recovers() {
        let cb = CircuitBreaker::new("n", opts(ThresholdMode::ConsecutiveCount(2)));
        let t0 = Instant::now();

        assert!(cb.try_acquire_at(t0).is_ok());
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        assert_eq!(cb.state_kind(), CircuitStateKind::Open);
        assert_eq!(cb.try_acquire_at(t0).unwrap_err().code(), "CIRCUIT_BREAKER_TRIPPED");

        // After the open period the breaker admits trial calls.
        let t1 = t0 + Duration::from_millis(60);
        assert!(cb.try_acquire_at(t1).is_ok());
        assert_eq!(cb.state_kind(), CircuitStateKind::HalfOpen);
        cb.record_success_at(t1);
        assert!(cb.try_acquire_at(t1).is_ok());
        cb.record_success_at(t1);

        assert_eq!(cb.state_kind(), CircuitStateKind::Closed);
        assert_eq!(cb.window_failures(), 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("n", opts(ThresholdMode::ConsecutiveCount(1)));
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        let t1 = t0 + Duration::from_millis(60);
        assert!(cb.try_acquire_at(t1).is_ok());
        cb.record_failure_at(t1);
        assert_eq!(cb.state_kind(), CircuitStateKind::Open);
        assert!(cb.try_acquire_at(t1).is_err());
    }

    #[test]
    fn rolling_rate_waits_for_min_samples() {
        let cb = CircuitBreaker::new(
            "n",
            opts(ThresholdMode::RollingWindowRate { rate: 0.5, min_samples: 4 }),
        );
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        assert_eq!(cb.state_kind(), CircuitStateKind::Closed);
        cb.record_success_at(t0);
        cb.record_failure_at(t0);
        assert_eq!(cb.state_kind(), CircuitStateKind::Open);
    }

    #[test]
    fn transitions_are_drained_in_order() {
        let cb = CircuitBreaker::new("n", opts(ThresholdMode::ConsecutiveCount(1)));
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        let t1 = t0 + Duration::from_millis(60);
        cb.try_acquire_at(t1).unwrap();
        let moves = cb.take_transitions();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].to, CircuitStateKind::Open);
        assert_eq!(moves[1].to, CircuitStateKind::HalfOpen);
        assert!(cb.take_transitions().is_empty());
    }

    #[test]
    fn manager_reuses_breakers() {
        let mgr = CircuitBreakerManager::new(Some(CircuitBreakerOptions::default()));
        let a = mgr.breaker_for("n", None).unwrap();
        let b = mgr.breaker_for("n", None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(CircuitBreakerManager::new(None).breaker_for("n", None).is_none());
    }
}
