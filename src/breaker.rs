//! Circuit breaker (C4): per concrete resource, tracks success/failure/slow
//! outcomes over a sliding window and runs the CLOSED / OPEN / HALF_OPEN
//! state machine with probing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::rules::{BreakerStrategy, CircuitBreakerRule};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitResult {
    Admit,
    Reject,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    start_ms: u64,
    success: u64,
    error: u64,
    slow: u64,
}

struct Inner {
    phase: BreakerPhase,
    /// Timestamp the current phase (Open or HalfOpen) began. Reused as the
    /// hard horizon for both "retry after this" (Open) and "leaked probes
    /// fail closed after this" (HalfOpen).
    phase_started_ms: u64,
    half_open_inflight: u64,
    half_open_successes: u64,
    buckets: Vec<Bucket>,
    window_ms: u64,
    bucket_ms: u64,
}

impl Inner {
    fn record(&mut self, outcome: Outcome) {
        let now = now_ms();
        let bucket_count = self.buckets.len() as u64;
        let horizon = now.saturating_sub(self.window_ms);
        for bucket in &mut self.buckets {
            if bucket.start_ms < horizon {
                *bucket = Bucket::default();
            }
        }
        let idx = ((now / self.bucket_ms) % bucket_count) as usize;
        let current_start = (now / self.bucket_ms) * self.bucket_ms;
        if self.buckets[idx].start_ms != current_start {
            self.buckets[idx] = Bucket {
                start_ms: current_start,
                ..Bucket::default()
            };
        }
        match outcome {
            Outcome::Success => self.buckets[idx].success += 1,
            Outcome::Error => self.buckets[idx].error += 1,
            Outcome::Slow => self.buckets[idx].slow += 1,
        }
    }

    fn totals(&self) -> (u64, u64, u64) {
        let mut success = 0;
        let mut error = 0;
        let mut slow = 0;
        for b in &self.buckets {
            success += b.success;
            error += b.error;
            slow += b.slow;
        }
        (success, error, slow)
    }

    fn reset_ring(&mut self) {
        for b in &mut self.buckets {
            *b = Bucket::default();
        }
    }
}

/// Per-resource breaker state, parameterized once from the matched
/// `CircuitBreakerRule` at materialization time.
pub struct BreakerState {
    inner: Mutex<Inner>,
    strategy: BreakerStrategy,
    threshold: f64,
    min_request_amount: u64,
    retry_timeout_ms: u64,
    probe_num: u64,
}

impl BreakerState {
    pub fn new(rule: &CircuitBreakerRule) -> Arc<Self> {
        let bucket_count = rule.bucket_count.max(1) as u64;
        let window_ms = u64::from(rule.stat_window_ms.max(1));
        let bucket_ms = (window_ms / bucket_count).max(1);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                phase: BreakerPhase::Closed,
                phase_started_ms: 0,
                half_open_inflight: 0,
                half_open_successes: 0,
                buckets: vec![Bucket::default(); bucket_count as usize],
                window_ms,
                bucket_ms,
            }),
            strategy: rule.strategy,
            threshold: rule.threshold,
            min_request_amount: rule.min_request_amount,
            retry_timeout_ms: u64::from(rule.retry_timeout_ms),
            probe_num: rule.probe_num.max(1),
        })
    }

    pub fn admit(&self) -> AdmitResult {
        let now = now_ms();
        let mut inner = self.inner.lock();
        match inner.phase {
            BreakerPhase::Closed => AdmitResult::Admit,
            BreakerPhase::Open => {
                if now.saturating_sub(inner.phase_started_ms) >= self.retry_timeout_ms {
                    inner.phase = BreakerPhase::HalfOpen;
                    inner.phase_started_ms = now;
                    inner.half_open_inflight = 0;
                    inner.half_open_successes = 0;
                    admit_probe(&mut inner, self.probe_num)
                } else {
                    AdmitResult::Reject
                }
            }
            BreakerPhase::HalfOpen => {
                if now.saturating_sub(inner.phase_started_ms) >= self.retry_timeout_ms {
                    // Hard horizon: a caller admitted as a probe never
                    // reported back, leaking half_open_inflight. Fail
                    // closed to Open rather than leaving
                    // the breaker stuck half-open forever.
                    inner.phase = BreakerPhase::Open;
                    inner.phase_started_ms = now;
                    inner.half_open_inflight = 0;
                    AdmitResult::Reject
                } else {
                    admit_probe(&mut inner, self.probe_num)
                }
            }
        }
    }

    pub fn report(&self, outcome: Outcome) {
        let now = now_ms();
        let mut inner = self.inner.lock();
        match inner.phase {
            BreakerPhase::Open => {}
            BreakerPhase::Closed => {
                inner.record(outcome);
                let (success, error, slow) = inner.totals();
                let total = success + error + slow;
                if total >= self.min_request_amount && self.trips(error, slow, total) {
                    inner.phase = BreakerPhase::Open;
                    inner.phase_started_ms = now;
                }
            }
            BreakerPhase::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                match outcome {
                    Outcome::Error | Outcome::Slow => {
                        inner.phase = BreakerPhase::Open;
                        inner.phase_started_ms = now;
                        inner.half_open_inflight = 0;
                        inner.half_open_successes = 0;
                    }
                    Outcome::Success => {
                        inner.half_open_successes += 1;
                        if inner.half_open_successes >= self.probe_num {
                            inner.phase = BreakerPhase::Closed;
                            inner.half_open_inflight = 0;
                            inner.half_open_successes = 0;
                            inner.reset_ring();
                        }
                    }
                }
            }
        }
    }

    fn trips(&self, error: u64, slow: u64, total: u64) -> bool {
        match self.strategy {
            BreakerStrategy::ErrorRatio => (error as f64) / (total as f64) > self.threshold,
            BreakerStrategy::ErrorCount => error > self.threshold as u64,
            BreakerStrategy::SlowRequestRatio => (slow as f64) / (total as f64) > self.threshold,
        }
    }

    pub fn phase(&self) -> BreakerPhase {
        self.inner.lock().phase
    }

    /// Releases a half-open probe slot that `admit` handed out but that
    /// never reached `report` — e.g. a later gate (the rate limiter)
    /// blocked the same request. A no-op outside `HalfOpen`, since only
    /// half-open admits track inflight probes.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == BreakerPhase::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }

    pub fn error_rate(&self) -> f64 {
        let inner = self.inner.lock();
        let (success, error, slow) = inner.totals();
        let total = success + error + slow;
        if total == 0 {
            0.0
        } else {
            error as f64 / total as f64
        }
    }

    #[cfg(test)]
    pub(crate) fn force_open_for_test(&self) {
        let mut inner = self.inner.lock();
        inner.phase = BreakerPhase::Open;
        inner.phase_started_ms = now_ms();
    }
}

fn admit_probe(inner: &mut Inner, probe_num: u64) -> AdmitResult {
    if inner.half_open_inflight < probe_num {
        inner.half_open_inflight += 1;
        AdmitResult::Admit
    } else {
        AdmitResult::Reject
    }
}

/// Test-only clock skip: advances the breaker's notion of "phase started at"
/// into the past so retry-timeout transitions can be exercised without
/// sleeping in unit tests.
#[cfg(test)]
pub fn backdate_phase(state: &BreakerState, by: Duration) {
    let mut inner = state.inner.lock();
    inner.phase_started_ms = inner.phase_started_ms.saturating_sub(by.as_millis() as u64);
}
