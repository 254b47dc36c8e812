//! Protection engine (C5): the public entry point. `acquire` is consulted
//! once before a protected operation, `report` exactly once for every
//! handle `acquire` returned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::breaker::{AdmitResult, BreakerState, Outcome as BreakerOutcome};
use crate::error::Result;
use crate::limiter::{LimitDecision, SlidingWindowCounter, DEFAULT_BUCKET_COUNT};
use crate::rules::{BreakerStrategy, CircuitBreakerRule, RateLimitRule, RuleRegistry};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    BlockRateLimit,
    BlockCircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Success,
    Error,
}

/// Opaque token routing `report` back to the right per-resource breaker
/// without a second registry lookup. Carries its own breaker handle so a
/// rule mutation that swaps the resource's state out from under it cannot
/// corrupt the *new* state — reporting against a stale handle is a no-op
/// against live state, satisfying the "unknown handle" failure semantics.
#[derive(Clone)]
pub struct Handle {
    admit_at: Instant,
    breaker: Option<Arc<BreakerState>>,
    breaker_strategy: Option<BreakerStrategy>,
    max_allowed_rt_ms: u64,
}

impl Handle {
    pub fn admit_at(&self) -> Instant {
        self.admit_at
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitStats {
    pub pass: u64,
    pub block: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerStats {
    pub state: crate::breaker::BreakerPhase,
    pub error_rate: f64,
    /// Configured retry timeout for this resource's breaker, surfaced so
    /// adapters can set `Retry-After` without a second registry lookup.
    pub retry_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub rate_limit: Option<RateLimitStats>,
    pub breaker: Option<BreakerStats>,
}

struct ResourceState {
    rl_counter: Option<Arc<SlidingWindowCounter>>,
    rl_threshold: f64,
    breaker: Option<Arc<BreakerState>>,
    breaker_strategy: Option<BreakerStrategy>,
    max_allowed_rt_ms: u64,
    retry_timeout_ms: u64,
    last_access_ms: AtomicU64,
}

/// Public entry point consulted on every inbound call. Holds no rules of
/// its own — rule storage and resolution stays with the registry (C2); the
/// engine only lazily materializes concrete per-resource state the first
/// time each resource is observed.
pub struct ProtectionEngine {
    registry: Arc<RuleRegistry>,
    resources: RwLock<HashMap<String, Arc<ResourceState>>>,
    enabled: std::sync::atomic::AtomicBool,
}

impl ProtectionEngine {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            resources: RwLock::new(HashMap::new()),
            enabled: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Mirrors `ProtectionConfig::enabled`: when false, every
    /// `acquire` admits unconditionally without touching any rule or
    /// per-resource state, so a config toggle can disable protection
    /// crate-wide without restarting the process.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn add_or_replace_rate_limit(&self, rule: RateLimitRule) -> Result<()> {
        self.registry.add_or_replace_rate_limit(rule)?;
        self.invalidate_all();
        Ok(())
    }

    pub fn add_or_replace_circuit_breaker(&self, rule: CircuitBreakerRule) -> Result<()> {
        self.registry.add_or_replace_circuit_breaker(rule)?;
        self.invalidate_all();
        Ok(())
    }

    pub fn remove_rate_limit(&self, name: &str) {
        self.registry.remove_rate_limit(name);
        self.invalidate_all();
    }

    pub fn remove_circuit_breaker(&self, name: &str) {
        self.registry.remove_circuit_breaker(name);
        self.invalidate_all();
    }

    /// Drops all lazily materialized per-resource state so the next
    /// `acquire` for each resource re-resolves against current rules. Called
    /// after any rule mutation; does not retroactively affect handles
    /// already issued.
    fn invalidate_all(&self) {
        self.resources.write().clear();
    }

    /// Drops per-resource state untouched for at least `idle_after_ms`.
    /// Returns the number of resources reclaimed. Intended to be run off
    /// the request path by `sweep::idle_sweep_loop`.
    pub fn sweep_idle(&self, idle_after_ms: u64) -> usize {
        let now = now_ms();
        let mut resources = self.resources.write();
        let before = resources.len();
        resources.retain(|_, state| {
            now.saturating_sub(state.last_access_ms.load(Ordering::Relaxed)) < idle_after_ms
        });
        before - resources.len()
    }

    pub fn acquire(&self, resource: &str) -> Decision {
        if !self.is_enabled() {
            return Decision::Admit;
        }
        let state = self.materialize(resource);

        if let Some(breaker) = &state.breaker {
            if breaker.admit() == AdmitResult::Reject {
                return Decision::BlockCircuitOpen;
            }
        }

        if let Some(counter) = &state.rl_counter {
            if counter.try_acquire(state.rl_threshold) == LimitDecision::Block {
                // The breaker already admitted this request (and, in
                // HalfOpen, counted it as an inflight probe) before the
                // rate limiter blocked it. Nothing will ever call `report`
                // for it, so release the probe slot here instead of
                // leaking it until the retry-timeout horizon.
                if let Some(breaker) = &state.breaker {
                    breaker.release_probe();
                }
                return Decision::BlockRateLimit;
            }
        }

        Decision::Admit
    }

    /// Returns a handle iff the decision was `Admit`; pairs with `acquire`
    /// so callers who need `report` routing get it without a second lookup.
    /// When the engine is disabled, still returns a handle (carrying no
    /// breaker) so callers can treat `Admit` uniformly and `report` on it
    /// as a safe no-op, rather than forcing every caller to special-case a
    /// `None` handle on an `Admit` decision.
    pub fn acquire_with_handle(&self, resource: &str) -> (Decision, Option<Handle>) {
        if !self.is_enabled() {
            return (
                Decision::Admit,
                Some(Handle {
                    admit_at: Instant::now(),
                    breaker: None,
                    breaker_strategy: None,
                    max_allowed_rt_ms: 0,
                }),
            );
        }
        let state = self.materialize(resource);

        if let Some(breaker) = &state.breaker {
            if breaker.admit() == AdmitResult::Reject {
                return (Decision::BlockCircuitOpen, None);
            }
        }

        if let Some(counter) = &state.rl_counter {
            if counter.try_acquire(state.rl_threshold) == LimitDecision::Block {
                if let Some(breaker) = &state.breaker {
                    breaker.release_probe();
                }
                return (Decision::BlockRateLimit, None);
            }
        }

        let handle = Handle {
            admit_at: Instant::now(),
            breaker: state.breaker.clone(),
            breaker_strategy: state.breaker_strategy,
            max_allowed_rt_ms: state.max_allowed_rt_ms,
        };
        (Decision::Admit, Some(handle))
    }

    /// No-op if `handle` carries no breaker (no circuit-breaker rule
    /// matched this resource) — satisfies "Report on an unknown handle is
    /// a no-op" for both the literal unknown-handle case and the
    /// no-breaker-configured case.
    pub fn report(&self, handle: &Handle, outcome: ReportOutcome, elapsed: Duration) {
        let Some(breaker) = &handle.breaker else {
            return;
        };
        let breaker_outcome = match outcome {
            ReportOutcome::Error => BreakerOutcome::Error,
            ReportOutcome::Success => {
                if handle.breaker_strategy == Some(BreakerStrategy::SlowRequestRatio)
                    && elapsed.as_millis() as u64 >= handle.max_allowed_rt_ms
                {
                    BreakerOutcome::Slow
                } else {
                    BreakerOutcome::Success
                }
            }
        };
        breaker.report(breaker_outcome);
    }

    pub fn stats(&self, resource: &str) -> Stats {
        let Some(state) = self.resources.read().get(resource).cloned() else {
            return Stats::default();
        };
        Stats {
            rate_limit: state.rl_counter.as_ref().map(|c| {
                let (pass, block) = c.stats();
                RateLimitStats { pass, block }
            }),
            breaker: state.breaker.as_ref().map(|b| BreakerStats {
                state: b.phase(),
                error_rate: b.error_rate(),
                retry_timeout_ms: state.retry_timeout_ms,
            }),
        }
    }

    fn materialize(&self, resource: &str) -> Arc<ResourceState> {
        if let Some(state) = self.resources.read().get(resource) {
            state.last_access_ms.store(now_ms(), Ordering::Relaxed);
            return state.clone();
        }
        let mut resources = self.resources.write();
        if let Some(state) = resources.get(resource) {
            state.last_access_ms.store(now_ms(), Ordering::Relaxed);
            return state.clone();
        }

        let rl_rule = self.registry.resolve_rate_limit(resource);
        let cb_rule = self.registry.resolve_circuit_breaker(resource);

        let rl_counter = rl_rule
            .as_ref()
            .map(|r| SlidingWindowCounter::new(r.window_ms, DEFAULT_BUCKET_COUNT));
        let rl_threshold = rl_rule.as_ref().map_or(f64::INFINITY, |r| r.threshold);
        let breaker = cb_rule.as_ref().map(|r| BreakerState::new(r));
        let breaker_strategy = cb_rule.as_ref().map(|r| r.strategy);
        let max_allowed_rt_ms = cb_rule.as_ref().map_or(0, |r| r.max_allowed_rt_ms);
        let retry_timeout_ms = cb_rule.as_ref().map_or(0, |r| u64::from(r.retry_timeout_ms));

        let state = Arc::new(ResourceState {
            rl_counter,
            rl_threshold,
            breaker,
            breaker_strategy,
            max_allowed_rt_ms,
            retry_timeout_ms,
            last_access_ms: AtomicU64::new(now_ms()),
        });
        resources.insert(resource.to_string(), state.clone());
        state
    }
}
