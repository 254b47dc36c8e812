//! Rule registry (C2): holds configured rate-limit and circuit-breaker
//! rules, indexed by pattern, and resolves the best-matching rule for a
//! concrete resource.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pattern;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub name: String,
    pub pattern: String,
    pub threshold: f64,
    pub window_ms: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    /// Effective QPS, derived only — the window pair is the real contract.
    pub fn effective_qps(&self) -> f64 {
        if self.window_ms == 0 {
            return 0.0;
        }
        self.threshold * 1000.0 / f64::from(self.window_ms)
    }

    fn validate(&self) -> Result<()> {
        if !pattern::is_valid(&self.pattern) {
            return Err(Error::InvalidPattern(self.pattern.clone()));
        }
        if self.window_ms == 0 {
            return Err(Error::InvalidRule {
                name: self.name.clone(),
                reason: "window_ms must be nonzero".into(),
            });
        }
        if self.threshold < 0.0 {
            return Err(Error::InvalidRule {
                name: self.name.clone(),
                reason: "threshold must be nonnegative".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerStrategy {
    ErrorRatio,
    ErrorCount,
    SlowRequestRatio,
}

impl FromStr for BreakerStrategy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ErrorRatio" => Ok(Self::ErrorRatio),
            "ErrorCount" => Ok(Self::ErrorCount),
            "SlowRequestRatio" => Ok(Self::SlowRequestRatio),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for BreakerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ErrorRatio => "ErrorRatio",
            Self::ErrorCount => "ErrorCount",
            Self::SlowRequestRatio => "SlowRequestRatio",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRule {
    pub name: String,
    pub pattern: String,
    pub strategy: BreakerStrategy,
    pub threshold: f64,
    pub min_request_amount: u64,
    pub stat_window_ms: u32,
    pub bucket_count: u32,
    pub retry_timeout_ms: u32,
    #[serde(default)]
    pub max_allowed_rt_ms: u64,
    pub probe_num: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl CircuitBreakerRule {
    /// `ErrorCount`'s threshold is a float for config-shape parity with the
    /// ratio strategies but is only ever meaningful as an integer count.
    pub fn error_count_threshold(&self) -> u64 {
        self.threshold as u64
    }

    fn validate(&self) -> Result<()> {
        if !pattern::is_valid(&self.pattern) {
            return Err(Error::InvalidPattern(self.pattern.clone()));
        }
        if self.stat_window_ms == 0 {
            return Err(Error::InvalidRule {
                name: self.name.clone(),
                reason: "stat_window_ms must be nonzero".into(),
            });
        }
        if self.bucket_count == 0 || self.bucket_count > self.stat_window_ms {
            return Err(Error::InvalidRule {
                name: self.name.clone(),
                reason: "bucket_count must be nonzero and <= stat_window_ms".into(),
            });
        }
        if self.probe_num == 0 {
            return Err(Error::InvalidRule {
                name: self.name.clone(),
                reason: "probe_num must be nonzero".into(),
            });
        }
        if self.retry_timeout_ms == 0 {
            return Err(Error::InvalidRule {
                name: self.name.clone(),
                reason: "retry_timeout_ms must be nonzero".into(),
            });
        }
        match self.strategy {
            BreakerStrategy::ErrorRatio | BreakerStrategy::SlowRequestRatio => {
                if !(0.0..=1.0).contains(&self.threshold) {
                    return Err(Error::InvalidRule {
                        name: self.name.clone(),
                        reason: format!(
                            "{} threshold must be within [0.0, 1.0]",
                            self.strategy
                        ),
                    });
                }
            }
            BreakerStrategy::ErrorCount => {
                if self.threshold < 0.0 {
                    return Err(Error::InvalidRule {
                        name: self.name.clone(),
                        reason: "ErrorCount threshold must be nonnegative".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    rate_limits: HashMap<String, Arc<RateLimitRule>>,
    breakers: HashMap<String, Arc<CircuitBreakerRule>>,
    rl_cache: HashMap<String, Option<Arc<RateLimitRule>>>,
    cb_cache: HashMap<String, Option<Arc<CircuitBreakerRule>>>,
}

impl Inner {
    fn invalidate_cache(&mut self) {
        self.rl_cache.clear();
        self.cb_cache.clear();
    }
}

/// Holds configured rules and resolves the best match for a resource.
/// Mutations are rare (config load/reload); reads happen on every request,
/// so the registry favors a read-mostly lock over any write-path cleverness.
pub struct RuleRegistry {
    inner: RwLock<Inner>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn add_or_replace_rate_limit(&self, rule: RateLimitRule) -> Result<()> {
        rule.validate()?;
        let mut inner = self.inner.write();
        inner.rate_limits.insert(rule.name.clone(), Arc::new(rule));
        inner.invalidate_cache();
        Ok(())
    }

    pub fn add_or_replace_circuit_breaker(&self, rule: CircuitBreakerRule) -> Result<()> {
        rule.validate()?;
        let mut inner = self.inner.write();
        inner.breakers.insert(rule.name.clone(), Arc::new(rule));
        inner.invalidate_cache();
        Ok(())
    }

    /// Removing an unknown name is a no-op.
    pub fn remove_rate_limit(&self, name: &str) {
        let mut inner = self.inner.write();
        if inner.rate_limits.remove(name).is_some() {
            inner.invalidate_cache();
        }
    }

    pub fn remove_circuit_breaker(&self, name: &str) {
        let mut inner = self.inner.write();
        if inner.breakers.remove(name).is_some() {
            inner.invalidate_cache();
        }
    }

    pub fn resolve_rate_limit(&self, resource: &str) -> Option<Arc<RateLimitRule>> {
        if let Some(cached) = self.inner.read().rl_cache.get(resource) {
            return cached.clone();
        }
        let rules: Vec<Arc<RateLimitRule>> = self
            .inner
            .read()
            .rate_limits
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        let resolved = resolve_best(resource, &rules, |r| &r.pattern);
        let mut inner = self.inner.write();
        inner.rl_cache.insert(resource.to_string(), resolved.clone());
        resolved
    }

    pub fn resolve_circuit_breaker(&self, resource: &str) -> Option<Arc<CircuitBreakerRule>> {
        if let Some(cached) = self.inner.read().cb_cache.get(resource) {
            return cached.clone();
        }
        let rules: Vec<Arc<CircuitBreakerRule>> = self
            .inner
            .read()
            .breakers
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        let resolved = resolve_best(resource, &rules, |r| &r.pattern);
        let mut inner = self.inner.write();
        inner.cb_cache.insert(resource.to_string(), resolved.clone());
        resolved
    }
}

/// Shared resolution algorithm: exact literal hit first, then
/// the lowest-priority (strongest) matching wildcard rule, ties broken by
/// longest literal prefix then lexicographic pattern string.
fn resolve_best<T>(
    resource: &str,
    rules: &[Arc<T>],
    pattern_of: impl Fn(&T) -> &str,
) -> Option<Arc<T>> {
    if let Some(exact) = rules.iter().find(|r| pattern_of(r) == resource) {
        return Some(exact.clone());
    }
    rules
        .iter()
        .filter(|r| pattern::matches(resource, pattern_of(r)))
        .min_by(|a, b| {
            let pa = pattern_of(a);
            let pb = pattern_of(b);
            pattern::priority(pa)
                .cmp(&pattern::priority(pb))
                .then_with(|| {
                    pattern::literal_prefix_len(pb).cmp(&pattern::literal_prefix_len(pa))
                })
                .then_with(|| pa.cmp(pb))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rl(name: &str, pattern: &str, threshold: f64, window_ms: u32) -> RateLimitRule {
        RateLimitRule {
            name: name.into(),
            pattern: pattern.into(),
            threshold,
            window_ms,
            enabled: true,
        }
    }

    #[test]
    fn literal_beats_wildcard() {
        let reg = RuleRegistry::new();
        reg.add_or_replace_rate_limit(rl("wild", "/api/*", 100.0, 60_000)).unwrap();
        reg.add_or_replace_rate_limit(rl("exact", "/api/special", 1.0, 1_000)).unwrap();
        let resolved = reg.resolve_rate_limit("/api/special").unwrap();
        assert_eq!(resolved.name, "exact");
    }

    #[test]
    fn priority_resolution_e2() {
        let reg = RuleRegistry::new();
        reg.add_or_replace_rate_limit(rl("a", "/api/v1/auth/*", 10.0, 60_000)).unwrap();
        reg.add_or_replace_rate_limit(rl("b", "/api/*", 100.0, 60_000)).unwrap();
        let resolved = reg.resolve_rate_limit("/api/v1/auth/login").unwrap();
        assert_eq!(resolved.name, "a");
    }

    #[test]
    fn remove_unknown_is_noop() {
        let reg = RuleRegistry::new();
        reg.remove_rate_limit("nope");
    }

    #[test]
    fn invalid_pattern_rejected_and_unchanged() {
        let reg = RuleRegistry::new();
        let err = reg.add_or_replace_rate_limit(rl("bad", "", 1.0, 1_000));
        assert!(matches!(err, Err(Error::InvalidPattern(_))));
        assert!(reg.resolve_rate_limit("/x").is_none());
    }

    #[test]
    fn zero_window_rejected() {
        let reg = RuleRegistry::new();
        let err = reg.add_or_replace_rate_limit(rl("z", "/x", 1.0, 0));
        assert!(matches!(err, Err(Error::InvalidRule { .. })));
    }

    #[test]
    fn upsert_is_idempotent() {
        let reg = RuleRegistry::new();
        reg.add_or_replace_rate_limit(rl("a", "/x", 1.0, 1_000)).unwrap();
        reg.add_or_replace_rate_limit(rl("a", "/x", 1.0, 1_000)).unwrap();
        let resolved = reg.resolve_rate_limit("/x").unwrap();
        assert_eq!(resolved.name, "a");
    }

    #[test]
    fn cache_invalidated_on_mutation() {
        let reg = RuleRegistry::new();
        reg.add_or_replace_rate_limit(rl("a", "/x", 1.0, 1_000)).unwrap();
        assert!(reg.resolve_rate_limit("/x").is_some());
        reg.remove_rate_limit("a");
        assert!(reg.resolve_rate_limit("/x").is_none());
    }

    #[test]
    fn unknown_strategy_rejected() {
        assert!(matches!(
            "Bogus".parse::<BreakerStrategy>(),
            Err(Error::UnknownStrategy(_))
        ));
    }

    fn cb(name: &str, pattern: &str, strategy: BreakerStrategy, threshold: f64) -> CircuitBreakerRule {
        CircuitBreakerRule {
            name: name.into(),
            pattern: pattern.into(),
            strategy,
            threshold,
            min_request_amount: 10,
            stat_window_ms: 10_000,
            bucket_count: 10,
            retry_timeout_ms: 5_000,
            max_allowed_rt_ms: 0,
            probe_num: 3,
            enabled: true,
        }
    }

    #[test]
    fn ratio_threshold_out_of_range_rejected() {
        let reg = RuleRegistry::new();
        let err = reg.add_or_replace_circuit_breaker(cb("a", "/x", BreakerStrategy::ErrorRatio, 1.5));
        assert!(matches!(err, Err(Error::InvalidRule { .. })));
    }

    #[test]
    fn bucket_count_exceeding_window_rejected() {
        let mut rule = cb("a", "/x", BreakerStrategy::ErrorCount, 5.0);
        rule.bucket_count = 20_000;
        assert!(rule.validate().is_err());
    }
}
