//! Configuration schema and loading. `ProtectionConfig` is the
//! wire/file shape; it converts into the engine's internal `RateLimitRule`
//! / `CircuitBreakerRule` types via `to_rules`, keeping the on-disk field
//! names (`resource`, `stat_interval_ms`, ...) decoupled from the internal
//! ones used on the hot path.

use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rules::{BreakerStrategy, CircuitBreakerRule, RateLimitRule};

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ProtectionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limit_rules: Vec<RateLimitRuleConfig>,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerRuleConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitRuleConfig {
    pub name: String,
    pub resource: String,
    pub threshold: f64,
    pub stat_interval_ms: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerRuleConfig {
    pub name: String,
    pub resource: String,
    pub strategy: String,
    pub threshold: f64,
    pub min_request_amount: u64,
    pub stat_interval_ms: u32,
    pub stat_sliding_window_bucket_count: u32,
    pub retry_timeout_ms: u32,
    #[serde(default)]
    pub max_allowed_rt_ms: u64,
    pub probe_num: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RateLimitRuleConfig {
    pub fn to_rule(&self) -> RateLimitRule {
        RateLimitRule {
            name: self.name.clone(),
            pattern: self.resource.clone(),
            threshold: self.threshold,
            window_ms: self.stat_interval_ms,
            enabled: self.enabled,
        }
    }
}

impl CircuitBreakerRuleConfig {
    pub fn to_rule(&self) -> Result<CircuitBreakerRule> {
        let strategy: BreakerStrategy = self.strategy.parse()?;
        Ok(CircuitBreakerRule {
            name: self.name.clone(),
            pattern: self.resource.clone(),
            strategy,
            threshold: self.threshold,
            min_request_amount: self.min_request_amount,
            stat_window_ms: self.stat_interval_ms,
            bucket_count: self.stat_sliding_window_bucket_count,
            retry_timeout_ms: self.retry_timeout_ms,
            max_allowed_rt_ms: self.max_allowed_rt_ms,
            probe_num: self.probe_num,
            enabled: self.enabled,
        })
    }
}

impl ProtectionConfig {
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut cfg: Self = serde_yaml::from_str(&content)?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    /// Converts every configured rule into its engine-internal form,
    /// short-circuiting on the first `InvalidRule`/`InvalidPattern`/
    /// `UnknownStrategy` so a bad config never partially loads.
    pub fn to_rules(&self) -> Result<(Vec<RateLimitRule>, Vec<CircuitBreakerRule>)> {
        let rate_limits = self
            .rate_limit_rules
            .iter()
            .map(|r| Ok(r.to_rule()))
            .collect::<Result<Vec<_>>>()?;
        let breakers = self
            .circuit_breakers
            .iter()
            .map(|r| r.to_rule())
            .collect::<Result<Vec<_>>>()?;
        Ok((rate_limits, breakers))
    }
}

pub fn apply_env_overrides(cfg: &mut ProtectionConfig) {
    if let Ok(v) = env::var("GUARDRAIL_ENABLED") {
        cfg.enabled = v != "0" && v.to_lowercase() != "false";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_rate_limit_rule_config() {
        let rlc = RateLimitRuleConfig {
            name: "h".into(),
            resource: "/health".into(),
            threshold: 2.0,
            stat_interval_ms: 1_000,
            enabled: true,
        };
        let rule = rlc.to_rule();
        assert_eq!(rule.pattern, "/health");
        assert_eq!(rule.window_ms, 1_000);
    }

    #[test]
    fn rejects_unknown_strategy() {
        let cbc = CircuitBreakerRuleConfig {
            name: "c".into(),
            resource: "/x".into(),
            strategy: "Bogus".into(),
            threshold: 0.5,
            min_request_amount: 10,
            stat_interval_ms: 10_000,
            stat_sliding_window_bucket_count: 10,
            retry_timeout_ms: 5_000,
            max_allowed_rt_ms: 0,
            probe_num: 3,
            enabled: true,
        };
        assert!(cbc.to_rule().is_err());
    }

    #[test]
    fn protection_config_defaults_enabled_true() {
        let yaml = "rate_limit_rules: []\ncircuit_breakers: []\n";
        let cfg: ProtectionConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.enabled);
    }
}
