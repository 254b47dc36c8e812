//! In-process traffic protection: rate limiting and circuit breaking for
//! HTTP middleware and RPC interceptors, with no persisted state.
//!
//! The core (`pattern`, `rules`, `limiter`, `breaker`, `engine`) is plain
//! synchronous code with no `.await` points, so it can be called from both
//! async (HTTP) and sync (RPC interceptor) call sites without blocking a
//! runtime thread. See [`ProtectionEngine`] for the main entry point.

pub mod adapters;
pub mod breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod pattern;
pub mod rules;
pub mod sweep;

pub use config::ProtectionConfig;
pub use engine::{Decision, Handle, ProtectionEngine, ReportOutcome, Stats};
pub use error::{Error, Result};
pub use rules::{BreakerStrategy, CircuitBreakerRule, RateLimitRule, RuleRegistry};
