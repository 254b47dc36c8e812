//! Error taxonomy for the protection engine's mutation and construction APIs.
//!
//! Hot-path operations (`Acquire`, `Report`, `Stats`) never fail: they always
//! return a decision. Only mutation entry points (`AddOrReplace*`, `Remove`)
//! and engine construction can fail, and a failure leaves the registry
//! unchanged.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid rule `{name}`: {reason}")]
    InvalidRule { name: String, reason: String },

    #[error("unknown circuit breaker strategy: {0}")]
    UnknownStrategy(String),

    #[error("duplicate rule name: {0}")]
    DuplicateName(String),
}

pub type Result<T> = std::result::Result<T, Error>;
