//! Error types shared across the application layer.

use crate::application::ports::ModelError;
use crate::domain::window::RuleError;
use std::time::Duration;
use thiserror::Error;

/// A feature set failed validation.
///
/// Carries the names of the offending features, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid features (null or non-finite): {}", .features.join(", "))]
pub struct ValidationError {
    features: Vec<String>,
}

impl ValidationError {
    /// Create a validation error for the given feature names.
    pub fn new(mut features: Vec<String>) -> Self {
        features.sort();
        features.dedup();
        Self { features }
    }

    /// Names of the features that failed validation.
    pub fn features(&self) -> &[String] {
        &self.features
    }
}

/// Request-facing failure of [`ServingContext::serve`](crate::application::service::ServingContext::serve).
///
/// Only validation and rate-limit failures are client errors; everything
/// else the serving path recovers from internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// The request's features were rejected
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The client exceeded its admission limit
    #[error("rate limit exceeded, retry after {}s", round_up_secs(.retry_after))]
    RateLimited {
        /// Time until the current window closes
        retry_after: Duration,
    },
    /// The external model failed
    #[error("model call failed: {0}")]
    Model(String),
}

impl GateError {
    /// HTTP status the serving layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GateError::Validation(_) => 400,
            GateError::RateLimited { .. } => 429,
            GateError::Model(_) => 502,
        }
    }

    /// Whole seconds for a `Retry-After` header, if this is a rate-limit error.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GateError::RateLimited { retry_after } => Some(round_up_secs(retry_after)),
            _ => None,
        }
    }
}

impl From<ModelError> for GateError {
    fn from(error: ModelError) -> Self {
        GateError::Model(error.message)
    }
}

/// Round up to whole seconds, never below one.
fn round_up_secs(retry_after: &Duration) -> u64 {
    let secs = retry_after.as_secs();
    let secs = if retry_after.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    };
    secs.max(1)
}

/// Invalid builder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// An admission rule or endpoint pattern was rejected
    #[error("invalid admission rule: {0}")]
    Rule(#[from] RuleError),
    /// Circuit breaker would never open
    #[error("failure_threshold must be greater than 0")]
    ZeroFailureThreshold,
    /// Cache entries would expire immediately
    #[error("default_ttl must be greater than 0")]
    ZeroDefaultTtl,
    /// Sweeper would spin
    #[error("sweep interval must be greater than 0")]
    ZeroSweepInterval,
}
