//! Fixed-window admission rules and decisions.
//!
//! A window rule allows at most `max_requests` per key within each window.
//! The window opens at the key's first request and closes `window` later;
//! the next request after that opens a fresh window.
//!
//! # Window boundaries
//!
//! Fixed windows let a burst of up to `2 × max_requests` through when it
//! straddles a boundary: `max_requests` at the very end of one window and
//! `max_requests` at the very start of the next. This is an accepted property
//! of the algorithm, not a bug.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error returned when a window rule is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// `max_requests` must be at least one
    #[error("max_requests must be greater than 0")]
    ZeroMaxRequests,
    /// Window length must be non-zero
    #[error("window duration must be greater than 0")]
    ZeroWindow,
    /// Endpoint pattern is empty or has a misplaced wildcard
    #[error("invalid endpoint pattern {0:?}: '*' is only allowed as the final character")]
    InvalidPattern(String),
}

/// Limit applied to one (client, endpoint) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRule {
    max_requests: u64,
    window: Duration,
}

impl WindowRule {
    /// Create a rule allowing `max_requests` per `window`.
    ///
    /// # Errors
    /// Returns `RuleError` if either value is zero.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self, RuleError> {
        if max_requests == 0 {
            return Err(RuleError::ZeroMaxRequests);
        }
        if window.is_zero() {
            return Err(RuleError::ZeroWindow);
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    /// Convenience constructor taking the window in whole seconds.
    pub fn per_seconds(max_requests: u64, window_seconds: u64) -> Result<Self, RuleError> {
        Self::new(max_requests, Duration::from_secs(window_seconds))
    }

    /// Maximum admitted requests per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Turn a post-increment counter reading into a decision.
    ///
    /// `count` is the value after this request's increment and `ttl` the
    /// time left in the window.
    pub fn decide(&self, count: u64, ttl: Duration) -> AdmissionDecision {
        if count <= self.max_requests {
            AdmissionDecision {
                allowed: true,
                retry_after: None,
                remaining: self.max_requests - count,
                reset_after: ttl,
                mode: AdmissionMode::Enforced,
            }
        } else {
            AdmissionDecision {
                allowed: false,
                retry_after: Some(ttl),
                remaining: 0,
                reset_after: ttl,
                mode: AdmissionMode::Enforced,
            }
        }
    }
}

/// Counter state for one key inside a single process.
///
/// Used by in-memory counter stores; the Redis adapter keeps the same
/// state server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    count: u64,
    expires_at: Instant,
}

impl WindowCounter {
    /// Open a new window at `now` with a count of zero.
    pub fn open(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            expires_at: now + window,
        }
    }

    /// Increment the counter, opening a fresh window if the current one
    /// has elapsed. The expiry is only ever written when a window opens.
    ///
    /// Returns the post-increment count and the time left in the window.
    pub fn increment(&mut self, now: Instant, window: Duration) -> (u64, Duration) {
        if self.is_expired(now) {
            *self = Self::open(now, window);
        }
        self.count = self.count.saturating_add(1);
        (self.count, self.expires_at.saturating_duration_since(now))
    }

    /// Check if the window has elapsed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Absolute expiry of the current window.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Whether a decision was made against the counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Counter store consulted, limit enforced
    Enforced,
    /// Counter store unavailable, request allowed without counting
    Degraded,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Time until the window resets, present only on denial
    pub retry_after: Option<Duration>,
    /// Requests left in the current window
    pub remaining: u64,
    /// Time until the window resets
    pub reset_after: Duration,
    /// Whether the limit was actually enforced
    pub mode: AdmissionMode,
}

impl AdmissionDecision {
    /// Fail-open decision used when the counter store cannot be consulted.
    pub fn degraded(rule: &WindowRule) -> Self {
        Self {
            allowed: true,
            retry_after: None,
            remaining: rule.max_requests(),
            reset_after: rule.window(),
            mode: AdmissionMode::Degraded,
        }
    }

    /// Check if this decision was made in degraded mode.
    pub fn is_degraded(&self) -> bool {
        self.mode == AdmissionMode::Degraded
    }

    /// Combine two checks on the same request, keeping the stricter one.
    ///
    /// A denial beats an admission; of two denials the longer wait wins; of
    /// two admissions the one with fewer requests left wins. An admission is
    /// reported as degraded if either check was.
    pub fn most_restrictive(self, other: AdmissionDecision) -> AdmissionDecision {
        let degraded = self.is_degraded() || other.is_degraded();
        let mut winner = match (self.allowed, other.allowed) {
            (false, true) => self,
            (true, false) => other,
            (false, false) if other.retry_after > self.retry_after => other,
            (false, false) => self,
            (true, true) if other.remaining < self.remaining => other,
            (true, true) => self,
        };
        if winner.allowed && degraded {
            winner.mode = AdmissionMode::Degraded;
        }
        winner
    }
}

/// An endpoint pattern: either an exact path or a prefix ending in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointPattern {
    /// Matches one path exactly
    Exact(String),
    /// Matches every path starting with the prefix
    Prefix(String),
}

impl EndpointPattern {
    /// Parse a pattern such as `/api/auth/login` or `/api/admin/*`.
    ///
    /// # Errors
    /// Returns `RuleError::InvalidPattern` for empty patterns or a `*`
    /// anywhere but the end.
    pub fn parse(pattern: &str) -> Result<Self, RuleError> {
        if pattern.is_empty() {
            return Err(RuleError::InvalidPattern(pattern.to_string()));
        }
        match pattern.find('*') {
            None => Ok(EndpointPattern::Exact(pattern.to_string())),
            Some(idx) if idx == pattern.len() - 1 => {
                Ok(EndpointPattern::Prefix(pattern[..idx].to_string()))
            }
            Some(_) => Err(RuleError::InvalidPattern(pattern.to_string())),
        }
    }

    fn matches(&self, endpoint: &str) -> bool {
        match self {
            EndpointPattern::Exact(path) => path == endpoint,
            EndpointPattern::Prefix(prefix) => endpoint.starts_with(prefix.as_str()),
        }
    }
}

/// Rule table: per-endpoint overrides on top of per-tier and global defaults.
///
/// Lookup order: exact match, then the longest matching prefix, then the
/// caller's tier default, then the global default. Unknown tiers fall back
/// to the global default.
#[derive(Debug, Clone)]
pub struct EndpointRules {
    default_rule: WindowRule,
    overrides: Vec<(EndpointPattern, WindowRule)>,
    tiers: BTreeMap<String, WindowRule>,
}

impl EndpointRules {
    /// Create a table with only a default rule.
    pub fn new(default_rule: WindowRule) -> Self {
        Self {
            default_rule,
            overrides: Vec::new(),
            tiers: BTreeMap::new(),
        }
    }

    /// Add or replace the default rule for a caller tier such as
    /// `authenticated` or `premium`.
    pub fn insert_tier(&mut self, tier: impl Into<String>, rule: WindowRule) {
        self.tiers.insert(tier.into(), rule);
    }

    /// Default rule for a tier, if one is configured.
    pub fn tier_rule(&self, tier: &str) -> Option<&WindowRule> {
        self.tiers.get(tier)
    }

    /// Add or replace the rule for a pattern.
    pub fn insert(&mut self, pattern: EndpointPattern, rule: WindowRule) {
        if let Some(slot) = self.overrides.iter_mut().find(|(p, _)| *p == pattern) {
            slot.1 = rule;
        } else {
            self.overrides.push((pattern, rule));
        }
    }

    /// The fallback rule.
    pub fn default_rule(&self) -> &WindowRule {
        &self.default_rule
    }

    /// Resolve the rule for an endpoint, ignoring tiers.
    pub fn resolve(&self, endpoint: &str) -> &WindowRule {
        self.resolve_for(endpoint, None)
    }

    /// Resolve the rule for an endpoint called by a caller in `tier`.
    pub fn resolve_for(&self, endpoint: &str, tier: Option<&str>) -> &WindowRule {
        let exact = self.overrides.iter().find(|(pattern, _)| {
            matches!(pattern, EndpointPattern::Exact(_)) && pattern.matches(endpoint)
        });
        if let Some((_, rule)) = exact {
            return rule;
        }

        self.overrides
            .iter()
            .filter_map(|(pattern, rule)| match pattern {
                EndpointPattern::Prefix(prefix) if pattern.matches(endpoint) => {
                    Some((prefix.len(), rule))
                }
                _ => None,
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, rule)| rule)
            .or_else(|| tier.and_then(|tier| self.tiers.get(tier)))
            .unwrap_or(&self.default_rule)
    }
}
