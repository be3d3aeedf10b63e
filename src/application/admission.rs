//! Admission gate: distributed fixed-window rate limiting.
//!
//! The gate derives a counter key from the client and endpoint, asks the
//! [`CounterStore`] for an atomic increment and turns the reading into an
//! [`AdmissionDecision`] using the rule that applies to the endpoint.
//!
//! A request may also carry the caller's tier, which picks the default rule
//! when no endpoint rule matches, and its source IP. When the gate has an IP
//! rule, the IP is counted on its own key and the stricter of the two
//! decisions wins.
//!
//! # Fail-Open Behavior
//!
//! If the store errors, or the circuit breaker has opened after repeated
//! errors, the request is admitted in degraded mode. Degraded admissions are
//! never silent: a `warn!` event is emitted on the `inference_gate::admission`
//! target with `degraded = true`, the `requests_degraded` metric is
//! incremented and the decision carries
//! [`AdmissionMode::Degraded`](crate::domain::window::AdmissionMode::Degraded).

use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::application::error::{BuildError, GateError};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, CounterStore, StoreError};
use crate::domain::window::{AdmissionDecision, EndpointPattern, EndpointRules, WindowRule};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::memory_store::InMemoryCounterStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Log target for admission events.
pub const ADMISSION_TARGET: &str = "inference_gate::admission";

/// Default requests per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 50;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Default prefix for counter keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:";

/// Namespace inserted after the key prefix for per-IP counters.
pub const IP_KEY_NAMESPACE: &str = "ip:";

/// Everything the gate looks at for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRequest<'a> {
    /// Client identifier the main counter is keyed on
    pub client_id: &'a str,
    /// Endpoint path
    pub endpoint: &'a str,
    /// Caller tier selecting a default rule
    pub tier: Option<&'a str>,
    /// Source address counted against the IP rule
    pub ip: Option<&'a str>,
}

impl<'a> AdmissionRequest<'a> {
    /// A request with no tier and no IP.
    pub fn new(client_id: &'a str, endpoint: &'a str) -> Self {
        Self {
            client_id,
            endpoint,
            tier: None,
            ip: None,
        }
    }

    /// Set the caller tier.
    pub fn with_tier(mut self, tier: &'a str) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Set the source IP.
    pub fn with_ip(mut self, ip: &'a str) -> Self {
        self.ip = Some(ip);
        self
    }
}

/// Decides whether a client may call an endpoint.
///
/// Cheap to clone; clones share the store, breaker and metrics.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    store: Arc<dyn CounterStore>,
    rules: Arc<EndpointRules>,
    ip_rule: Option<WindowRule>,
    key_prefix: Arc<str>,
    breaker: Arc<CircuitBreaker>,
    metrics: Metrics,
}

impl AdmissionGate {
    /// Create a builder with the default limit of 50 requests per 300 seconds.
    pub fn builder() -> AdmissionGateBuilder {
        AdmissionGateBuilder::default()
    }

    /// Check and count one request for `client_id` on `endpoint`.
    ///
    /// Never fails: store errors become degraded admissions.
    pub async fn admit(&self, client_id: &str, endpoint: &str) -> AdmissionDecision {
        self.admit_request(&AdmissionRequest::new(client_id, endpoint)).await
    }

    /// Check and count one request, applying the tier default and the IP
    /// rule when present.
    ///
    /// The breaker is consulted once per request. If either counter cannot
    /// be reached while the other admits, the request is admitted degraded.
    pub async fn admit_request(&self, request: &AdmissionRequest<'_>) -> AdmissionDecision {
        let rule = *self.rules.resolve_for(request.endpoint, request.tier);
        let key = self.key(request.client_id, request.endpoint);

        if !self.breaker.allow_request() {
            self.signal_degraded(&key, "circuit breaker open");
            return AdmissionDecision::degraded(&rule);
        }

        let mut failure = None;
        let mut decision = self.count(&key, &rule, &mut failure).await;
        if let (Some(ip), Some(ip_rule)) = (request.ip, self.ip_rule.as_ref()) {
            let ip_key = self.ip_key(ip, request.endpoint);
            let ip_decision = self.count(&ip_key, ip_rule, &mut failure).await;
            decision = decision.most_restrictive(ip_decision);
        }

        if decision.is_degraded() {
            let reason = failure.map(|error| error.to_string()).unwrap_or_default();
            self.signal_degraded(&key, &reason);
        } else if decision.allowed {
            self.metrics.record_allowed();
            debug!(
                target: ADMISSION_TARGET,
                client_id = request.client_id,
                endpoint = request.endpoint,
                tier = request.tier,
                remaining = decision.remaining,
                "request admitted"
            );
        } else {
            self.metrics.record_denied();
            warn!(
                target: ADMISSION_TARGET,
                client_id = request.client_id,
                endpoint = request.endpoint,
                tier = request.tier,
                ip = request.ip,
                retry_after_ms = decision
                    .retry_after
                    .map_or(0, |retry_after| retry_after.as_millis() as u64),
                "rate limit exceeded"
            );
        }
        decision
    }

    async fn count(
        &self,
        key: &str,
        rule: &WindowRule,
        failure: &mut Option<StoreError>,
    ) -> AdmissionDecision {
        match self.store.increment(key, rule.window()).await {
            Ok(reading) => {
                self.breaker.record_success();
                rule.decide(reading.count, reading.ttl)
            }
            Err(error) => {
                self.breaker.record_failure();
                if failure.is_none() {
                    *failure = Some(error);
                }
                AdmissionDecision::degraded(rule)
            }
        }
    }

    /// Like [`admit`](Self::admit), but a denial becomes [`GateError::RateLimited`].
    pub async fn check(
        &self,
        client_id: &str,
        endpoint: &str,
    ) -> Result<AdmissionDecision, GateError> {
        self.check_request(&AdmissionRequest::new(client_id, endpoint)).await
    }

    /// Like [`admit_request`](Self::admit_request), but a denial becomes
    /// [`GateError::RateLimited`].
    pub async fn check_request(
        &self,
        request: &AdmissionRequest<'_>,
    ) -> Result<AdmissionDecision, GateError> {
        let decision = self.admit_request(request).await;
        match decision.retry_after {
            Some(retry_after) if !decision.allowed => Err(GateError::RateLimited { retry_after }),
            _ => Ok(decision),
        }
    }

    /// Delete the counter for `client_id` on `endpoint`.
    ///
    /// Returns `false` if the store could not be reached.
    pub async fn reset(&self, client_id: &str, endpoint: &str) -> bool {
        let key = self.key(client_id, endpoint);
        match self.store.reset(&key).await {
            Ok(existed) => {
                info!(target: ADMISSION_TARGET, key = %key, existed, "rate limit reset");
                true
            }
            Err(error) => {
                warn!(target: ADMISSION_TARGET, key = %key, error = %error, "failed to reset rate limit");
                false
            }
        }
    }

    /// Delete every counter held for `client_id`, across all endpoints.
    ///
    /// Per-IP counters are left alone. Returns the number of counters
    /// deleted, or `None` if the store could not be reached.
    pub async fn reset_all(&self, client_id: &str) -> Option<u64> {
        let prefix = self.key(client_id, "");
        match self.store.reset_prefix(&prefix).await {
            Ok(removed) => {
                info!(target: ADMISSION_TARGET, client_id, removed, "all rate limits reset");
                Some(removed)
            }
            Err(error) => {
                warn!(target: ADMISSION_TARGET, client_id, error = %error, "failed to reset rate limits");
                None
            }
        }
    }

    /// Counter key for a client and endpoint.
    pub fn key(&self, client_id: &str, endpoint: &str) -> String {
        let mut key =
            String::with_capacity(self.key_prefix.len() + client_id.len() + endpoint.len() + 1);
        key.push_str(&self.key_prefix);
        key.push_str(client_id);
        key.push(':');
        key.push_str(endpoint);
        key
    }

    /// Counter key for a source IP and endpoint.
    pub fn ip_key(&self, ip: &str, endpoint: &str) -> String {
        format!("{}{}{}:{}", self.key_prefix, IP_KEY_NAMESPACE, ip, endpoint)
    }

    /// Rule that applies to `endpoint`.
    pub fn rule_for(&self, endpoint: &str) -> &WindowRule {
        self.rules.resolve(endpoint)
    }

    /// Rule that applies to `endpoint` for a caller in `tier`.
    pub fn rule_for_tier(&self, endpoint: &str, tier: &str) -> &WindowRule {
        self.rules.resolve_for(endpoint, Some(tier))
    }

    /// Per-IP rule, if one is configured.
    pub fn ip_rule(&self) -> Option<&WindowRule> {
        self.ip_rule.as_ref()
    }

    /// Get the shared metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get the circuit breaker guarding the store.
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn signal_degraded(&self, key: &str, reason: &str) {
        self.metrics.record_degraded();
        warn!(
            target: ADMISSION_TARGET,
            key,
            degraded = true,
            reason,
            breaker = ?self.breaker.state(),
            "counter store unavailable, admitting without limit"
        );
    }
}

/// Builder for [`AdmissionGate`].
pub struct AdmissionGateBuilder {
    max_requests: u64,
    window: Duration,
    endpoint_rules: Vec<(String, u64, Duration)>,
    tier_rules: Vec<(String, u64, Duration)>,
    ip_limit: Option<(u64, Duration)>,
    key_prefix: String,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    breaker: CircuitBreakerConfig,
    metrics: Option<Metrics>,
}

impl Default for AdmissionGateBuilder {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            endpoint_rules: Vec::new(),
            tier_rules: Vec::new(),
            ip_limit: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store: None,
            clock: None,
            breaker: CircuitBreakerConfig::default(),
            metrics: None,
        }
    }
}

impl AdmissionGateBuilder {
    /// Set the default limit applied to endpoints without a specific rule.
    pub fn with_limit(mut self, max_requests: u64, window: Duration) -> Self {
        self.max_requests = max_requests;
        self.window = window;
        self
    }

    /// Add a limit for an endpoint pattern.
    ///
    /// `pattern` is either an exact path or a prefix ending in `*`, such as
    /// `/api/admin/*`.
    pub fn with_endpoint_rule(
        mut self,
        pattern: impl Into<String>,
        max_requests: u64,
        window: Duration,
    ) -> Self {
        self.endpoint_rules
            .push((pattern.into(), max_requests, window));
        self
    }

    /// Set the default limit for callers in `tier`.
    ///
    /// Endpoint rules still take precedence over tier defaults.
    pub fn with_tier_limit(
        mut self,
        tier: impl Into<String>,
        max_requests: u64,
        window: Duration,
    ) -> Self {
        self.tier_rules.push((tier.into(), max_requests, window));
        self
    }

    /// Also count requests per source IP against this limit.
    pub fn with_ip_limit(mut self, max_requests: u64, window: Duration) -> Self {
        self.ip_limit = Some((max_requests, window));
        self
    }

    /// Set the prefix prepended to every counter key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the shared counter store. Defaults to an [`InMemoryCounterStore`].
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the clock driving the circuit breaker and the default store.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Configure the circuit breaker.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Share a metrics handle with other components.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the gate.
    ///
    /// # Errors
    /// Returns `BuildError` if a limit is zero, a pattern is malformed or the
    /// breaker threshold is zero.
    pub fn build(self) -> Result<AdmissionGate, BuildError> {
        if self.breaker.failure_threshold == 0 {
            return Err(BuildError::ZeroFailureThreshold);
        }

        let mut rules = EndpointRules::new(WindowRule::new(self.max_requests, self.window)?);
        for (pattern, max_requests, window) in self.endpoint_rules {
            rules.insert(
                EndpointPattern::parse(&pattern)?,
                WindowRule::new(max_requests, window)?,
            );
        }
        for (tier, max_requests, window) in self.tier_rules {
            rules.insert_tier(tier, WindowRule::new(max_requests, window)?);
        }
        let ip_rule = self
            .ip_limit
            .map(|(max_requests, window)| WindowRule::new(max_requests, window))
            .transpose()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryCounterStore::new(Arc::clone(&clock))));

        Ok(AdmissionGate {
            store,
            rules: Arc::new(rules),
            ip_rule,
            key_prefix: Arc::from(self.key_prefix),
            breaker: Arc::new(CircuitBreaker::new(self.breaker, clock)),
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}
