//! # inference-gate
//!
//! The serving kernel that sits in front of a prediction model: admission
//! control, feature caching, a feature pipeline, advisory result gating and
//! realtime fan-out of results to subscribers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use inference_gate::{
//!     FeatureSet, ModelError, PredictionModel, PredictionRequest, PredictionResult,
//!     ServingConfig, ServingContext,
//! };
//!
//! struct Scorer;
//!
//! #[async_trait]
//! impl PredictionModel for Scorer {
//!     async fn predict(&self, features: &FeatureSet) -> Result<PredictionResult, ModelError> {
//!         let score = features.get("amount").and_then(|v| v.as_number()).unwrap_or(0.0);
//!         Ok(PredictionResult::new(score, "amount score"))
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServingConfig::from_toml_str(
//!     r#"
//!     [admission]
//!     max_requests = 100
//!     window_seconds = 60
//!
//!     [thresholds]
//!     min_confidence = 0.5
//!     "#,
//! )?;
//! let ctx = ServingContext::from_config(&config).await?;
//!
//! let request = PredictionRequest::new(
//!     "10.0.0.7",
//!     "/predict",
//!     FeatureSet::new().with("amount", 42.0),
//! );
//! let outcome = ctx.serve(&request, &Scorer).await?;
//! println!("{} (cached: {})", outcome.result.explanation, outcome.cached);
//!
//! ctx.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Request Flow
//!
//! [`ServingContext::serve`] runs these steps in order and stops at the
//! first failure:
//!
//! 1. **Admission.** Counts the request against the fixed window for
//!    `(client, endpoint)`. Denials carry a `retry_after`.
//! 2. **Validation.** Rejects features with null or non-finite values.
//! 3. **Cache.** Returns previously transformed features, or runs the
//!    pipeline and caches its output.
//! 4. **Model.** Calls the [`PredictionModel`].
//! 5. **Thresholds.** Appends advisory notes. Results are never dropped
//!    and confidence is never changed.
//! 6. **Fan-out.** Sends the result to a connection, a topic or both.
//!
//! Each failure maps to a transport status via [`GateError::status_code`]:
//! 429 for rate limiting, 400 for invalid features and 502 for model errors.
//!
//! ## Admission
//!
//! ```rust,no_run
//! # use inference_gate::AdmissionGate;
//! # use std::time::Duration;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gate = AdmissionGate::builder()
//!     .with_limit(50, Duration::from_secs(300))
//!     .with_endpoint_rule("/api/auth/login", 5, Duration::from_secs(300))
//!     .with_endpoint_rule("/api/admin/*", 10, Duration::from_secs(60))
//!     .build()?;
//!
//! let decision = gate.admit("10.0.0.7", "/api/auth/login").await;
//! if !decision.allowed {
//!     println!("retry after {:?}", decision.retry_after);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Callers can also be limited by tier and by source IP. The stricter of
//! the client and IP decisions wins:
//!
//! ```rust,no_run
//! # use inference_gate::{AdmissionGate, AdmissionRequest};
//! # use std::time::Duration;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gate = AdmissionGate::builder()
//!     .with_limit(100, Duration::from_secs(3600))
//!     .with_tier_limit("premium", 5000, Duration::from_secs(3600))
//!     .with_ip_limit(1000, Duration::from_secs(3600))
//!     .build()?;
//!
//! let request = AdmissionRequest::new("user-42", "/predict")
//!     .with_tier("premium")
//!     .with_ip("10.0.0.7");
//! let decision = gate.admit_request(&request).await;
//! # let _ = decision;
//! gate.reset_all("user-42").await;
//! # Ok(())
//! # }
//! ```
//!
//! Counters live in a [`CounterStore`]. The default is in-process; enable
//! the `redis-storage` feature to share budgets across instances.
//!
//! ## Fail-Open Operation
//!
//! When the counter store is unreachable the gate admits requests instead of
//! rejecting them. A circuit breaker stops calling a failing store until it
//! has had time to recover, then lets a single probe through. A Redis that
//! is down at startup makes [`ServingContext::from_config`] fall back to
//! in-process counters with a warning. Every degraded admission:
//!
//! - logs a `warn!` on the `inference_gate::admission` target with `degraded = true`
//! - increments `requests_degraded` in [`MetricsSnapshot`]
//! - reports [`AdmissionMode::Degraded`] on the decision
//!
//! ```rust,no_run
//! # use inference_gate::{AdmissionGate, CircuitState};
//! # let gate = AdmissionGate::builder().build().unwrap();
//! match gate.circuit_breaker().state() {
//!     CircuitState::Closed => println!("enforcing limits"),
//!     CircuitState::Open => println!("store down, admitting in degraded mode"),
//!     CircuitState::HalfOpen => println!("probing the store"),
//! }
//! ```
//!
//! ## Observability
//!
//! ```rust,no_run
//! # use inference_gate::ServingContext;
//! # fn report(ctx: &ServingContext) {
//! let snapshot = ctx.metrics().snapshot();
//! println!("denial rate: {:.2}%", snapshot.denial_rate() * 100.0);
//! println!("cache hit rate: {:.2}%", snapshot.cache_hit_rate() * 100.0);
//!
//! let summary = ctx.pipeline().monitor().summary();
//! println!("{} pipeline runs", summary.records);
//! # }
//! ```

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    feature::{FeatureSet, FeatureValue},
    monitoring::{MonitoringRecord, MonitoringSummary},
    prediction::{PredictionResult, ThresholdFilter},
    window::{AdmissionDecision, AdmissionMode, EndpointPattern, EndpointRules, RuleError, WindowRule},
};

pub use application::{
    admission::{AdmissionGate, AdmissionGateBuilder, AdmissionRequest, ADMISSION_TARGET},
    cache::{CacheLookup, FeatureCache, FeatureCacheBuilder},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    error::{BuildError, GateError, ValidationError},
    metrics::{Metrics, MetricsSnapshot},
    pipeline::{FeatureMonitor, FeaturePipeline, FeatureTransformer, FeatureValidator},
    ports::{Clock, CounterReading, CounterStore, ModelError, PredictionModel, StoreError},
    registry::{ConnectionRegistry, HealthReport, Metadata, Outbox},
    service::{PredictionRequest, ServeOutcome, ServingContext},
};

pub use infrastructure::{
    clock::SystemClock,
    config::{ConfigError, ServingConfig},
    memory_store::InMemoryCounterStore,
    storage::ShardedStorage,
    telemetry::init_tracing,
};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_store::{RedisCounterStore, RedisCounterStoreConfig};
