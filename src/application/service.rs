//! Per-request serving flow.
//!
//! [`ServingContext`] owns one instance of every serving component and is
//! passed explicitly to request handlers. `serve` runs the full path:
//! admit, validate, transform through the cache, predict, apply thresholds
//! and optionally publish the result to live subscribers.

use crate::application::admission::{AdmissionGate, AdmissionGateBuilder, AdmissionRequest};
use crate::application::cache::FeatureCache;
use crate::application::error::{BuildError, GateError};
use crate::application::metrics::Metrics;
use crate::application::pipeline::FeaturePipeline;
use crate::application::ports::{Clock, PredictionModel};
use crate::application::registry::ConnectionRegistry;
use crate::domain::feature::FeatureSet;
use crate::domain::prediction::{PredictionResult, ThresholdFilter};
use crate::domain::window::AdmissionDecision;
use crate::infrastructure::memory_store::InMemoryCounterStore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One prediction request as seen by the serving layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// Client network identifier used for admission
    pub client_id: String,
    /// Endpoint path used for admission
    pub endpoint: String,
    /// Caller tier selecting the default admission rule
    #[serde(default)]
    pub tier: Option<String>,
    /// Source IP counted against the gate's IP rule
    #[serde(default)]
    pub ip: Option<String>,
    /// Raw, unvalidated features
    pub features: FeatureSet,
    /// Cache key; a fingerprint of `features` when absent
    #[serde(default)]
    pub cache_key: Option<String>,
    /// Request-level thresholds, overriding the context defaults
    #[serde(default)]
    pub thresholds: ThresholdFilter,
    /// Connection to notify with the result
    #[serde(default)]
    pub notify: Option<String>,
    /// Topic to broadcast the result on
    #[serde(default)]
    pub topic: Option<String>,
}

impl PredictionRequest {
    /// Create a request with no cache key, thresholds or notification target.
    pub fn new(
        client_id: impl Into<String>,
        endpoint: impl Into<String>,
        features: FeatureSet,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            endpoint: endpoint.into(),
            features,
            ..Self::default()
        }
    }

    /// Set the caller tier.
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Set the source IP.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// The admission view of this request.
    pub fn admission(&self) -> AdmissionRequest<'_> {
        AdmissionRequest {
            client_id: &self.client_id,
            endpoint: &self.endpoint,
            tier: self.tier.as_deref(),
            ip: self.ip.as_deref(),
        }
    }

    /// Set an explicit cache key.
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Set request-level thresholds.
    pub fn with_thresholds(mut self, thresholds: ThresholdFilter) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Publish the result to a single connection.
    pub fn notify(mut self, connection_id: impl Into<String>) -> Self {
        self.notify = Some(connection_id.into());
        self
    }

    /// Broadcast the result to a topic.
    pub fn broadcast_to(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

/// Successful result of [`ServingContext::serve`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServeOutcome {
    /// Prediction with any threshold notes appended
    pub result: PredictionResult,
    /// Admission decision for this request
    pub decision: AdmissionDecision,
    /// Whether the transformed features came from the cache
    pub cached: bool,
}

/// Explicitly constructed serving state.
///
/// Replaces process-wide singletons: build one per process (or per test),
/// share it by reference or clone, and call [`shutdown`](Self::shutdown)
/// when done.
#[derive(Debug, Clone)]
pub struct ServingContext {
    gate: AdmissionGate,
    cache: FeatureCache<FeatureSet>,
    pipeline: FeaturePipeline,
    registry: ConnectionRegistry,
    thresholds: ThresholdFilter,
    metrics: Metrics,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
    counter_sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ServingContext {
    /// Assemble a context from components.
    ///
    /// The components should share `metrics`; [`from_parts`](Self::from_parts)
    /// wires that up.
    pub fn new(
        gate: AdmissionGate,
        cache: FeatureCache<FeatureSet>,
        pipeline: FeaturePipeline,
        registry: ConnectionRegistry,
        thresholds: ThresholdFilter,
    ) -> Self {
        let metrics = gate.metrics().clone();
        Self {
            gate,
            cache,
            pipeline,
            registry,
            thresholds,
            metrics,
            sweeper: Arc::new(Mutex::new(None)),
            counter_sweeper: Arc::new(Mutex::new(None)),
        }
    }

    /// Build every component around one clock and one metrics handle.
    ///
    /// `gate` is a builder so the context can inject the shared clock and
    /// metrics; anything the caller set on it explicitly is kept.
    ///
    /// # Errors
    /// Returns `BuildError` if the gate or cache configuration is invalid.
    pub fn from_parts(
        gate: AdmissionGateBuilder,
        cache_ttl: Duration,
        thresholds: ThresholdFilter,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BuildError> {
        let metrics = Metrics::new();
        let gate = gate
            .with_clock(Arc::clone(&clock))
            .with_metrics(metrics.clone())
            .build()?;
        let cache = FeatureCache::builder()
            .with_default_ttl(cache_ttl)
            .with_clock(Arc::clone(&clock))
            .with_metrics(metrics.clone())
            .build()?;

        Ok(Self::new(
            gate,
            cache,
            FeaturePipeline::new(clock),
            ConnectionRegistry::with_metrics(metrics),
            thresholds,
        ))
    }

    /// Serve one prediction request.
    ///
    /// # Errors
    /// - `GateError::RateLimited` if admission is denied
    /// - `GateError::Validation` if the features are rejected
    /// - `GateError::Model` if the model fails
    pub async fn serve<M>(
        &self,
        request: &PredictionRequest,
        model: &M,
    ) -> Result<ServeOutcome, GateError>
    where
        M: PredictionModel + ?Sized,
    {
        let decision = self.gate.check_request(&request.admission()).await?;

        let features = &request.features;
        self.pipeline.validator().check(features)?;

        let pipeline = &self.pipeline;
        let cache_key = match &request.cache_key {
            Some(key) => key.clone(),
            None => format!("features:{:016x}", features.fingerprint()),
        };
        let lookup = self
            .cache
            .get_or_compute(&cache_key, self.cache.default_ttl(), || async move {
                pipeline.process(features)
            })
            .await?;

        let raw = model.predict(&lookup.value).await?;
        let result = self
            .thresholds
            .merged_with(&request.thresholds)
            .apply(raw);

        if result.is_flagged() {
            debug!(
                client_id = %request.client_id,
                confidence = result.confidence,
                "prediction flagged by thresholds"
            );
        }

        self.publish(request, &result);

        Ok(ServeOutcome {
            result,
            decision,
            cached: lookup.hit,
        })
    }

    fn publish(&self, request: &PredictionRequest, result: &PredictionResult) {
        if request.notify.is_none() && request.topic.is_none() {
            return;
        }

        let message = match serde_json::to_string(result) {
            Ok(message) => message,
            Err(error) => {
                warn!(error = %error, "failed to encode prediction for publishing");
                return;
            }
        };

        if let Some(connection_id) = &request.notify {
            self.registry.publish(connection_id, message.as_str());
        }
        if let Some(topic) = &request.topic {
            self.registry.broadcast(topic, &message);
        }
    }

    /// Start the background cache sweeper, replacing any running one.
    ///
    /// # Errors
    /// Returns `BuildError::ZeroSweepInterval` if `interval` is zero.
    pub fn start_cache_sweeper(&self, interval: Duration) -> Result<(), BuildError> {
        let handle = self.cache.spawn_sweeper(interval)?;
        replace_task(&self.sweeper, Some(handle));
        Ok(())
    }

    /// Start dropping elapsed counters from `store` every `interval`,
    /// replacing any running counter sweeper.
    ///
    /// `store` should be the one the gate counts in.
    ///
    /// # Errors
    /// Returns `BuildError::ZeroSweepInterval` if `interval` is zero.
    pub fn start_counter_sweeper(
        &self,
        store: &InMemoryCounterStore,
        interval: Duration,
    ) -> Result<(), BuildError> {
        let handle = store.spawn_sweeper(interval)?;
        replace_task(&self.counter_sweeper, Some(handle));
        Ok(())
    }

    /// Check if a counter sweeper is running.
    pub fn has_counter_sweeper(&self) -> bool {
        self.counter_sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Tear down: stop the sweepers, clear the cache and drop every connection.
    pub fn shutdown(&self) {
        replace_task(&self.sweeper, None);
        replace_task(&self.counter_sweeper, None);

        self.cache.clear();
        let dropped = self.registry.disconnect_all();
        info!(connections = dropped, "serving context shut down");
    }

    /// Get the admission gate.
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Get the feature cache.
    pub fn cache(&self) -> &FeatureCache<FeatureSet> {
        &self.cache
    }

    /// Get the feature pipeline.
    pub fn pipeline(&self) -> &FeaturePipeline {
        &self.pipeline
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Get the default thresholds.
    pub fn thresholds(&self) -> &ThresholdFilter {
        &self.thresholds
    }

    /// Get the shared metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, handle: Option<JoinHandle<()>>) {
    let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let previous = match handle {
        Some(handle) => slot.replace(handle),
        None => slot.take(),
    };
    if let Some(previous) = previous {
        previous.abort();
    }
}
