use async_trait::async_trait;
use inference_gate::{
    AdmissionGate, FeatureSet, FeatureValue, GateError, ModelError, PredictionModel,
    PredictionRequest, PredictionResult, ServingConfig, ServingContext, ThresholdFilter,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Echoes the normalized `score` feature back as confidence.
#[derive(Default)]
struct EchoModel {
    calls: AtomicUsize,
}

#[async_trait]
impl PredictionModel for EchoModel {
    async fn predict(&self, features: &FeatureSet) -> Result<PredictionResult, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let score = features
            .get("score")
            .and_then(FeatureValue::as_number)
            .ok_or_else(|| ModelError::new("missing score"))?;
        Ok(PredictionResult::new(score, "echo"))
    }
}

fn context(config: &str) -> ServingContext {
    let config = ServingConfig::from_toml_str(config).unwrap();
    ServingContext::from_parts(
        config.gate_builder(),
        config.cache_ttl(),
        config.thresholds,
        std::sync::Arc::new(inference_gate::SystemClock::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_serve_normalizes_and_caches_features() {
    let ctx = context("");
    let model = EchoModel::default();
    let request = PredictionRequest::new("c", "/predict", FeatureSet::new().with("score", 80));

    let first = ctx.serve(&request, &model).await.unwrap();
    assert!(!first.cached);
    assert!((first.result.confidence - 0.8).abs() < 1e-9);
    assert_eq!(first.result.explanation, "echo");

    let second = ctx.serve(&request, &model).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.result, first.result);

    // The model runs every time; only the pipeline is skipped on a hit.
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.pipeline().monitor().len(), 1);

    let snapshot = ctx.metrics().snapshot();
    assert_eq!(snapshot.cache_hits, 1);
    assert_eq!(snapshot.cache_misses, 1);
    assert_eq!(snapshot.requests_allowed, 2);
}

#[tokio::test]
async fn test_rate_limited_request_never_reaches_model() {
    let ctx = context("[admission]\nmax_requests = 1\nwindow_seconds = 60");
    let model = EchoModel::default();
    let request = PredictionRequest::new("c", "/predict", FeatureSet::new().with("score", 10));

    ctx.serve(&request, &model).await.unwrap();
    let error = ctx.serve(&request, &model).await.unwrap_err();

    assert!(matches!(error, GateError::RateLimited { .. }));
    assert_eq!(error.status_code(), 429);
    assert_eq!(error.retry_after_secs(), Some(60));
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_features_are_rejected_before_cache() {
    let ctx = context("");
    let model = EchoModel::default();
    let valid = PredictionRequest::new("c", "/predict", FeatureSet::new().with("score", 10))
        .with_cache_key("shared");
    let invalid = PredictionRequest::new(
        "c",
        "/predict",
        FeatureSet::new().with("score", FeatureValue::Null),
    )
    .with_cache_key("shared");

    ctx.serve(&valid, &model).await.unwrap();
    let error = ctx.serve(&invalid, &model).await.unwrap_err();

    assert_eq!(error.status_code(), 400);
    assert_eq!(error.to_string(), "invalid features (null or non-finite): score");
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_model_failure_maps_to_bad_gateway() {
    let ctx = context("");
    let model = EchoModel::default();
    let request = PredictionRequest::new("c", "/predict", FeatureSet::new().with("other", 1));

    let error = ctx.serve(&request, &model).await.unwrap_err();
    assert_eq!(error, GateError::Model("missing score".into()));
    assert_eq!(error.status_code(), 502);
}

#[tokio::test]
async fn test_thresholds_annotate_without_dropping() {
    let ctx = context("[thresholds]\nmin_confidence = 0.5");
    let model = EchoModel::default();

    let low = PredictionRequest::new("c", "/predict", FeatureSet::new().with("score", 20));
    let outcome = ctx.serve(&low, &model).await.unwrap();
    assert!(outcome.result.is_flagged());
    assert!((outcome.result.confidence - 0.2).abs() < 1e-9);
    assert!(outcome.result.explanation.starts_with("echo"));
    assert!(outcome.result.explanation.contains("[Filtered out:"));

    // Request-level thresholds override the defaults.
    let relaxed = PredictionRequest::new("c2", "/predict", FeatureSet::new().with("score", 20))
        .with_thresholds(ThresholdFilter::new(Some(0.1), None));
    let outcome = ctx.serve(&relaxed, &model).await.unwrap();
    assert!(!outcome.result.is_flagged());
    assert_eq!(outcome.result.explanation, "echo");
}

#[tokio::test]
async fn test_results_reach_subscribers() {
    let ctx = context("");
    let model = EchoModel::default();
    let registry = ctx.registry();

    registry.connect("direct", None);
    registry.connect("watcher", None);
    registry.subscribe("watcher", "fraud");
    let mut direct = registry.take_outbox("direct").unwrap();
    let mut watcher = registry.take_outbox("watcher").unwrap();

    let request = PredictionRequest::new("c", "/predict", FeatureSet::new().with("score", 50))
        .notify("direct")
        .broadcast_to("fraud");
    ctx.serve(&request, &model).await.unwrap();

    let message = direct.recv().await.unwrap();
    let published: PredictionResult = serde_json::from_str(&message).unwrap();
    assert!((published.confidence - 0.5).abs() < 1e-9);
    assert_eq!(watcher.recv().await.unwrap(), message);
}

#[tokio::test]
async fn test_notify_unknown_connection_still_serves() {
    let ctx = context("");
    let request = PredictionRequest::new("c", "/predict", FeatureSet::new().with("score", 50))
        .notify("gone");

    assert!(ctx.serve(&request, &EchoModel::default()).await.is_ok());
    assert_eq!(ctx.metrics().snapshot().publish_misses, 1);
}

#[tokio::test]
async fn test_shutdown_clears_state() {
    let ctx = context("");
    let request = PredictionRequest::new("c", "/predict", FeatureSet::new().with("score", 1));
    ctx.serve(&request, &EchoModel::default()).await.unwrap();
    ctx.registry().connect("a", None);
    ctx.start_cache_sweeper(Duration::from_secs(1)).unwrap();

    ctx.shutdown();

    assert!(ctx.cache().is_empty());
    assert_eq!(ctx.registry().connection_count(), 0);
}

#[tokio::test]
async fn test_contexts_are_isolated() {
    let first = context("[admission]\nmax_requests = 1");
    let second = context("[admission]\nmax_requests = 1");

    assert!(first.gate().admit("c", "/e").await.allowed);
    assert!(second.gate().admit("c", "/e").await.allowed);
    assert!(!first.gate().admit("c", "/e").await.allowed);
}

#[test]
fn test_request_deserializes_from_json() {
    let request: PredictionRequest = serde_json::from_str(
        r#"{
            "client_id": "10.0.0.7",
            "endpoint": "/predict",
            "features": {"amount": 12.5, "country": "NL", "verified": true},
            "thresholds": {"max_risk": 0.4}
        }"#,
    )
    .unwrap();

    assert_eq!(request.features.len(), 3);
    assert_eq!(request.thresholds.max_risk, Some(0.4));
    assert_eq!(request.cache_key, None);

    let gate = AdmissionGate::builder().build().unwrap();
    assert_eq!(gate.key(&request.client_id, &request.endpoint), "rate_limit:10.0.0.7:/predict");
}
