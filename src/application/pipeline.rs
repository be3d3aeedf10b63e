//! Feature pipeline: validate, normalize, record.
//!
//! [`FeaturePipeline::process`] runs the three steps in order. Validation
//! failure stops the pipeline before anything is transformed or recorded.
//! Monitoring runs only after a successful transform and can never fail the
//! pipeline.

use crate::application::error::ValidationError;
use crate::application::ports::Clock;
use crate::domain::feature::{FeatureSet, FeatureValue};
use crate::domain::monitoring::{MonitoringRecord, MonitoringSummary};
use crate::infrastructure::clock::SystemClock;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

/// Divisor applied to every numeric feature.
pub const NORMALIZATION_SCALE: f64 = 100.0;

/// Rejects feature sets containing nulls or non-finite numbers.
///
/// This is stricter than a null-only check: NaN and infinities are also
/// refused, since they cannot be encoded as JSON numbers and would poison
/// normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureValidator;

impl FeatureValidator {
    /// Check a feature set, naming every offending feature on failure.
    ///
    /// # Errors
    /// Returns `ValidationError` if any value is null, NaN or infinite.
    pub fn check(&self, features: &FeatureSet) -> Result<(), ValidationError> {
        let invalid: Vec<String> = features
            .iter()
            .filter(|(_, value)| !Self::is_valid(value))
            .map(|(name, _)| name.to_string())
            .collect();

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(invalid))
        }
    }

    /// Check a feature set, returning only whether it passed.
    pub fn validate(&self, features: &FeatureSet) -> bool {
        features.iter().all(|(_, value)| Self::is_valid(value))
    }

    fn is_valid(value: &FeatureValue) -> bool {
        match value {
            FeatureValue::Null => false,
            FeatureValue::Number(n) => n.is_finite(),
            FeatureValue::Bool(_) | FeatureValue::Text(_) => true,
        }
    }
}

/// Scales numeric features onto the model's reference scale.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureTransformer;

impl FeatureTransformer {
    /// Divide every number by [`NORMALIZATION_SCALE`], leaving other values as is.
    ///
    /// The input is not modified and no feature is dropped.
    pub fn transform(&self, features: &FeatureSet) -> FeatureSet {
        features.map_values(|value| match value {
            FeatureValue::Number(n) => FeatureValue::Number(n / NORMALIZATION_SCALE),
            other => other.clone(),
        })
    }
}

/// Failure to append a monitoring record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// A writer panicked while holding the record lock
    #[error("monitoring records lock poisoned")]
    Poisoned,
}

/// Append-only, in-memory log of pipeline runs.
#[derive(Debug, Clone)]
pub struct FeatureMonitor {
    records: Arc<RwLock<Vec<MonitoringRecord>>>,
    clock: Arc<dyn Clock>,
}

impl FeatureMonitor {
    /// Create an empty monitor stamping records with `clock`'s wall time.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            clock,
        }
    }

    /// Append a record for a transformed feature set.
    ///
    /// # Errors
    /// Returns `MonitorError::Poisoned` if the record log is unusable.
    pub fn record(
        &self,
        features: &FeatureSet,
        processing_time: Duration,
    ) -> Result<(), MonitorError> {
        let mut records = self.records.write().map_err(|_| MonitorError::Poisoned)?;
        records.push(MonitoringRecord {
            recorded_at: self.clock.wall_time(),
            feature_count: features.len(),
            processing_time,
        });
        Ok(())
    }

    /// All records in recording order. Reading never consumes them.
    pub fn get_metrics(&self) -> Vec<MonitoringRecord> {
        self.read_records(|records| records.to_vec())
    }

    /// Records stamped at or after `since`, in recording order.
    ///
    /// Wall time can step backwards, so the log is scanned in full rather
    /// than assumed sorted.
    pub fn records_since(&self, since: SystemTime) -> Vec<MonitoringRecord> {
        self.read_records(|records| {
            records
                .iter()
                .filter(|record| record.recorded_at >= since)
                .cloned()
                .collect()
        })
    }

    /// Aggregate count, feature total and latency over all records.
    pub fn summary(&self) -> MonitoringSummary {
        self.read_records(MonitoringSummary::from_records)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.read_records(|records| records.len())
    }

    /// Check if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_records<R>(&self, f: impl FnOnce(&[MonitoringRecord]) -> R) -> R {
        // Records are only ever pushed whole, so a poisoned log is still consistent.
        let records = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&records)
    }
}

/// Validate, transform and monitor in one call.
#[derive(Debug, Clone)]
pub struct FeaturePipeline {
    validator: FeatureValidator,
    transformer: FeatureTransformer,
    monitor: FeatureMonitor,
    clock: Arc<dyn Clock>,
}

impl FeaturePipeline {
    /// Create a pipeline timed and stamped by `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            validator: FeatureValidator,
            transformer: FeatureTransformer,
            monitor: FeatureMonitor::new(Arc::clone(&clock)),
            clock,
        }
    }

    /// Run validate, transform and monitor.
    ///
    /// # Errors
    /// Returns `ValidationError` if validation fails; nothing is transformed
    /// or recorded in that case.
    pub fn process(&self, features: &FeatureSet) -> Result<FeatureSet, ValidationError> {
        let started = self.clock.now();

        self.validator.check(features)?;
        let transformed = self.transformer.transform(features);

        let elapsed = self.clock.now().saturating_duration_since(started);
        if let Err(error) = self.monitor.record(&transformed, elapsed) {
            warn!(error = %error, "failed to record feature metrics");
        } else {
            debug!(
                features = transformed.len(),
                elapsed_us = elapsed.as_micros() as u64,
                "features processed"
            );
        }

        Ok(transformed)
    }

    /// Get the validator.
    pub fn validator(&self) -> &FeatureValidator {
        &self.validator
    }

    /// Get the transformer.
    pub fn transformer(&self) -> &FeatureTransformer {
        &self.transformer
    }

    /// Get the monitor.
    pub fn monitor(&self) -> &FeatureMonitor {
        &self.monitor
    }
}

impl Default for FeaturePipeline {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::time::Instant;

    fn pipeline() -> (FeaturePipeline, MockClock) {
        let clock = MockClock::with_wall_time(Instant::now(), SystemTime::UNIX_EPOCH);
        (FeaturePipeline::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_validate_rejects_null() {
        let validator = FeatureValidator;
        let with_null = FeatureSet::new().with("a", 1).with("b", FeatureValue::Null);
        let complete = FeatureSet::new().with("a", 1).with("b", 2);

        assert!(!validator.validate(&with_null));
        assert!(validator.validate(&complete));
    }

    #[test]
    fn test_validate_rejects_non_finite_numbers() {
        let validator = FeatureValidator;

        assert!(!validator.validate(&FeatureSet::new().with("a", f64::NAN)));
        assert!(!validator.validate(&FeatureSet::new().with("a", f64::INFINITY)));
        assert!(!validator.validate(&FeatureSet::new().with("a", f64::NEG_INFINITY)));
        assert!(validator.validate(&FeatureSet::new().with("a", f64::MAX)));
    }

    #[test]
    fn test_check_names_offending_features() {
        let features = FeatureSet::new()
            .with("z", FeatureValue::Null)
            .with("ok", "text")
            .with("a", f64::NAN)
            .with("m", f64::INFINITY);

        let error = FeatureValidator.check(&features).unwrap_err();
        assert_eq!(error.features(), ["a", "m", "z"].map(String::from));
    }

    #[test]
    fn test_empty_set_is_valid() {
        assert!(FeatureValidator.validate(&FeatureSet::new()));
    }

    #[test]
    fn test_transform_scales_numbers_only() {
        let input = FeatureSet::new().with("a", 50).with("b", "text").with("c", true);
        let output = FeatureTransformer.transform(&input);

        assert_eq!(output.get("a"), Some(&FeatureValue::Number(0.5)));
        assert_eq!(output.get("b"), Some(&FeatureValue::Text("text".into())));
        assert_eq!(output.get("c"), Some(&FeatureValue::Bool(true)));
        assert_eq!(input.get("a"), Some(&FeatureValue::Number(50.0)));
    }

    #[test]
    fn test_process_records_after_transform() {
        let (pipeline, _) = pipeline();
        let output = pipeline
            .process(&FeatureSet::new().with("a", 10).with("b", 20))
            .unwrap();

        assert_eq!(output.get("b"), Some(&FeatureValue::Number(0.2)));
        let records = pipeline.monitor().get_metrics();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].feature_count, 2);
        assert_eq!(records[0].recorded_at, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_validation_failure_records_nothing() {
        let (pipeline, _) = pipeline();
        let result = pipeline.process(&FeatureSet::new().with("a", FeatureValue::Null));

        assert!(result.is_err());
        assert!(pipeline.monitor().is_empty());
    }

    #[test]
    fn test_get_metrics_is_restartable() {
        let (pipeline, _) = pipeline();
        pipeline.process(&FeatureSet::new().with("a", 1)).unwrap();

        assert_eq!(pipeline.monitor().get_metrics(), pipeline.monitor().get_metrics());
    }

    #[test]
    fn test_records_since_and_summary() {
        let (pipeline, clock) = pipeline();
        pipeline.process(&FeatureSet::new().with("a", 1)).unwrap();
        clock.advance(Duration::from_secs(10));
        pipeline
            .process(&FeatureSet::new().with("a", 1).with("b", 2))
            .unwrap();

        let cutoff = SystemTime::UNIX_EPOCH + Duration::from_secs(5);
        let recent = pipeline.monitor().records_since(cutoff);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].feature_count, 2);

        let summary = pipeline.monitor().summary();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.total_features, 3);
    }

    #[test]
    fn test_records_since_survives_wall_clock_stepping_back() {
        let start = Instant::now() + Duration::from_secs(60);
        let origin = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let clock = MockClock::with_wall_time(start, origin);
        let monitor = FeatureMonitor::new(Arc::new(clock.clone()));
        let features = FeatureSet::new().with("a", 1);

        monitor.record(&features, Duration::ZERO).unwrap();
        clock.set(start - Duration::from_secs(5));
        monitor.record(&features, Duration::ZERO).unwrap();
        clock.advance(Duration::from_secs(1));
        monitor.record(&features, Duration::ZERO).unwrap();

        let recent = monitor.records_since(SystemTime::UNIX_EPOCH + Duration::from_secs(8));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].recorded_at, origin);

        let all = monitor.records_since(SystemTime::UNIX_EPOCH);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_poisoned_monitor_does_not_fail_pipeline() {
        let (pipeline, _) = pipeline();
        let records = Arc::clone(&pipeline.monitor().records);
        let _ = std::thread::spawn(move || {
            let _guard = records.write().unwrap();
            panic!("poison the monitor");
        })
        .join();

        let output = pipeline.process(&FeatureSet::new().with("a", 100));
        assert_eq!(output.unwrap().get("a"), Some(&FeatureValue::Number(1.0)));
    }
}
