//! Monitoring records produced by the feature pipeline.

use serde::Serialize;
use std::time::{Duration, SystemTime};

/// One successful pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitoringRecord {
    /// Wall-clock time the record was committed
    pub recorded_at: SystemTime,
    /// Number of features in the transformed set
    pub feature_count: usize,
    /// Time spent validating and transforming
    pub processing_time: Duration,
}

/// Aggregate view over a sequence of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitoringSummary {
    /// Number of records
    pub records: usize,
    /// Sum of feature counts
    pub total_features: usize,
    /// Mean processing time, zero when there are no records
    pub mean_processing_time: Duration,
    /// Largest processing time seen
    pub max_processing_time: Duration,
}

impl MonitoringSummary {
    /// Summarize a slice of records.
    pub fn from_records(records: &[MonitoringRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let total: Duration = records.iter().map(|r| r.processing_time).sum();
        let count = u32::try_from(records.len()).unwrap_or(u32::MAX);

        Self {
            records: records.len(),
            total_features: records.iter().map(|r| r.feature_count).sum(),
            mean_processing_time: total / count,
            max_processing_time: records
                .iter()
                .map(|r| r.processing_time)
                .max()
                .unwrap_or_default(),
        }
    }
}
