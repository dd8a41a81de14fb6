//! Off-line analysis over the structured event stream.
//!
//! The efficacy analyser derives per-rule precision/recall metrics from
//! recorded events; the anomaly detector tracks statistical outliers in
//! traffic shape. Both keep their own aggregate state behind a lock and
//! are recomputed from scratch per analysis run.

pub mod anomaly;
pub mod efficacy;

pub use anomaly::{Anomaly, AnomalyDetector, AnomalyThresholds};
pub use efficacy::{AnalysisError, EfficacyAnalyzer, RuleComparison, RuleMetrics};
