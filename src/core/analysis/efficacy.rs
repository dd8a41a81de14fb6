//! Rule efficacy analysis over recorded events.
//!
//! The analyser is deliberately schema-loose: each event is treated as a
//! property bag so that logs written by older builds (or enriched by
//! integrators) still analyse. Events carry no ground-truth label; recall,
//! specificity and accuracy stay at zero unless an integrator supplies
//! labels through [`EfficacyAnalyzer::set_ground_truth`].

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

type EventMap = serde_json::Map<String, Value>;

/// Analyser input failure; offending events are skipped and analysis
/// proceeds.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

/// Performance metrics for a single WAF rule, recomputed per analysis run.
#[derive(Debug, Clone, Serialize)]
pub struct RuleMetrics {
    pub rule_id: String,
    pub rule_name: String,
    pub total_triggers: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub specificity: f64,
    pub accuracy: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub min_latency_ms: f64,
    /// Blocked share of all triggers, in percent.
    pub block_rate: f64,
    /// Distinct reason strings, in first-appearance order.
    pub attack_patterns: Vec<String>,
    /// Ten largest source-address counts, ties broken by insertion order.
    pub top_blocked_ips: Vec<(String, u64)>,
    /// Ten largest URL counts, ties broken by insertion order.
    pub top_blocked_urls: Vec<(String, u64)>,
    pub recommendations: Vec<String>,
    pub last_updated: DateTime<Utc>,
    /// Analysis window, `<start> to <end>` in RFC 3339.
    pub time_window: String,
}

/// Side-by-side comparison of two rules.
#[derive(Debug, Clone, Serialize)]
pub struct RuleComparison {
    pub rule_1: RuleSnapshot,
    pub rule_2: RuleSnapshot,
    pub difference: ComparisonDelta,
}

/// The headline numbers of one rule inside a comparison.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSnapshot {
    pub id: String,
    pub name: String,
    pub f1_score: f64,
    pub precision: f64,
    pub recall: f64,
    pub block_rate: f64,
}

/// Signed differences, first rule minus second.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonDelta {
    pub f1_score_diff: f64,
    pub precision_diff: f64,
    pub recall_diff: f64,
    pub block_rate_diff: f64,
}

/// Whole-batch summary across all analysed rules.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub total_requests: u64,
    pub total_blocked: u64,
    pub block_rate: f64,
    pub total_rules: usize,
    pub avg_f1_score: f64,
    pub avg_precision: f64,
    pub avg_recall: f64,
    pub analysis_start: String,
    pub analysis_end: String,
}

struct AnalyzerInner {
    events: Vec<EventMap>,
    rule_metrics: HashMap<String, RuleMetrics>,
    /// First-appearance order of rule ids, for deterministic reports.
    rule_order: Vec<String>,
    /// Integrator-supplied labels per rule: (false negatives, true negatives).
    ground_truth: HashMap<String, (u64, u64)>,
    total_requests: u64,
    total_blocked: u64,
    analysis_start: DateTime<Utc>,
    analysis_end: Option<DateTime<Utc>>,
}

/// Off-line consumer of the event stream deriving per-rule confusion
/// counts, quality scores and tuning recommendations.
pub struct EfficacyAnalyzer {
    inner: RwLock<AnalyzerInner>,
}

impl EfficacyAnalyzer {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(AnalyzerInner {
                events: Vec::new(),
                rule_metrics: HashMap::new(),
                rule_order: Vec::new(),
                ground_truth: HashMap::new(),
                total_requests: 0,
                total_blocked: 0,
                analysis_start: Utc::now(),
                analysis_end: None,
            }),
        }
    }

    /// Add one event for analysis. Only JSON objects qualify; anything
    /// else is malformed and skipped by the caller.
    pub fn add_event(&self, event: Value) -> Result<(), AnalysisError> {
        let map = match event {
            Value::Object(map) => map,
            other => {
                return Err(AnalysisError::MalformedEvent(format!(
                    "expected an object, got {other}"
                )));
            }
        };

        let mut inner = self.inner.write().expect("analyzer lock poisoned");
        inner.total_requests += 1;
        if map.get("blocked").and_then(Value::as_bool).unwrap_or(false) {
            inner.total_blocked += 1;
        }
        inner.events.push(map);
        Ok(())
    }

    /// Supply authoritative false-negative / true-negative counts for a
    /// rule. Without labels the derived metrics that need them stay zero.
    pub fn set_ground_truth(&self, rule_id: &str, false_negatives: u64, true_negatives: u64) {
        let mut inner = self.inner.write().expect("analyzer lock poisoned");
        inner
            .ground_truth
            .insert(rule_id.to_string(), (false_negatives, true_negatives));
    }

    /// Recompute metrics for every rule seen in the event batch.
    pub fn analyze(&self) {
        let mut inner = self.inner.write().expect("analyzer lock poisoned");
        inner.analysis_end = Some(Utc::now());

        let window = format!(
            "{} to {}",
            inner
                .analysis_start
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            inner
                .analysis_end
                .expect("set above")
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        // Group events by non-empty rule id, keeping first-appearance order.
        let mut grouped: HashMap<String, Vec<usize>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (idx, event) in inner.events.iter().enumerate() {
            let rule_id = match event.get("rule_id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => continue,
            };
            if !grouped.contains_key(&rule_id) {
                order.push(rule_id.clone());
            }
            grouped.entry(rule_id).or_default().push(idx);
        }

        let mut metrics_by_rule = HashMap::new();
        for rule_id in &order {
            let indices = &grouped[rule_id];
            let ground_truth = inner.ground_truth.get(rule_id).copied();
            let mut metrics =
                compute_rule_metrics(rule_id, indices, &inner.events, ground_truth, &window);
            metrics.recommendations = recommendations_for(&metrics);
            metrics_by_rule.insert(rule_id.clone(), metrics);
        }

        inner.rule_metrics = metrics_by_rule;
        inner.rule_order = order;
    }

    /// Metrics for one rule, if it appeared in the analysed batch.
    pub fn rule_metrics(&self, rule_id: &str) -> Option<RuleMetrics> {
        let inner = self.inner.read().expect("analyzer lock poisoned");
        inner.rule_metrics.get(rule_id).cloned()
    }

    /// Metrics for every analysed rule, in first-appearance order.
    pub fn all_metrics(&self) -> Vec<RuleMetrics> {
        let inner = self.inner.read().expect("analyzer lock poisoned");
        inner
            .rule_order
            .iter()
            .filter_map(|id| inner.rule_metrics.get(id).cloned())
            .collect()
    }

    /// The `n` best rules by F1 score, descending.
    pub fn top_rules(&self, n: usize) -> Vec<RuleMetrics> {
        let mut rules = self.all_metrics();
        rules.sort_by(|a, b| {
            b.f1_score
                .partial_cmp(&a.f1_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rules.truncate(n);
        rules
    }

    /// Rules with a high false-positive rate (precision below 0.8 with at
    /// least one false positive), worst first.
    pub fn problematic_rules(&self) -> Vec<RuleMetrics> {
        let mut rules: Vec<RuleMetrics> = self
            .all_metrics()
            .into_iter()
            .filter(|m| m.false_positives > 0 && m.precision < 0.8)
            .collect();
        rules.sort_by(|a, b| b.false_positives.cmp(&a.false_positives));
        rules
    }

    /// Compare two rules. Absent when either id is unknown.
    pub fn compare(&self, rule_id_1: &str, rule_id_2: &str) -> Option<RuleComparison> {
        let inner = self.inner.read().expect("analyzer lock poisoned");
        let m1 = inner.rule_metrics.get(rule_id_1)?;
        let m2 = inner.rule_metrics.get(rule_id_2)?;

        Some(RuleComparison {
            rule_1: snapshot(m1),
            rule_2: snapshot(m2),
            difference: ComparisonDelta {
                f1_score_diff: m1.f1_score - m2.f1_score,
                precision_diff: m1.precision - m2.precision,
                recall_diff: m1.recall - m2.recall,
                block_rate_diff: m1.block_rate - m2.block_rate,
            },
        })
    }

    /// Batch-level summary of the last analysis run.
    pub fn summary(&self) -> AnalysisSummary {
        let inner = self.inner.read().expect("analyzer lock poisoned");

        let total_rules = inner.rule_metrics.len();
        let (mut f1, mut precision, mut recall) = (0.0, 0.0, 0.0);
        for m in inner.rule_metrics.values() {
            f1 += m.f1_score;
            precision += m.precision;
            recall += m.recall;
        }
        if total_rules > 0 {
            let n = total_rules as f64;
            f1 /= n;
            precision /= n;
            recall /= n;
        }

        let block_rate = if inner.total_requests > 0 {
            inner.total_blocked as f64 / inner.total_requests as f64 * 100.0
        } else {
            0.0
        };

        AnalysisSummary {
            total_requests: inner.total_requests,
            total_blocked: inner.total_blocked,
            block_rate,
            total_rules,
            avg_f1_score: f1,
            avg_precision: precision,
            avg_recall: recall,
            analysis_start: inner
                .analysis_start
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            analysis_end: inner
                .analysis_end
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        }
    }
}

impl Default for EfficacyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(m: &RuleMetrics) -> RuleSnapshot {
    RuleSnapshot {
        id: m.rule_id.clone(),
        name: m.rule_name.clone(),
        f1_score: m.f1_score,
        precision: m.precision,
        recall: m.recall,
        block_rate: m.block_rate,
    }
}

fn compute_rule_metrics(
    rule_id: &str,
    indices: &[usize],
    events: &[EventMap],
    ground_truth: Option<(u64, u64)>,
    window: &str,
) -> RuleMetrics {
    let mut true_positives = 0u64;
    let mut false_positives = 0u64;
    let mut rule_name = String::new();

    let mut total_latency = 0.0;
    let mut latency_samples = 0u64;
    let mut min_latency = f64::MAX;
    let mut max_latency: f64 = 0.0;

    let mut patterns: Vec<String> = Vec::new();
    let mut ip_counts = OrderedCounter::new();
    let mut url_counts = OrderedCounter::new();

    for &idx in indices {
        let event = &events[idx];

        if event.get("blocked").and_then(Value::as_bool).unwrap_or(false) {
            true_positives += 1;
        } else {
            false_positives += 1;
        }

        if let Some(latency) = event.get("response_time_ms").and_then(Value::as_f64) {
            total_latency += latency;
            latency_samples += 1;
            min_latency = min_latency.min(latency);
            max_latency = max_latency.max(latency);
        }

        if let Some(reason) = event.get("reason").and_then(Value::as_str) {
            if !reason.is_empty() && !patterns.iter().any(|p| p == reason) {
                patterns.push(reason.to_string());
            }
        }

        if let Some(ip) = event.get("source_ip").and_then(Value::as_str) {
            ip_counts.bump(ip);
        }
        if let Some(url) = event.get("url").and_then(Value::as_str) {
            url_counts.bump(url);
        }
        if let Some(name) = event.get("rule_name").and_then(Value::as_str) {
            rule_name = name.to_string();
        }
    }

    let total_triggers = indices.len() as u64;
    let (false_negatives, true_negatives) = ground_truth.unwrap_or((0, 0));

    let precision = ratio(true_positives, true_positives + false_positives);

    // Recall, specificity and accuracy need ground-truth labels; without
    // them the counts stay zero and so do the derived scores.
    let (recall, specificity, accuracy) = match ground_truth {
        Some(_) => (
            ratio(true_positives, true_positives + false_negatives),
            ratio(true_negatives, true_negatives + false_positives),
            ratio(
                true_positives + true_negatives,
                true_positives + true_negatives + false_positives + false_negatives,
            ),
        ),
        None => (0.0, 0.0, 0.0),
    };

    let f1_score = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    let block_rate = if total_triggers > 0 {
        true_positives as f64 / total_triggers as f64 * 100.0
    } else {
        0.0
    };

    let avg_latency_ms = if latency_samples > 0 {
        total_latency / latency_samples as f64
    } else {
        0.0
    };

    RuleMetrics {
        rule_id: rule_id.to_string(),
        rule_name,
        total_triggers,
        true_positives,
        false_positives,
        true_negatives,
        false_negatives,
        precision,
        recall,
        f1_score,
        specificity,
        accuracy,
        avg_latency_ms,
        max_latency_ms: max_latency,
        min_latency_ms: if min_latency == f64::MAX { 0.0 } else { min_latency },
        block_rate,
        attack_patterns: patterns,
        top_blocked_ips: ip_counts.top_n(10),
        top_blocked_urls: url_counts.top_n(10),
        recommendations: Vec::new(),
        last_updated: Utc::now(),
        time_window: window.to_string(),
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den > 0 { num as f64 / den as f64 } else { 0.0 }
}

/// Deterministic threshold recommendations, worded stably so reports can
/// be diffed across runs.
fn recommendations_for(metrics: &RuleMetrics) -> Vec<String> {
    let mut recommendations = Vec::new();

    if metrics.false_positives > 0 && metrics.precision < 0.8 {
        recommendations.push(format!(
            "High false positive rate ({:.1}%). Consider tuning rule sensitivity or adding whitelists.",
            (1.0 - metrics.precision) * 100.0
        ));
    }

    if metrics.recall > 0.0 && metrics.recall < 0.7 {
        recommendations.push(format!(
            "Low recall rate ({:.1}%). Rule may be missing attack variants. Consider expanding patterns.",
            metrics.recall * 100.0
        ));
    }

    if metrics.avg_latency_ms > 5.0 {
        recommendations.push(format!(
            "High average latency ({:.2}ms). Consider optimizing rule patterns for better performance.",
            metrics.avg_latency_ms
        ));
    }

    if metrics.block_rate < 50.0 && metrics.total_triggers > 100 {
        recommendations.push(
            "Low block rate suggests many false positives. Review and refine rule patterns."
                .to_string(),
        );
    }

    if metrics.block_rate > 95.0 && metrics.total_triggers > 100 {
        recommendations.push(
            "Very high block rate. Verify this is intentional and not over-blocking legitimate traffic."
                .to_string(),
        );
    }

    recommendations
}

/// Counter that remembers first-appearance order so equal counts sort
/// deterministically.
struct OrderedCounter {
    counts: HashMap<String, u64>,
    order: Vec<String>,
}

impl OrderedCounter {
    fn new() -> Self {
        Self {
            counts: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn bump(&mut self, key: &str) {
        if !self.counts.contains_key(key) {
            self.order.push(key.to_string());
        }
        *self.counts.entry(key.to_string()).or_default() += 1;
    }

    fn top_n(&self, n: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .order
            .iter()
            .map(|k| (k.clone(), self.counts[k]))
            .collect();
        // Stable sort keeps insertion order among equal counts.
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(n);
        entries
    }
}
