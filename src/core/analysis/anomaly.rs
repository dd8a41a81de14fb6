//! Statistical anomaly detection over request traffic.
//!
//! A thresholding sibling of the rule engine: instead of matching
//! patterns it tracks request rate, payload sizes and payload entropy
//! and records an [`Anomaly`] whenever an observation crosses its
//! configured threshold.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Detection thresholds. Crossing any of them records an anomaly.
#[derive(Debug, Clone)]
pub struct AnomalyThresholds {
    /// Requests per second before the rate is anomalous.
    pub request_rate: f64,
    /// Payload bytes before a payload is anomalously large.
    pub payload_size: u64,
    /// Shannon entropy (bits) before a payload counts as encoded.
    pub entropy: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            request_rate: 1000.0,
            payload_size: 10 * 1024 * 1024,
            entropy: 4.5,
        }
    }
}

/// User agents treated as anomalous on exact match.
const SUSPICIOUS_AGENTS: [&str; 12] = [
    "BadBot",
    "SQLMap",
    "Nikto",
    "Nmap",
    "Masscan",
    "Nessus",
    "OpenVAS",
    "Metasploit",
    "Burp",
    "Zaproxy",
    "curl",
    "wget",
];

/// One detected anomaly.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    /// "request_rate", "payload_size", "entropy", "user_agent" or
    /// "ip_address".
    pub kind: String,
    pub severity: String,
    pub value: f64,
    pub threshold: f64,
    pub description: String,
}

/// Aggregate traffic statistics maintained alongside detection.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyStatistics {
    pub total_requests: u64,
    pub unique_ips: usize,
    pub unique_user_agents: usize,
    pub avg_payload_size: f64,
    pub avg_entropy: f64,
    pub large_payloads: u64,
    pub encoded_payloads: u64,
    pub total_anomalies: usize,
}

struct DetectorInner {
    total_requests: u64,
    request_timestamps: Vec<DateTime<Utc>>,
    payload_sizes: Vec<u64>,
    entropy_values: Vec<f64>,
    ip_counts: HashMap<String, u64>,
    user_agent_counts: HashMap<String, u64>,
    large_payloads: u64,
    encoded_payloads: u64,
    anomalies: Vec<Anomaly>,
}

/// Threshold-based anomaly detector with mutex-guarded aggregate state.
pub struct AnomalyDetector {
    thresholds: AnomalyThresholds,
    inner: RwLock<DetectorInner>,
}

impl AnomalyDetector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self {
            thresholds,
            inner: RwLock::new(DetectorInner {
                total_requests: 0,
                request_timestamps: Vec::new(),
                payload_sizes: Vec::new(),
                entropy_values: Vec::new(),
                ip_counts: HashMap::new(),
                user_agent_counts: HashMap::new(),
                large_payloads: 0,
                encoded_payloads: 0,
                anomalies: Vec::new(),
            }),
        }
    }

    /// Record one request observation and run threshold checks.
    pub fn record_request(
        &self,
        timestamp: DateTime<Utc>,
        source_ip: &str,
        user_agent: &str,
        payload_size: u64,
        entropy: f64,
    ) {
        let mut inner = self.inner.write().expect("anomaly detector lock poisoned");

        inner.total_requests += 1;
        inner.request_timestamps.push(timestamp);
        inner.payload_sizes.push(payload_size);
        inner.entropy_values.push(entropy);
        *inner.ip_counts.entry(source_ip.to_string()).or_default() += 1;
        *inner
            .user_agent_counts
            .entry(user_agent.to_string())
            .or_default() += 1;

        // Request rate over the trailing second.
        if inner.request_timestamps.len() > 1 {
            let cutoff = timestamp - Duration::seconds(1);
            let rate = inner
                .request_timestamps
                .iter()
                .filter(|&&t| t > cutoff)
                .count() as f64;
            if rate > self.thresholds.request_rate {
                inner.anomalies.push(Anomaly {
                    timestamp,
                    kind: "request_rate".to_string(),
                    severity: "high".to_string(),
                    value: rate,
                    threshold: self.thresholds.request_rate,
                    description: format!("Abnormally high request rate: {rate:.2} req/s"),
                });
            }
        }

        if payload_size > self.thresholds.payload_size {
            inner.large_payloads += 1;
            inner.anomalies.push(Anomaly {
                timestamp,
                kind: "payload_size".to_string(),
                severity: "medium".to_string(),
                value: payload_size as f64,
                threshold: self.thresholds.payload_size as f64,
                description: format!("Unusually large payload: {payload_size} bytes"),
            });
        }

        if entropy > self.thresholds.entropy {
            inner.encoded_payloads += 1;
            inner.anomalies.push(Anomaly {
                timestamp,
                kind: "entropy".to_string(),
                severity: "medium".to_string(),
                value: entropy,
                threshold: self.thresholds.entropy,
                description: format!("High entropy payload detected: {entropy:.2}"),
            });
        }

        if SUSPICIOUS_AGENTS.contains(&user_agent) {
            inner.anomalies.push(Anomaly {
                timestamp,
                kind: "user_agent".to_string(),
                severity: "low".to_string(),
                value: 0.0,
                threshold: 0.0,
                description: format!("Suspicious user agent: {user_agent}"),
            });
        }

        let ip_volume = inner.ip_counts[source_ip];
        if ip_volume > 100 {
            inner.anomalies.push(Anomaly {
                timestamp,
                kind: "ip_address".to_string(),
                severity: "medium".to_string(),
                value: ip_volume as f64,
                threshold: 100.0,
                description: format!("High request volume from IP {source_ip}: {ip_volume} requests"),
            });
        }
    }

    /// Snapshot of all recorded anomalies.
    pub fn anomalies(&self) -> Vec<Anomaly> {
        let inner = self.inner.read().expect("anomaly detector lock poisoned");
        inner.anomalies.clone()
    }

    /// Snapshot filtered by severity.
    pub fn anomalies_by_severity(&self, severity: &str) -> Vec<Anomaly> {
        let inner = self.inner.read().expect("anomaly detector lock poisoned");
        inner
            .anomalies
            .iter()
            .filter(|a| a.severity == severity)
            .cloned()
            .collect()
    }

    /// Forget all recorded anomalies, keeping the traffic aggregates.
    pub fn clear_anomalies(&self) {
        let mut inner = self.inner.write().expect("anomaly detector lock poisoned");
        inner.anomalies.clear();
    }

    /// Aggregate statistics over everything recorded so far.
    pub fn statistics(&self) -> AnomalyStatistics {
        let inner = self.inner.read().expect("anomaly detector lock poisoned");

        let avg_payload_size = mean(inner.payload_sizes.iter().map(|&s| s as f64));
        let avg_entropy = mean(inner.entropy_values.iter().copied());

        AnomalyStatistics {
            total_requests: inner.total_requests,
            unique_ips: inner.ip_counts.len(),
            unique_user_agents: inner.user_agent_counts.len(),
            avg_payload_size,
            avg_entropy,
            large_payloads: inner.large_payloads,
            encoded_payloads: inner.encoded_payloads,
            total_anomalies: inner.anomalies.len(),
        }
    }

    /// Standard deviation of the recorded payload sizes.
    pub fn payload_size_stddev(&self) -> f64 {
        let inner = self.inner.read().expect("anomaly detector lock poisoned");
        if inner.payload_sizes.len() < 2 {
            return 0.0;
        }

        let mean = mean(inner.payload_sizes.iter().map(|&s| s as f64));
        let variance = inner
            .payload_sizes
            .iter()
            .map(|&s| {
                let diff = s as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / inner.payload_sizes.len() as f64;
        variance.sqrt()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0u64), |(s, c), v| (s + v, c + 1));
    if count > 0 { sum / count as f64 } else { 0.0 }
}
