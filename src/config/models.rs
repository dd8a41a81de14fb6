//! Configuration data structures for Palisade.
//!
//! These types map directly to YAML (also JSON / TOML) configuration
//! files. They are intentionally serde-friendly and include defaults so
//! that minimal configs remain concise. CLI flags override file values.

use serde::{Deserialize, Serialize};

use crate::core::waf::RuleSpec;

/// Top-level application configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Origin URL traffic is forwarded to; the scheme must be present.
    pub proxy_to: String,
    /// TCP port the proxy listens on.
    pub port: u16,
    /// Read/write timeout in seconds, applied to both the client and the
    /// upstream leg.
    pub timeout_secs: u64,
    /// Evaluate and record, never refuse.
    pub dry_run: bool,
    /// Ask the operator before refusing.
    pub interactive: bool,
    /// Largest request body buffered for inspection, in bytes.
    pub max_body_bytes: usize,
    /// Event sink destinations.
    pub events: EventLogConfig,
    /// Anomaly detection thresholds.
    pub anomaly: AnomalyConfig,
    /// Custom rules admitted at startup, after the default set.
    pub rules: Vec<RuleSpec>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_to: String::new(),
            port: 8080,
            timeout_secs: 30,
            dry_run: false,
            interactive: false,
            max_body_bytes: 10 * 1024 * 1024,
            events: EventLogConfig::default(),
            anomaly: AnomalyConfig::default(),
            rules: Vec::new(),
        }
    }
}

/// Event sink configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventLogConfig {
    /// Newline-delimited JSON log, appended per event.
    pub json_path: Option<String>,
    /// Tabular log with the fixed header.
    pub csv_path: Option<String>,
    /// Colourised per-event stdout line.
    pub stdout: bool,
    /// In-memory ring bound.
    pub max_events: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            json_path: None,
            csv_path: None,
            stdout: true,
            max_events: 1000,
        }
    }
}

/// Anomaly detection thresholds.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Requests per second before the rate is anomalous.
    pub request_rate_threshold: f64,
    /// Payload bytes before a payload is anomalously large.
    pub payload_size_threshold: u64,
    /// Shannon entropy (bits) before a payload counts as encoded.
    pub entropy_threshold: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            request_rate_threshold: 1000.0,
            payload_size_threshold: 10 * 1024 * 1024,
            entropy_threshold: 4.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.timeout_secs, 30);
        assert!(!config.dry_run);
        assert!(!config.interactive);
        assert_eq!(config.events.max_events, 1000);
        assert!((config.anomaly.entropy_threshold - 4.5).abs() < 1e-9);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"proxy_to": "http://localhost:3000", "port": 9090}"#)
                .expect("deserializes");
        assert_eq!(config.proxy_to, "http://localhost:3000");
        assert_eq!(config.port, 9090);
        assert_eq!(config.timeout_secs, 30);
        assert!(config.events.stdout);
    }
}
