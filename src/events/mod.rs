//! Structured event schema and fan-out sink.
//!
//! Every request lifecycle produces exactly one [`Event`]. The sink fronts
//! three destinations behind one mutex: a bounded in-memory ring, a
//! newline-delimited JSON file and a tabular (CSV) file. The ring is
//! authoritative; file write failures are reported to stderr and never
//! abort the request path.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed tabular header. Field order is contractual; do not reorder.
pub const CSV_HEADER: &str =
    "Timestamp,EventID,EventType,Severity,SourceIP,Method,URL,StatusCode,Blocked,RuleID,RuleName,Reason";

/// Event type for an ordinary request lifecycle.
pub const EVENT_TYPE_REQUEST: &str = "request";
/// Event type for a blocked request.
pub const EVENT_TYPE_BLOCKED: &str = "blocked";
/// Event type for a detected traffic anomaly.
pub const EVENT_TYPE_ANOMALY: &str = "anomaly";

/// Durable projection of one request lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    /// Receipt timestamp, RFC 3339. Assigned by the sink when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Monotonic identifier, unique per process. Assigned by the sink
    /// when empty.
    #[serde(default)]
    pub event_id: String,
    /// "request", "blocked" or "anomaly".
    #[serde(default)]
    pub event_type: String,
    /// Severity echoed from the triggering rule, empty when none.
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub source_ip: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub request_size: u64,
    #[serde(default)]
    pub response_size: u64,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_action: String,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Sample of the request payload, when one was buffered.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
    /// Shannon entropy of the payload sample.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub payload_entropy: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query_params: HashMap<String, String>,
    /// Open-ended metadata (contained faults, mode annotations).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub response_time_ms: i64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl Event {
    fn csv_line(&self) -> String {
        let timestamp = self
            .timestamp
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            timestamp,
            self.event_id,
            self.event_type,
            self.severity,
            self.source_ip,
            self.method,
            self.url,
            self.status_code,
            self.blocked,
            self.rule_id,
            self.rule_name,
            self.reason,
        )
    }
}

/// Event sink I/O failure. The in-memory ring remains authoritative.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// File and ring configuration for the sink.
#[derive(Debug, Clone, Default)]
pub struct SinkOptions {
    /// Newline-delimited JSON file, opened in append mode.
    pub json_path: Option<PathBuf>,
    /// Tabular file; the fixed header is written once when empty.
    pub csv_path: Option<PathBuf>,
    /// Ring bound; oldest events are evicted past it.
    pub max_events: usize,
    /// Colourised per-event stdout line.
    pub stdout: bool,
}

struct SinkInner {
    ring: VecDeque<Event>,
    json_file: Option<File>,
    csv_file: Option<File>,
}

/// Thread-safe append-only sink fronting the ring and the file
/// destinations. All writers serialise on one mutex.
pub struct EventSink {
    inner: Mutex<SinkInner>,
    max_events: usize,
    stdout: bool,
    next_id: AtomicU64,
}

impl EventSink {
    /// Open the sink. File destinations are created on demand; opening a
    /// destination is the only fallible step.
    pub fn new(options: SinkOptions) -> Result<Self, SinkError> {
        let json_file = match &options.json_path {
            Some(path) => Some(open_append(path)?),
            None => None,
        };

        let csv_file = match &options.csv_path {
            Some(path) => {
                let mut file = open_append(path)?;
                if file.metadata()?.len() == 0 {
                    writeln!(file, "{CSV_HEADER}")?;
                }
                Some(file)
            }
            None => None,
        };

        Ok(Self {
            inner: Mutex::new(SinkInner {
                ring: VecDeque::with_capacity(options.max_events.min(1024)),
                json_file,
                csv_file,
            }),
            max_events: options.max_events.max(1),
            stdout: options.stdout,
            next_id: AtomicU64::new(1),
        })
    }

    /// In-memory only sink, handy for tests and offline tooling.
    pub fn in_memory(max_events: usize) -> Self {
        Self::new(SinkOptions {
            max_events,
            ..SinkOptions::default()
        })
        .expect("in-memory sink cannot fail to open")
    }

    /// Append one event: stamp it, push it onto the ring (evicting the
    /// oldest past the bound) and mirror it to the enabled file sinks.
    /// File failures go to stderr; the ring write always succeeds.
    pub fn log_event(&self, mut event: Event) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        if event.event_id.is_empty() {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            event.event_id = format!("evt-{n}");
        }

        let mut inner = self.inner.lock().expect("event sink mutex poisoned");

        inner.ring.push_back(event.clone());
        while inner.ring.len() > self.max_events {
            inner.ring.pop_front();
        }

        if let Some(file) = inner.json_file.as_mut() {
            if let Err(e) = write_jsonl(file, &event) {
                eprintln!("palisade: failed to write event to JSON log: {e}");
            }
        }

        if let Some(file) = inner.csv_file.as_mut() {
            if let Err(e) = writeln!(file, "{}", event.csv_line()) {
                eprintln!("palisade: failed to write event to CSV log: {e}");
            }
        }

        drop(inner);

        if self.stdout {
            print_event(&event);
        }
    }

    /// Snapshot of all ring events, insertion order.
    pub fn events(&self) -> Vec<Event> {
        let inner = self.inner.lock().expect("event sink mutex poisoned");
        inner.ring.iter().cloned().collect()
    }

    /// Snapshot of blocked events only.
    pub fn blocked_events(&self) -> Vec<Event> {
        let inner = self.inner.lock().expect("event sink mutex poisoned");
        inner.ring.iter().filter(|e| e.blocked).cloned().collect()
    }

    /// Snapshot filtered by severity label.
    pub fn events_by_severity(&self, severity: &str) -> Vec<Event> {
        let inner = self.inner.lock().expect("event sink mutex poisoned");
        inner
            .ring
            .iter()
            .filter(|e| e.severity == severity)
            .cloned()
            .collect()
    }

    /// Snapshot filtered by rule id.
    pub fn events_by_rule(&self, rule_id: &str) -> Vec<Event> {
        let inner = self.inner.lock().expect("event sink mutex poisoned");
        inner
            .ring
            .iter()
            .filter(|e| e.rule_id == rule_id)
            .cloned()
            .collect()
    }

    /// Serialise the current ring to a pretty JSON array at `path`.
    pub fn export_json(&self, path: &Path) -> Result<(), SinkError> {
        let events = self.events();
        let data = serde_json::to_vec_pretty(&events)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Write the current ring to a fresh tabular file at `path`.
    pub fn export_csv(&self, path: &Path) -> Result<(), SinkError> {
        let events = self.events();
        let mut file = File::create(path)?;
        writeln!(file, "{CSV_HEADER}")?;
        for event in &events {
            writeln!(file, "{}", event.csv_line())?;
        }
        Ok(())
    }

    /// Aggregate statistics over the current ring.
    pub fn statistics(&self) -> SinkStatistics {
        let inner = self.inner.lock().expect("event sink mutex poisoned");

        let total_events = inner.ring.len() as u64;
        let mut blocked_events = 0u64;
        let mut severity_counts: HashMap<String, u64> = HashMap::new();
        let mut rule_counts: HashMap<String, u64> = HashMap::new();

        for event in &inner.ring {
            if event.blocked {
                blocked_events += 1;
            }
            if !event.severity.is_empty() {
                *severity_counts.entry(event.severity.clone()).or_default() += 1;
            }
            if !event.rule_id.is_empty() {
                *rule_counts.entry(event.rule_id.clone()).or_default() += 1;
            }
        }

        let block_rate = if total_events > 0 {
            blocked_events as f64 / total_events as f64 * 100.0
        } else {
            0.0
        };

        SinkStatistics {
            total_events,
            blocked_events,
            allowed_events: total_events - blocked_events,
            block_rate,
            severity_counts,
            rule_counts,
        }
    }
}

/// Aggregate counts over the sink's ring.
#[derive(Debug, Clone, Serialize)]
pub struct SinkStatistics {
    pub total_events: u64,
    pub blocked_events: u64,
    pub allowed_events: u64,
    /// Blocked share of all events, in percent.
    pub block_rate: f64,
    pub severity_counts: HashMap<String, u64>,
    pub rule_counts: HashMap<String, u64>,
}

fn open_append(path: &Path) -> Result<File, SinkError> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

fn write_jsonl(file: &mut File, event: &Event) -> Result<(), SinkError> {
    let line = serde_json::to_string(event)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn print_event(event: &Event) {
    let flag = if event.blocked { "✗" } else { "✓" };
    let timestamp = event
        .timestamp
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default();
    let line = format!(
        "[{}] {} {} {} {} {} {} {}",
        timestamp,
        flag,
        event.method,
        event.url,
        event.source_ip,
        event.status_code,
        event.rule_name,
        event.reason,
    );

    let coloured = match event.severity.as_str() {
        "critical" => line.bright_red(),
        "high" => line.red(),
        "medium" => line.yellow(),
        "low" => line.cyan(),
        _ => line.normal(),
    };
    println!("{coloured}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(rule_id: &str, severity: &str, blocked: bool) -> Event {
        Event {
            event_type: if blocked {
                EVENT_TYPE_BLOCKED.to_string()
            } else {
                EVENT_TYPE_REQUEST.to_string()
            },
            severity: severity.to_string(),
            source_ip: "10.0.0.1".to_string(),
            method: "GET".to_string(),
            url: "/".to_string(),
            status_code: if blocked { 403 } else { 200 },
            rule_id: rule_id.to_string(),
            blocked,
            ..Event::default()
        }
    }

    #[test]
    fn sink_assigns_monotonic_ids_and_timestamps() {
        let sink = EventSink::in_memory(16);
        sink.log_event(event("", "", false));
        sink.log_event(event("", "", false));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "evt-1");
        assert_eq!(events[1].event_id, "evt-2");
        assert!(events[0].timestamp.is_some());
    }

    #[test]
    fn ring_evicts_oldest_past_bound() {
        let sink = EventSink::in_memory(3);
        for _ in 0..5 {
            sink.log_event(event("", "", false));
        }

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_id, "evt-3");
        assert_eq!(events[2].event_id, "evt-5");
    }

    #[test]
    fn queries_filter_snapshots_in_insertion_order() {
        let sink = EventSink::in_memory(16);
        sink.log_event(event("1001", "critical", true));
        sink.log_event(event("", "", false));
        sink.log_event(event("1001", "critical", true));
        sink.log_event(event("1002", "high", false));

        assert_eq!(sink.blocked_events().len(), 2);
        assert_eq!(sink.events_by_rule("1001").len(), 2);
        assert_eq!(sink.events_by_severity("high").len(), 1);
        let by_rule = sink.events_by_rule("1001");
        assert_eq!(by_rule[0].event_id, "evt-1");
        assert_eq!(by_rule[1].event_id, "evt-3");
    }

    #[test]
    fn statistics_aggregate_counts() {
        let sink = EventSink::in_memory(16);
        sink.log_event(event("1001", "critical", true));
        sink.log_event(event("1001", "critical", true));
        sink.log_event(event("", "", false));
        sink.log_event(event("1002", "medium", false));

        let stats = sink.statistics();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.blocked_events, 2);
        assert_eq!(stats.allowed_events, 2);
        assert!((stats.block_rate - 50.0).abs() < 1e-9);
        assert_eq!(stats.severity_counts.get("critical"), Some(&2));
        assert_eq!(stats.rule_counts.get("1001"), Some(&2));
    }

    #[test]
    fn empty_sink_has_zero_block_rate() {
        let sink = EventSink::in_memory(4);
        assert_eq!(sink.statistics().block_rate, 0.0);
    }

    #[test]
    fn csv_file_gets_exactly_one_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv_path = dir.path().join("events.csv");

        {
            let sink = EventSink::new(SinkOptions {
                csv_path: Some(csv_path.clone()),
                max_events: 8,
                ..SinkOptions::default()
            })
            .expect("sink opens");
            sink.log_event(event("1001", "critical", true));
        }
        {
            // Reopening an existing non-empty file must not repeat the header.
            let sink = EventSink::new(SinkOptions {
                csv_path: Some(csv_path.clone()),
                max_events: 8,
                ..SinkOptions::default()
            })
            .expect("sink reopens");
            sink.log_event(event("1002", "high", false));
        }

        let contents = std::fs::read_to_string(&csv_path).expect("readable");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].contains("1001"));
        assert!(lines[2].contains("1002"));
    }

    #[test]
    fn jsonl_lines_parse_back_into_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let json_path = dir.path().join("events.jsonl");

        let sink = EventSink::new(SinkOptions {
            json_path: Some(json_path.clone()),
            max_events: 8,
            ..SinkOptions::default()
        })
        .expect("sink opens");
        sink.log_event(event("1001", "critical", true));
        sink.log_event(event("", "", false));

        let contents = std::fs::read_to_string(&json_path).expect("readable");
        let parsed: Vec<Event> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid JSONL"))
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].rule_id, "1001");
        assert!(parsed[0].blocked);
        assert_eq!(parsed[1].rule_id, "");
    }

    #[test]
    fn exports_write_the_current_ring() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = EventSink::in_memory(8);
        sink.log_event(event("1001", "critical", true));

        let json_out = dir.path().join("export.json");
        sink.export_json(&json_out).expect("json export");
        let parsed: Vec<Event> =
            serde_json::from_str(&std::fs::read_to_string(&json_out).expect("readable"))
                .expect("valid JSON array");
        assert_eq!(parsed.len(), 1);

        let csv_out = dir.path().join("export.csv");
        sink.export_csv(&csv_out).expect("csv export");
        let contents = std::fs::read_to_string(&csv_out).expect("readable");
        assert!(contents.starts_with(CSV_HEADER));
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn missing_fields_default_when_deserializing() {
        let parsed: Event = serde_json::from_str(r#"{"event_type":"request"}"#).expect("parses");
        assert_eq!(parsed.status_code, 0);
        assert_eq!(parsed.rule_id, "");
        assert!(parsed.headers.is_empty());
        assert!(!parsed.blocked);
        assert!(parsed.timestamp.is_none());
    }
}
