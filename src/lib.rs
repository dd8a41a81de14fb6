//! Palisade - an inline HTTP reverse-proxy web application firewall.
//!
//! Palisade sits between clients and an origin server, evaluates every
//! request against an ordered rule set and either forwards it or refuses
//! it with a fixed 403. Each decision is projected into a structured
//! event stream that the bundled efficacy analyser consumes off-line to
//! measure per-rule precision, recall and latency.
//!
//! # Features
//! - Phase-ordered rule evaluation (headers, URI, body) with compiled
//!   matchers: substring, regex, SQLi/XSS heuristics, Shannon entropy
//! - Request body interception so matchers and the forwarder read the
//!   same bytes
//! - Enforce, dry-run and interactive operating modes
//! - Event fan-out to an in-memory ring, JSONL and CSV sinks
//! - Off-line rule efficacy analysis and traffic anomaly detection
//! - Graceful shutdown draining in-flight requests
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use palisade::core::waf::{RequestContext, RuleEngine};
//!
//! let engine = Arc::new(RuleEngine::with_default_rules());
//! let ctx = RequestContext::new(
//!     "GET",
//!     "/?id=1%27%20OR%20%271%27%3D%271",
//!     Default::default(),
//!     Default::default(),
//!     None,
//! );
//! let evaluation = engine.evaluate(&ctx);
//! println!("{:?}: {}", evaluation.decision, evaluation.reason);
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping business logic inside `core`. The
//! binary crate wires the adapters together; embedders can compose the
//! pieces directly.
//!
//! # Error Handling
//! All fallible APIs return `eyre::Result<T>` or a domain specific error
//! type (`WafError`, `SinkError`, `AnalysisError`, `HttpClientError`).

pub mod adapters;
pub mod config;
pub mod core;
pub mod events;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{ProxyHandler, ProxyMode, RequestInterceptor, UpstreamClient},
    core::analysis::{AnomalyDetector, EfficacyAnalyzer},
    core::waf::RuleEngine,
    events::EventSink,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
