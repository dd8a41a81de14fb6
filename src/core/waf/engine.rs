//! Rule engine that evaluates a request against the admitted rule set.
//!
//! Rules are evaluated in three passes over the request phases in fixed
//! order: headers, URI, body. Within a pass rules run in insertion order;
//! the first matching `block` rule decides the request. `log` rules are
//! reported but never change the decision.

use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};

use axum::body::Bytes;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::rule::{Rule, RuleAction, RulePhase, RuleSpec, Severity};
use super::{Decision, WafError};

/// Per-request transient context. The body is buffered before any matcher
/// runs so that matchers and the forwarder see identical bytes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method.
    pub method: String,
    /// Raw request-URI including the query component.
    pub uri: String,
    /// Request headers, multi-valued with case-insensitive lookup.
    pub headers: HeaderMap,
    /// Buffered request body.
    pub body: Bytes,
    /// Remote peer address, when known.
    pub remote_addr: Option<SocketAddr>,
    /// Receipt timestamp.
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(
        method: impl Into<String>,
        uri: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers,
            body,
            remote_addr,
            received_at: Utc::now(),
        }
    }

    /// Percent-decoded query-string values, in declaration order.
    pub fn query_values(&self) -> Vec<String> {
        self.query_pairs().into_iter().map(|(_, v)| v).collect()
    }

    /// Percent-decoded query-string pairs, in declaration order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let query = match self.uri.split_once('?') {
            Some((_, q)) => q,
            None => return Vec::new(),
        };

        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(key), decode_component(value))
            })
            .collect()
    }

    /// Buffered body interpreted as UTF-8, lossily.
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn decode_component(raw: &str) -> String {
    // Query strings encode spaces as '+' (form-encoding semantics);
    // translate them before percent-decoding.
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| raw.clone())
}

/// The rule that settled (or annotated) an evaluation.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub id: u32,
    pub name: String,
    pub action: RuleAction,
    pub severity: Severity,
}

/// Outcome of evaluating one request against the rule set.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Allow or Block; Log never decides a request.
    pub decision: Decision,
    /// `Rule <id>: <name>` for non-Allow outcomes, empty otherwise.
    pub reason: String,
    /// First blocking rule, or the first matching log rule when nothing
    /// blocked.
    pub matched: Option<RuleMatch>,
    /// Faults contained during evaluation (matcher panics, unknown
    /// targets). Recorded in event metadata.
    pub faults: Vec<String>,
}

impl Evaluation {
    fn allowed(matched: Option<RuleMatch>, faults: Vec<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: String::new(),
            matched,
            faults,
        }
    }

    fn blocked(rule: &Rule, faults: Vec<String>) -> Self {
        Self {
            decision: Decision::Block,
            reason: format!("Rule {}: {}", rule.id, rule.name),
            matched: Some(RuleMatch {
                id: rule.id,
                name: rule.name.clone(),
                action: rule.action,
                severity: rule.severity,
            }),
            faults,
        }
    }
}

/// Ordered, read-mostly rule set with phase-ordered evaluation.
///
/// Admission is externally synchronised (rules are loaded before serving
/// begins); evaluation takes no lock.
pub struct RuleEngine {
    rules: Vec<Rule>,
}

/// The three request phases, in decision order. A block in an earlier
/// phase always pre-empts a match in a later one.
const REQUEST_PHASES: [RulePhase; 3] = [
    RulePhase::RequestHeaders,
    RulePhase::RequestUri,
    RulePhase::RequestBody,
];

impl RuleEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Create an engine pre-loaded with the default rule set.
    pub fn with_default_rules() -> Self {
        let mut engine = Self::new();
        for spec in default_rule_specs() {
            let id = spec.id;
            match engine.add_spec(spec) {
                Ok(()) => {}
                Err(e) => warn!(rule_id = id, error = %e, "failed to compile default rule"),
            }
        }
        debug!(count = engine.rules.len(), "loaded default WAF rules");
        engine
    }

    /// Admit a compiled rule. Re-admitting an id replaces the previous
    /// rule, keeping identifiers unique.
    pub fn add_rule(&mut self, rule: Rule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule;
        } else {
            self.rules.push(rule);
        }
    }

    /// Compile and admit a rule spec. A bad pattern rejects the rule and
    /// leaves the set unchanged.
    pub fn add_spec(&mut self, spec: RuleSpec) -> Result<(), WafError> {
        let rule = spec.compile()?;
        debug!(rule_id = rule.id, name = %rule.name, "admitted rule");
        self.add_rule(rule);
        Ok(())
    }

    /// Remove a rule by id. Returns whether a rule was removed.
    pub fn remove_rule(&mut self, id: u32) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.rules.len() != before
    }

    /// All admitted rules, in insertion order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate the request against all enabled rules, phase by phase.
    pub fn evaluate(&self, ctx: &RequestContext) -> Evaluation {
        let mut faults = Vec::new();
        let mut logged: Option<RuleMatch> = None;

        for phase in REQUEST_PHASES {
            for rule in self.rules.iter().filter(|r| r.phase == phase && r.enabled) {
                let matched = match self.check_rule(rule, ctx) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(rule_id = rule.id, error = %e, "rule evaluation fault");
                        faults.push(e.to_string());
                        false
                    }
                };

                if !matched {
                    continue;
                }

                match rule.action {
                    RuleAction::Block => {
                        debug!(rule_id = rule.id, phase = phase.as_str(), "rule blocked request");
                        return Evaluation::blocked(rule, faults);
                    }
                    RuleAction::Log => {
                        debug!(rule_id = rule.id, "log rule matched");
                        if logged.is_none() {
                            logged = Some(RuleMatch {
                                id: rule.id,
                                name: rule.name.clone(),
                                action: rule.action,
                                severity: rule.severity,
                            });
                        }
                    }
                    RuleAction::Pass => {}
                }
            }
        }

        Evaluation::allowed(logged, faults)
    }

    /// Check one rule against the request, extracting its target data.
    /// A matcher panic is contained and reported as a fault.
    fn check_rule(&self, rule: &Rule, ctx: &RequestContext) -> Result<bool, WafError> {
        match rule.target.as_str() {
            "REQUEST_URI" => self.match_guarded(rule, &ctx.uri),
            "REQUEST_BODY" => self.match_guarded(rule, &ctx.body_str()),
            "REQUEST_HEADERS" => {
                for value in ctx.headers.values() {
                    let value = String::from_utf8_lossy(value.as_bytes());
                    if self.match_guarded(rule, &value)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            "ARGS" => {
                for value in ctx.query_values() {
                    if self.match_guarded(rule, &value)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            target => {
                if let Some(name) = target.strip_prefix("REQUEST_HEADERS:") {
                    let value = ctx
                        .headers
                        .get(name)
                        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                        .unwrap_or_default();
                    self.match_guarded(rule, &value)
                } else {
                    Err(WafError::InvalidTarget {
                        id: rule.id,
                        target: target.to_string(),
                    })
                }
            }
        }
    }

    /// Run the matcher over non-empty data, containing panics.
    fn match_guarded(&self, rule: &Rule, data: &str) -> Result<bool, WafError> {
        if data.is_empty() {
            return Ok(false);
        }

        catch_unwind(AssertUnwindSafe(|| rule.matches(data)))
            .map_err(|_| WafError::MatcherFault { id: rule.id })
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Default rule set loaded at engine startup. Identifiers 1001-1008 are
/// stable and referenced by operators and the efficacy reports.
pub fn default_rule_specs() -> Vec<RuleSpec> {
    vec![
        RuleSpec {
            id: 1001,
            name: "SQL Injection".into(),
            description: "Detects common SQL injection patterns in query arguments".into(),
            phase: RulePhase::RequestUri,
            operator: "sqli".into(),
            pattern: String::new(),
            target: "ARGS".into(),
            action: RuleAction::Block,
            severity: Severity::Critical,
            enabled: true,
        },
        RuleSpec {
            id: 1002,
            name: "Cross-Site Scripting (XSS)".into(),
            description: "Detects common XSS patterns in query arguments".into(),
            phase: RulePhase::RequestUri,
            operator: "xss".into(),
            pattern: String::new(),
            target: "ARGS".into(),
            action: RuleAction::Block,
            severity: Severity::Critical,
            enabled: true,
        },
        RuleSpec {
            id: 1003,
            name: "Path Traversal".into(),
            description: "Detects path traversal attempts".into(),
            phase: RulePhase::RequestUri,
            operator: "regex".into(),
            pattern: r"\.\.[/\\]|\.\.%2[fF]".into(),
            target: "REQUEST_URI".into(),
            action: RuleAction::Block,
            severity: Severity::High,
            enabled: true,
        },
        RuleSpec {
            id: 1004,
            name: "Command Injection".into(),
            description: "Detects command injection patterns in the body".into(),
            phase: RulePhase::RequestBody,
            operator: "regex".into(),
            pattern: r"[;&|\n][\s]*(cat|ls|rm|wget|curl|bash|sh|cmd|powershell)".into(),
            target: "REQUEST_BODY".into(),
            action: RuleAction::Block,
            severity: Severity::Critical,
            enabled: true,
        },
        RuleSpec {
            id: 1005,
            name: "Suspicious User-Agent".into(),
            description: "Blocks requests from suspicious user agents".into(),
            phase: RulePhase::RequestHeaders,
            operator: "contains".into(),
            pattern: "BadBot".into(),
            target: "REQUEST_HEADERS:User-Agent".into(),
            action: RuleAction::Block,
            severity: Severity::Medium,
            enabled: true,
        },
        RuleSpec {
            id: 1006,
            name: "High Entropy Payload".into(),
            description: "Flags high entropy payloads (potential encoding/obfuscation)".into(),
            phase: RulePhase::RequestBody,
            operator: "high_entropy".into(),
            pattern: String::new(),
            target: "REQUEST_BODY".into(),
            action: RuleAction::Log,
            severity: Severity::Medium,
            enabled: true,
        },
        RuleSpec {
            id: 1007,
            name: "SQL Injection (Body)".into(),
            description: "Detects common SQL injection patterns in the body".into(),
            phase: RulePhase::RequestBody,
            operator: "sqli".into(),
            pattern: String::new(),
            target: "REQUEST_BODY".into(),
            action: RuleAction::Block,
            severity: Severity::Critical,
            enabled: true,
        },
        RuleSpec {
            id: 1008,
            name: "Cross-Site Scripting (Body)".into(),
            description: "Detects common XSS patterns in the body".into(),
            phase: RulePhase::RequestBody,
            operator: "xss".into(),
            pattern: String::new(),
            target: "REQUEST_BODY".into(),
            action: RuleAction::Block,
            severity: Severity::Critical,
            enabled: true,
        },
    ]
}
