//! Rule model and matcher primitives.
//!
//! A rule pairs a target selector with a compiled matcher. Compilation
//! happens exactly once when a rule is admitted; the hot path only ever
//! runs pre-compiled matchers.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::WafError;

/// Action taken when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Refuse the request.
    Block,
    /// Record the match without influencing the decision.
    Log,
    /// No-op; the rule is evaluated but its match is discarded.
    Pass,
}

impl RuleAction {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Block => "block",
            RuleAction::Log => "log",
            RuleAction::Pass => "pass",
        }
    }
}

/// Phase in which a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePhase {
    RequestHeaders,
    RequestUri,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
}

impl RulePhase {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RulePhase::RequestHeaders => "request_headers",
            RulePhase::RequestUri => "request_uri",
            RulePhase::RequestBody => "request_body",
            RulePhase::ResponseHeaders => "response_headers",
            RulePhase::ResponseBody => "response_body",
        }
    }
}

/// Severity label attached to a rule and echoed into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Get the numeric score for the severity (1-4)
    pub fn score(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// SQL injection token list. The list is closed: changing it changes
/// observable blocking behaviour, so additions go through a rule instead.
static SQLI_TOKENS: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "' OR '1'='1",
        "' OR 1=1",
        "'; DROP TABLE",
        "UNION SELECT",
        "' OR 'a'='a",
        "admin' --",
        "' /*",
        "*/ OR /*",
        "xp_",
        "sp_",
    ]
    .iter()
    .map(|t| t.to_uppercase())
    .collect()
});

/// XSS token list. Closed, same contract as the SQLi list.
static XSS_TOKENS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "<script",
        "javascript:",
        "onerror=",
        "onload=",
        "onclick=",
        "onmouseover=",
        "<iframe",
        "<object",
        "<embed",
        "<img",
        "<svg",
    ]
});

/// Matcher primitive, one compiled variant per operator.
#[derive(Debug, Clone)]
pub enum RuleOperator {
    /// Literal substring present (case-sensitive).
    Contains(String),
    /// Literal substring absent.
    NotContains(String),
    /// Literal prefix.
    StartsWith(String),
    /// Literal suffix.
    EndsWith(String),
    /// Full equality.
    Equals(String),
    /// Compiled expression matches.
    Regex(Regex),
    /// Compiled expression does not match.
    NotRegex(Regex),
    /// Shannon entropy strictly above 4.0 bits.
    HighEntropy,
    /// Case-insensitive containment of any SQLi token.
    Sqli,
    /// Case-insensitive containment of any XSS token.
    Xss,
}

impl RuleOperator {
    /// Operator name as used in rule specs and CLI flags.
    pub fn name(&self) -> &'static str {
        match self {
            RuleOperator::Contains(_) => "contains",
            RuleOperator::NotContains(_) => "notcontains",
            RuleOperator::StartsWith(_) => "startswith",
            RuleOperator::EndsWith(_) => "endswith",
            RuleOperator::Equals(_) => "equals",
            RuleOperator::Regex(_) => "regex",
            RuleOperator::NotRegex(_) => "notregex",
            RuleOperator::HighEntropy => "high_entropy",
            RuleOperator::Sqli => "sqli",
            RuleOperator::Xss => "xss",
        }
    }

    /// Textual pattern the operator was compiled from (empty for the
    /// built-in heuristics).
    pub fn pattern(&self) -> &str {
        match self {
            RuleOperator::Contains(p)
            | RuleOperator::NotContains(p)
            | RuleOperator::StartsWith(p)
            | RuleOperator::EndsWith(p)
            | RuleOperator::Equals(p) => p,
            RuleOperator::Regex(re) | RuleOperator::NotRegex(re) => re.as_str(),
            RuleOperator::HighEntropy | RuleOperator::Sqli | RuleOperator::Xss => "",
        }
    }
}

/// A single WAF rule with its compiled matcher.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Numeric identifier, unique within a rule set.
    pub id: u32,
    /// Display name, surfaced in block reasons and events.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Evaluation phase.
    pub phase: RulePhase,
    /// Compiled matcher.
    pub operator: RuleOperator,
    /// Target selector, e.g. `REQUEST_URI`, `REQUEST_HEADERS:<name>`, `ARGS`.
    pub target: String,
    /// Action on match.
    pub action: RuleAction,
    /// Severity label.
    pub severity: Severity,
    /// A disabled rule never matches.
    pub enabled: bool,
}

impl Rule {
    /// Check whether this rule matches the given data. A disabled rule
    /// never matches.
    pub fn matches(&self, data: &str) -> bool {
        if !self.enabled {
            return false;
        }

        match &self.operator {
            RuleOperator::Contains(p) => data.contains(p.as_str()),
            RuleOperator::NotContains(p) => !data.contains(p.as_str()),
            RuleOperator::StartsWith(p) => data.starts_with(p.as_str()),
            RuleOperator::EndsWith(p) => data.ends_with(p.as_str()),
            RuleOperator::Equals(p) => data == p,
            RuleOperator::Regex(re) => re.is_match(data),
            RuleOperator::NotRegex(re) => !re.is_match(data),
            RuleOperator::HighEntropy => shannon_entropy(data) > 4.0,
            RuleOperator::Sqli => detect_sqli(data),
            RuleOperator::Xss => detect_xss(data),
        }
    }
}

/// Uncompiled rule record, the serde-facing shape used by configuration
/// files and the `rules add` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phase: RulePhase,
    /// Operator name: contains, notcontains, startswith, endswith, equals,
    /// regex, notregex, high_entropy, sqli, xss.
    pub operator: String,
    #[serde(default)]
    pub pattern: String,
    pub target: String,
    pub action: RuleAction,
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    /// Compile the spec into an admitted [`Rule`]. Regex-family operators
    /// compile their pattern here; a bad pattern rejects the rule.
    pub fn compile(self) -> Result<Rule, WafError> {
        let operator = match self.operator.as_str() {
            "contains" => RuleOperator::Contains(self.pattern),
            "notcontains" => RuleOperator::NotContains(self.pattern),
            "startswith" => RuleOperator::StartsWith(self.pattern),
            "endswith" => RuleOperator::EndsWith(self.pattern),
            "equals" => RuleOperator::Equals(self.pattern),
            "regex" => RuleOperator::Regex(compile_pattern(self.id, &self.pattern)?),
            "notregex" => RuleOperator::NotRegex(compile_pattern(self.id, &self.pattern)?),
            "high_entropy" => RuleOperator::HighEntropy,
            "sqli" => RuleOperator::Sqli,
            "xss" => RuleOperator::Xss,
            other => return Err(WafError::UnknownOperator(other.to_string())),
        };

        Ok(Rule {
            id: self.id,
            name: self.name,
            description: self.description,
            phase: self.phase,
            operator,
            target: self.target,
            action: self.action,
            severity: self.severity,
            enabled: self.enabled,
        })
    }
}

fn compile_pattern(id: u32, pattern: &str) -> Result<Regex, WafError> {
    Regex::new(pattern).map_err(|source| WafError::BadPattern { id, source })
}

/// Shannon entropy in bits over raw code-unit frequencies: −Σ p·log₂ p
/// with p the frequency of each byte divided by total length. Empty input
/// yields 0.
pub fn shannon_entropy(data: &str) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for b in data.bytes() {
        freq[b as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter()
        .filter(|&&f| f > 0)
        .map(|&f| {
            let p = f64::from(f) / len;
            -p * p.log2()
        })
        .sum()
}

/// Case-insensitive containment of any token from the closed SQLi list.
fn detect_sqli(data: &str) -> bool {
    let upper = data.to_uppercase();
    SQLI_TOKENS.iter().any(|t| upper.contains(t.as_str()))
}

/// Case-insensitive containment of any token from the closed XSS list.
fn detect_xss(data: &str) -> bool {
    let lower = data.to_lowercase();
    XSS_TOKENS.iter().any(|t| lower.contains(t))
}
