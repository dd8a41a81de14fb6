//! WAF (Web Application Firewall) module for Palisade.
//!
//! Provides the rule model and the phase-ordered evaluation engine used by
//! the proxy to decide whether a request is forwarded or refused:
//! - Typed rules with compiled matchers (substring, regex, SQLi, XSS, entropy)
//! - Target selectors over URI, headers, query arguments and body
//! - Phase-ordered evaluation producing an allow/block decision

pub mod engine;
pub mod rule;

pub use engine::{Evaluation, RequestContext, RuleEngine, RuleMatch};
pub use rule::{Rule, RuleAction, RuleOperator, RulePhase, RuleSpec, Severity, shannon_entropy};

use thiserror::Error;

/// The engine's verdict for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request to the origin.
    Allow,
    /// Refuse the request.
    Block,
    /// Record the request without influencing forwarding.
    Log,
}

impl Decision {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Block => "block",
            Decision::Log => "log",
        }
    }
}

/// Errors raised while admitting or evaluating rules.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WafError {
    /// Rule pattern failed to compile; the rule is rejected at admission.
    #[error("invalid pattern for rule {id}: {source}")]
    BadPattern {
        /// Identifier of the rejected rule
        id: u32,
        /// Underlying regex error
        #[source]
        source: regex::Error,
    },

    /// Rule references a target selector the engine does not know.
    #[error("rule {id} references unknown target '{target}'")]
    InvalidTarget {
        /// Identifier of the skipped rule
        id: u32,
        /// The unrecognised selector
        target: String,
    },

    /// A matcher panicked; the rule is treated as non-matching.
    #[error("matcher for rule {id} panicked during evaluation")]
    MatcherFault {
        /// Identifier of the faulting rule
        id: u32,
    },

    /// Rule operator name is not part of the model.
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
}
