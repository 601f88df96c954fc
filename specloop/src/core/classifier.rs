//! Deterministic classification of verification failures.
//!
//! Rules are data: an ordered list of [`Matcher`]s scanned against the
//! diagnostic text, first match wins. Classification never fails; anything
//! unrecognised becomes [`ErrorKind::Unknown`] with confidence `0`.

use regex::Regex;

use crate::core::anchors::mentions;
use crate::core::types::{
    AttemptRecord, ErrorAnalysis, ErrorKind, FailureDetail, VerificationOutcome,
};

const MAX_ROOT_CAUSE_CHARS: usize = 240;
const PROPERTY_CONFIDENCE: f64 = 0.9;
const NO_DIAGNOSTICS: &str = "verification failed without diagnostics";

/// One classification rule.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub kind: ErrorKind,
    pub pattern: Regex,
    pub confidence: f64,
}

impl Matcher {
    pub fn new(kind: ErrorKind, pattern: &str, confidence: f64) -> Result<Self, regex::Error> {
        Ok(Self {
            kind,
            pattern: Regex::new(pattern)?,
            confidence: clamp_confidence(confidence),
        })
    }
}

/// Built-in rules, most specific first.
const BUILTIN_RULES: &[(ErrorKind, &str, f64)] = &[
    (
        ErrorKind::Timeout,
        r"(?i)\b(timed out|timeout|deadline exceeded)\b",
        0.9,
    ),
    (
        ErrorKind::ResourceExhaustion,
        r"(?i)(out of memory|\boom\b|memory allocation of|no space left on device|too many open files|resource exhausted|stack overflow)",
        0.85,
    ),
    (
        ErrorKind::DependencyMissing,
        r"(?i)(command not found|no such file or directory|module ?not ?found|cannot find (module|package|crate)|unresolved import|could not find .+ in registry|importerror|is not installed)",
        0.8,
    ),
    (
        ErrorKind::SyntaxError,
        r"(?i)(syntax ?error|parse error|unexpected token|expected one of|unterminated|unexpected end of (file|input))",
        0.85,
    ),
    (
        ErrorKind::TypeFailure,
        r"(?i)(type ?error|mismatched types|type mismatch|is not assignable to type|cannot be applied to type|\bE0308\b)",
        0.8,
    ),
    (
        ErrorKind::AssertionFailure,
        r"(?i)(assertion( `?left == right`?)? failed|assertionerror|panicked at|expected .+ (but )?(got|found|was)|test result: failed|\bfailed\b)",
        0.7,
    ),
];

/// Pattern-based error analyzer.
#[derive(Debug, Clone)]
pub struct ErrorAnalyzer {
    rules: Vec<Matcher>,
}

impl Default for ErrorAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorAnalyzer {
    /// Analyzer with the built-in rule set.
    pub fn new() -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .map(|(kind, pattern, confidence)| {
                Matcher::new(*kind, pattern, *confidence).expect("built-in pattern should be valid")
            })
            .collect();
        Self { rules }
    }

    /// Analyzer with a caller-provided ordered rule set.
    pub fn with_rules(rules: Vec<Matcher>) -> Self {
        Self { rules }
    }

    /// Append a rule after the existing ones.
    pub fn push_rule(&mut self, rule: Matcher) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[Matcher] {
        &self.rules
    }

    /// Classify a failed outcome. `history` is the task's prior attempts; a
    /// failure identical to an earlier one halves the confidence.
    pub fn analyze(&self, outcome: &VerificationOutcome, history: &[AttemptRecord]) -> ErrorAnalysis {
        let mut analysis = self.classify(outcome);
        let recurring = history
            .iter()
            .filter_map(|record| record.analysis.as_ref())
            .any(|prior| prior.kind == analysis.kind && prior.root_cause == analysis.root_cause);
        if recurring {
            analysis.confidence /= 2.0;
        }
        analysis.confidence = clamp_confidence(analysis.confidence);
        analysis
    }

    /// Like [`analyze`](Self::analyze), but when no property was named the
    /// failure is attributed to the first of `references` the diagnostics mention.
    pub fn analyze_with_references(
        &self,
        outcome: &VerificationOutcome,
        history: &[AttemptRecord],
        references: &[String],
    ) -> ErrorAnalysis {
        let mut analysis = self.analyze(outcome, history);
        if analysis.implicated.is_none() {
            analysis.implicated = references
                .iter()
                .find(|reference| mentions(&outcome.diagnostics, reference))
                .cloned();
        }
        analysis
    }

    fn classify(&self, outcome: &VerificationOutcome) -> ErrorAnalysis {
        match &outcome.detail {
            Some(FailureDetail::TimedOut { after_secs }) => ErrorAnalysis {
                kind: ErrorKind::Timeout,
                root_cause: format!("verification timed out after {after_secs}s"),
                confidence: 1.0,
                implicated: None,
            },
            Some(FailureDetail::PolicyDenied { reason }) => ErrorAnalysis {
                kind: ErrorKind::PolicyBlocked,
                root_cause: truncate(&format!("blocked by safety policy: {reason}")),
                confidence: 1.0,
                implicated: None,
            },
            Some(FailureDetail::Property {
                property_id,
                expected,
                actual,
            }) => {
                let root_cause = truncate(&property_root_cause(
                    property_id,
                    expected.as_deref(),
                    actual.as_deref(),
                ));
                let (kind, confidence) = match self.first_match(&outcome.diagnostics) {
                    Some((rule, _)) if rule.kind != ErrorKind::AssertionFailure => {
                        (rule.kind, rule.confidence + 0.1)
                    }
                    _ => (ErrorKind::AssertionFailure, PROPERTY_CONFIDENCE),
                };
                ErrorAnalysis {
                    kind,
                    root_cause,
                    confidence,
                    implicated: Some(property_id.clone()),
                }
            }
            Some(FailureDetail::Cancelled) | None => match self.first_match(&outcome.diagnostics) {
                Some((rule, line)) => ErrorAnalysis {
                    kind: rule.kind,
                    root_cause: truncate(line.trim()),
                    confidence: rule.confidence,
                    implicated: None,
                },
                None => ErrorAnalysis {
                    kind: ErrorKind::Unknown,
                    root_cause: first_distinguishing_line(&outcome.diagnostics),
                    confidence: 0.0,
                    implicated: None,
                },
            },
        }
    }

    /// Rule priority first, then line order.
    fn first_match<'t>(&self, diagnostics: &'t str) -> Option<(&Matcher, &'t str)> {
        self.rules.iter().find_map(|rule| {
            diagnostics
                .lines()
                .find(|line| rule.pattern.is_match(line))
                .map(|line| (rule, line))
        })
    }
}

fn property_root_cause(property_id: &str, expected: Option<&str>, actual: Option<&str>) -> String {
    match (expected, actual) {
        (Some(expected), Some(actual)) => {
            format!("property {property_id} failed: expected {expected}, actual {actual}")
        }
        (Some(expected), None) => format!("property {property_id} failed: expected {expected}"),
        (None, Some(actual)) => format!("property {property_id} failed: actual {actual}"),
        (None, None) => format!("property {property_id} failed"),
    }
}

fn first_distinguishing_line(diagnostics: &str) -> String {
    diagnostics
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(truncate)
        .unwrap_or_else(|| NO_DIAGNOSTICS.to_string())
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ROOT_CAUSE_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_ROOT_CAUSE_CHARS).collect();
    out.push_str("...");
    out
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
