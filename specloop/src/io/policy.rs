//! Safety pre-check applied to every command before it is spawned.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::warn;

/// Patterns refused by default. Matched against the rendered command line.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[a-zA-Z]*[rf][a-zA-Z]*\s+/(\s|$)",
    r"\bmkfs(\.\w+)?\b",
    r"\bdd\b.*\bof=/dev/",
    r":\(\)\s*\{\s*:\|:&\s*\};:",
    r"\b(shutdown|reboot|halt|poweroff)\b",
    r"\bgit\s+push\b.*(--force|-f\b)",
];

/// A command as it is about to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
}

impl CommandDescriptor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: None,
        }
    }

    /// Program and arguments joined by spaces.
    pub fn render(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

pub trait SafetyCheck {
    fn check(&self, command: &CommandDescriptor) -> Verdict;
}

/// Denies any command whose rendered form matches one of the patterns.
#[derive(Debug, Clone)]
pub struct DenyListPolicy {
    patterns: Vec<Regex>,
}

impl DenyListPolicy {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("compile deny pattern '{pattern}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl SafetyCheck for DenyListPolicy {
    fn check(&self, command: &CommandDescriptor) -> Verdict {
        let rendered = command.render();
        match self.patterns.iter().find(|pattern| pattern.is_match(&rendered)) {
            Some(pattern) => {
                warn!(command = %rendered, pattern = pattern.as_str(), "command denied");
                Verdict::Deny(format!("'{rendered}' matches deny pattern '{pattern}'"))
            }
            None => Verdict::Allow,
        }
    }
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SafetyCheck for AllowAll {
    fn check(&self, _command: &CommandDescriptor) -> Verdict {
        Verdict::Allow
    }
}
