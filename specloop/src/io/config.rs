//! Orchestrator configuration stored under `.specloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::fsutil::write_atomic;

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpecloopConfig {
    /// Attempt cap per task before it is marked `halted`.
    pub max_attempts: u32,

    /// Stop the whole run when a task exhausts its attempts. When false, tasks
    /// that do not depend on the halted one keep running.
    pub halt_on_exhaustion: bool,

    /// Wall-clock budget for a single verification call.
    pub verify_timeout_secs: u64,

    /// Truncate captured diagnostics beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Analyses below this confidence are flagged in the logs.
    pub min_confidence: f64,

    pub verify: VerifyConfig,
    pub reasoner: ReasonerConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Verification command; `{task}` is replaced with the task id.
    pub command: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "test".to_string(), "{task}".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasonerConfig {
    /// External reasoning command. Empty selects the built-in guidance reasoner.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Regexes matched against the rendered verification command.
    pub deny_patterns: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            deny_patterns: crate::io::policy::DEFAULT_DENY_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
        }
    }
}

impl Default for SpecloopConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            halt_on_exhaustion: true,
            verify_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
            min_confidence: 0.0,
            verify: VerifyConfig::default(),
            reasoner: ReasonerConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl SpecloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.verify_timeout_secs == 0 {
            return Err(anyhow!("verify_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(anyhow!("min_confidence must be within [0, 1]"));
        }
        if self.verify.command.is_empty() || self.verify.command[0].trim().is_empty() {
            return Err(anyhow!("verify.command must be a non-empty array"));
        }
        if !self.reasoner.command.is_empty() && self.reasoner.command[0].trim().is_empty() {
            return Err(anyhow!("reasoner.command must name a program"));
        }
        if self.reasoner.timeout_secs == 0 {
            return Err(anyhow!("reasoner.timeout_secs must be > 0"));
        }
        for pattern in &self.policy.deny_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("policy.deny_patterns entry '{pattern}'"))?;
        }
        Ok(())
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SpecloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<SpecloopConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = SpecloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SpecloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SpecloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
