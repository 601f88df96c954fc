//! Reasoners propose replacement text for one anchored section.
//!
//! The [`Reasoner`] trait decouples the correction synthesizer from whatever
//! produces the new text. [`GuidanceReasoner`] is deterministic and needs no
//! external process; [`CommandReasoner`] pipes a rendered prompt to an
//! external command and reads a JSON proposal back.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::ErrorAnalysis;
use crate::io::config::ReasonerConfig;
use crate::io::process::run_command;

/// Everything a reasoner may use to propose a correction.
#[derive(Debug, Clone)]
pub struct ProposalRequest<'a> {
    pub task_id: &'a str,
    pub anchor: &'a str,
    pub current_body: &'a str,
    pub analysis: &'a ErrorAnalysis,
    pub attempt: u32,
    /// Rendered correction prompt for external reasoners.
    pub prompt: &'a str,
}

/// Proposed replacement body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Proposal {
    pub replacement: String,
    #[serde(default)]
    pub notes: Option<String>,
}

pub trait Reasoner {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal>;
}

/// Appends a correction note describing the observed failure to the section.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuidanceReasoner;

impl Reasoner for GuidanceReasoner {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal> {
        let root_cause = request.analysis.root_cause.replace(['\r', '\n'], " ");
        let note = format!(
            "> **Correction (attempt {}, {})**: {}",
            request.attempt,
            request.analysis.kind,
            root_cause.trim()
        );
        let body = request.current_body.trim_end();
        let replacement = if body.is_empty() {
            format!("{note}\n\n")
        } else {
            format!("{body}\n\n{note}\n\n")
        };
        Ok(Proposal {
            replacement,
            notes: None,
        })
    }
}

/// Runs an external command with the prompt on stdin; stdout must carry a JSON [`Proposal`].
#[derive(Debug, Clone)]
pub struct CommandReasoner {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: CancelToken,
}

impl CommandReasoner {
    pub fn new(
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
            output_limit_bytes,
            cancel,
        }
    }
}

impl Reasoner for CommandReasoner {
    #[instrument(skip_all, fields(task = request.task_id, anchor = request.anchor))]
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("reasoner command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        info!(program = %program, "requesting correction proposal");

        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            &self.cancel,
        )
        .context("run reasoner command")?;

        if output.cancelled {
            return Err(anyhow!("reasoner cancelled"));
        }
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "reasoner timed out");
            return Err(anyhow!("reasoner timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "reasoner failed");
            return Err(anyhow!(
                "reasoner failed with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let proposal = parse_proposal(&String::from_utf8_lossy(&output.stdout))?;
        debug!(len = proposal.replacement.len(), "proposal received");
        Ok(proposal)
    }
}

/// Reasoner selected by `[reasoner]` in the config.
#[derive(Debug, Clone)]
pub enum ConfiguredReasoner {
    Guidance(GuidanceReasoner),
    Command(CommandReasoner),
}

impl ConfiguredReasoner {
    /// An empty `reasoner.command` selects the built-in guidance reasoner.
    pub fn from_config(
        config: &ReasonerConfig,
        workdir: impl Into<PathBuf>,
        output_limit_bytes: usize,
        cancel: CancelToken,
    ) -> Self {
        if config.command.is_empty() {
            return Self::Guidance(GuidanceReasoner);
        }
        Self::Command(CommandReasoner::new(
            config.command.clone(),
            workdir,
            Duration::from_secs(config.timeout_secs),
            output_limit_bytes,
            cancel,
        ))
    }
}

impl Reasoner for ConfiguredReasoner {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal> {
        match self {
            Self::Guidance(reasoner) => reasoner.propose(request),
            Self::Command(reasoner) => reasoner.propose(request),
        }
    }
}

/// Parse the whole output as JSON, falling back to its last non-empty line.
fn parse_proposal(stdout: &str) -> Result<Proposal> {
    let trimmed = stdout.trim();
    if let Ok(proposal) = serde_json::from_str::<Proposal>(trimmed) {
        return Ok(proposal);
    }
    let last = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("reasoner produced no output"))?;
    serde_json::from_str(last).context("parse reasoner proposal json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ErrorKind;

    fn analysis() -> ErrorAnalysis {
        ErrorAnalysis {
            kind: ErrorKind::AssertionFailure,
            root_cause: "expected 200\nactual 500".to_string(),
            confidence: 0.7,
            implicated: None,
        }
    }

    fn request<'a>(analysis: &'a ErrorAnalysis, body: &'a str) -> ProposalRequest<'a> {
        ProposalRequest {
            task_id: "T1",
            anchor: "R2",
            current_body: body,
            analysis,
            attempt: 2,
            prompt: "prompt text",
        }
    }

    #[test]
    fn guidance_appends_a_note_to_the_body() {
        let analysis = analysis();
        let proposal = GuidanceReasoner
            .propose(&request(&analysis, "Users log in.\n\n"))
            .expect("propose");
        assert_eq!(
            proposal.replacement,
            "Users log in.\n\n> **Correction (attempt 2, assertion_failure)**: expected 200 actual 500\n\n"
        );
    }

    #[test]
    fn guidance_on_empty_body_is_just_the_note() {
        let analysis = analysis();
        let proposal = GuidanceReasoner
            .propose(&request(&analysis, ""))
            .expect("propose");
        assert!(proposal.replacement.starts_with("> **Correction"));
    }

    #[test]
    fn command_reasoner_reads_json_from_stdout() {
        let reasoner = CommandReasoner::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; echo 'thinking...'; printf '%s\n' '{"replacement": "new body\n", "notes": "n"}'"#
                    .to_string(),
            ],
            std::env::temp_dir(),
            Duration::from_secs(10),
            10_000,
            CancelToken::new(),
        );
        let analysis = analysis();
        let proposal = reasoner.propose(&request(&analysis, "old")).expect("propose");
        assert_eq!(proposal.replacement, "new body\n");
        assert_eq!(proposal.notes.as_deref(), Some("n"));
    }

    #[test]
    fn command_reasoner_failure_is_an_error() {
        let reasoner = CommandReasoner::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
            std::env::temp_dir(),
            Duration::from_secs(10),
            10_000,
            CancelToken::new(),
        );
        let analysis = analysis();
        assert!(reasoner.propose(&request(&analysis, "old")).is_err());
    }

    #[test]
    fn empty_command_selects_guidance() {
        let config = ReasonerConfig::default();
        let reasoner =
            ConfiguredReasoner::from_config(&config, std::env::temp_dir(), 100, CancelToken::new());
        assert!(matches!(reasoner, ConfiguredReasoner::Guidance(_)));

        let config = ReasonerConfig {
            command: vec!["my-reasoner".to_string()],
            ..ReasonerConfig::default()
        };
        let reasoner =
            ConfiguredReasoner::from_config(&config, std::env::temp_dir(), 100, CancelToken::new());
        assert!(matches!(reasoner, ConfiguredReasoner::Command(_)));
    }

    #[test]
    fn unparseable_output_is_an_error() {
        assert!(parse_proposal("not json").is_err());
        assert!(parse_proposal("").is_err());
    }
}
