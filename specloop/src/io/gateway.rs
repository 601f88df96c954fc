//! Verification gateway: runs one task's check and reports a [`VerificationOutcome`].
//!
//! A gateway never returns an error. Spawn failures, timeouts, policy denials
//! and cancellation are all folded into failed outcomes so the retry loop can
//! classify them like any other failure.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::VerificationOutcome;
use crate::graph::Task;
use crate::io::policy::{CommandDescriptor, SafetyCheck, Verdict};
use crate::io::process::run_command;

/// Placeholder substituted with the task id in command arguments.
pub const TASK_PLACEHOLDER: &str = "{task}";

/// Per-call parameters supplied by the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct VerifyRequest<'a> {
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

pub trait VerificationGateway {
    fn run(&self, task: &Task, request: &VerifyRequest<'_>) -> VerificationOutcome;
}

/// Runs an external command per task; exit status 0 means the task verified.
#[derive(Debug, Clone)]
pub struct CommandGateway<S> {
    command: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
    policy: S,
}

impl<S: SafetyCheck> CommandGateway<S> {
    pub fn new(
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        output_limit_bytes: usize,
        policy: S,
    ) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            output_limit_bytes,
            policy,
        }
    }

    /// The command that would run for `task`, with placeholders substituted.
    pub fn describe(&self, task: &Task) -> Option<CommandDescriptor> {
        let (program, args) = self.command.split_first()?;
        let args = args
            .iter()
            .map(|arg| arg.replace(TASK_PLACEHOLDER, &task.id))
            .collect();
        let mut descriptor = CommandDescriptor::new(program.replace(TASK_PLACEHOLDER, &task.id), args);
        descriptor.workdir = Some(self.workdir.clone());
        Some(descriptor)
    }
}

impl<S: SafetyCheck> VerificationGateway for CommandGateway<S> {
    #[instrument(skip_all, fields(task = %task.id))]
    fn run(&self, task: &Task, request: &VerifyRequest<'_>) -> VerificationOutcome {
        if request.cancel.is_cancelled() {
            return VerificationOutcome::cancelled();
        }
        let Some(descriptor) = self.describe(task) else {
            return VerificationOutcome::failed("verification command is empty");
        };
        if let Verdict::Deny(reason) = self.policy.check(&descriptor) {
            return VerificationOutcome::policy_denied(reason);
        }

        let mut cmd = Command::new(&descriptor.program);
        cmd.args(&descriptor.args).current_dir(&self.workdir);
        debug!(command = %descriptor, "running verification");

        let output = match run_command(
            cmd,
            None,
            request.timeout,
            self.output_limit_bytes,
            request.cancel,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(command = %descriptor, err = %format!("{err:#}"), "verification did not run");
                return VerificationOutcome::failed(format!(
                    "failed to run verification command '{descriptor}': {err:#}"
                ));
            }
        };

        let diagnostics = output.combined_text();
        if output.cancelled {
            return VerificationOutcome::cancelled();
        }
        if output.timed_out {
            return VerificationOutcome::timed_out(request.timeout.as_secs(), diagnostics);
        }
        if output.status.success() {
            VerificationOutcome::passed(diagnostics)
        } else {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            VerificationOutcome::failed(format!("{diagnostics}\n[exit status: {code}]"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureDetail;
    use crate::io::policy::{AllowAll, DenyListPolicy};
    use crate::test_support::task;

    fn gateway<S: SafetyCheck>(script: &str, policy: S) -> CommandGateway<S> {
        let temp = std::env::temp_dir();
        CommandGateway::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            temp,
            10_000,
            policy,
        )
    }

    fn run<S: SafetyCheck>(gateway: &CommandGateway<S>, timeout: Duration) -> VerificationOutcome {
        let cancel = CancelToken::new();
        gateway.run(
            &task("T1", &[]),
            &VerifyRequest {
                timeout,
                cancel: &cancel,
            },
        )
    }

    #[test]
    fn exit_zero_passes_and_task_id_is_substituted() {
        let outcome = run(&gateway("echo checking {task}", AllowAll), Duration::from_secs(10));
        assert!(outcome.success);
        assert!(outcome.diagnostics.contains("checking T1"));
    }

    #[test]
    fn non_zero_exit_fails_with_diagnostics() {
        let outcome = run(
            &gateway("echo 'SyntaxError: bad' 1>&2; exit 2", AllowAll),
            Duration::from_secs(10),
        );
        assert!(!outcome.success);
        assert!(outcome.diagnostics.contains("SyntaxError: bad"));
        assert!(outcome.diagnostics.contains("[exit status: 2]"));
        assert_eq!(outcome.detail, None);
    }

    #[test]
    fn timeout_is_a_failed_outcome() {
        let outcome = run(&gateway("sleep 5", AllowAll), Duration::from_millis(100));
        assert!(!outcome.success);
        assert!(matches!(
            outcome.detail,
            Some(FailureDetail::TimedOut { .. })
        ));
    }

    #[test]
    fn denied_command_never_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("ran");
        let policy = DenyListPolicy::new(&["forbidden".to_string()]).expect("policy");
        let script = format!("touch {} # forbidden", marker.display());
        let outcome = run(&gateway(&script, policy), Duration::from_secs(10));

        assert!(!outcome.success);
        assert!(matches!(
            outcome.detail,
            Some(FailureDetail::PolicyDenied { .. })
        ));
        assert!(!marker.exists());
    }

    #[test]
    fn spawn_failure_is_folded_into_outcome() {
        let gateway = CommandGateway::new(
            vec!["specloop-definitely-missing-binary".to_string()],
            std::env::temp_dir(),
            1000,
            AllowAll,
        );
        let outcome = run(&gateway, Duration::from_secs(5));
        assert!(!outcome.success);
        assert!(outcome.diagnostics.contains("failed to run verification command"));
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = gateway("exit 0", AllowAll).run(
            &task("T1", &[]),
            &VerifyRequest {
                timeout: Duration::from_secs(5),
                cancel: &cancel,
            },
        );
        assert!(outcome.is_cancelled());
    }
}
