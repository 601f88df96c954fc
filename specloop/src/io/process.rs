//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often a running child is checked for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.cancelled
    }

    /// Stdout and stderr rendered as one diagnostic block.
    pub fn combined_text(&self) -> String {
        let mut buf = String::new();
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        buf
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child is killed when `timeout` elapses or `cancel` fires.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = remaining.min(CANCEL_POLL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("command cancelled, killing");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        child.kill().context("kill command")?;
        break child.wait().context("wait command after kill")?;
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_status() {
        let output = run_command(
            sh("echo out; echo err 1>&2; exit 3"),
            None,
            Duration::from_secs(10),
            1000,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.success());
        let text = output.combined_text();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[test]
    fn feeds_stdin() {
        let output = run_command(
            sh("cat"),
            Some(b"hello"),
            Duration::from_secs(10),
            1000,
            &CancelToken::new(),
        )
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, b"hello");
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_command(
            sh("sleep 5"),
            None,
            Duration::from_millis(100),
            1000,
            &CancelToken::new(),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn kills_on_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let started = Instant::now();
        let output = run_command(sh("sleep 5"), None, Duration::from_secs(30), 1000, &cancel)
            .expect("run");
        assert!(output.cancelled);
        assert!(!output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn truncates_beyond_limit() {
        let output = run_command(
            sh("printf '0123456789'"),
            None,
            Duration::from_secs(10),
            4,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.combined_text().contains("[stdout truncated 6 bytes]"));
    }
}
