//! Cooperative cancellation shared between the orchestrator and running checks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tracing::warn;

/// Cloneable flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM (Ctrl+C elsewhere).
///
/// Handlers are registered before this returns and a background thread waits
/// for the signal. Once registered, the signal no longer kills the process;
/// the run winds down through the token instead.
pub fn cancel_on_signal(token: &CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let listener = {
        let _context = runtime.enter();
        SignalListener::register().context("register signal handlers")?
    };

    let token = token.clone();
    thread::Builder::new()
        .name("specloop-signals".to_string())
        .spawn(move || {
            if runtime.block_on(listener.wait()) {
                token.cancel();
            }
        })
        .context("spawn signal listener")?;
    Ok(())
}

#[cfg(unix)]
struct SignalListener {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn wait(mut self) -> bool {
        tokio::select! {
            _ = self.sigint.recv() => warn!("SIGINT received, cancelling run"),
            _ = self.sigterm.recv() => warn!("SIGTERM received, cancelling run"),
        }
        true
    }
}

#[cfg(not(unix))]
struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn wait(self) -> bool {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl+C received, cancelling run");
                true
            }
            Err(err) => {
                warn!(err = %err, "Ctrl+C listener failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
