//! Termination signal handling.
//!
//! [`Signals::install`] registers the handlers synchronously, so a signal that
//! arrives at any point afterwards is queued for [`Signals::recv`] instead of
//! taking the default action and killing the shim with the upstream still
//! running.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Exit code used when a second signal cuts the graceful shutdown short
/// (128 + SIGINT, as a shell would report it).
pub const FORCED_EXIT_CODE: i32 = 130;

/// Which termination signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Armed SIGINT/SIGTERM listeners (Ctrl+C only on non-Unix).
pub struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    /// Must be called inside the tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        let signals = {
            use tokio::signal::unix::{SignalKind, signal};
            Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            }
        };

        #[cfg(not(unix))]
        let signals = Self {};

        Ok(signals)
    }

    /// Wait for the next signal. Signals received since the previous call, or
    /// since `install`, resolve immediately.
    pub async fn recv(&mut self) -> ShutdownSignal {
        #[cfg(unix)]
        let received = tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        };

        #[cfg(not(unix))]
        let received = {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
            ShutdownSignal::Interrupt
        };

        received
    }
}

/// Resolves once the coordinator has seen the first signal (or is gone).
pub async fn shutdown_requested(mut requested: watch::Receiver<bool>) {
    let _ = requested.wait_for(|requested| *requested).await;
}

/// Run the signal side of shutdown for the lifetime of the process.
///
/// The first signal flips `requested` to `true`. A second one calls `force`,
/// which must not block, and exits immediately with [`FORCED_EXIT_CODE`].
/// Abort the returned task once shutdown completes normally.
pub fn coordinate<F>(mut signals: Signals, requested: watch::Sender<bool>, force: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let first = signals.recv().await;
        info!(signal = %first, "Shutdown requested");
        let _ = requested.send(true);

        let second = signals.recv().await;
        warn!(signal = %second, "Second signal received, exiting without waiting");
        force();
        std::process::exit(FORCED_EXIT_CODE);
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::getpid;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_which_signal_arrived() {
        let mut signals = Signals::install().unwrap();

        kill(getpid(), Signal::SIGTERM).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();

        assert_eq!(received, ShutdownSignal::Terminate);
        assert_eq!(received.to_string(), "SIGTERM");
    }

    #[tokio::test]
    async fn shutdown_requested_waits_for_true() {
        let (tx, rx) = watch::channel(false);
        let waiter = tokio::spawn(shutdown_requested(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
