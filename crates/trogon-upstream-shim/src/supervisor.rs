//! Ownership and lifecycle of the single upstream process.
//!
//! [`UpstreamSupervisor`] is the only owner of the process handle. A monitor
//! task holds the [`Child`] itself: it waits for either a stop request or the
//! child exiting on its own, and applies the [`RestartPolicy`] in the latter
//! case. The forwarder never sees any of this; it only knows the upstream port.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::UpstreamCommand;
use crate::error::ShimError;
use crate::logs::{self, LogSender};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);
/// How long to wait for the child to be reaped after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do when the upstream exits without being asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    max_restarts: u32,
    initial_backoff: Duration,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_restarts,
            initial_backoff,
        }
    }

    /// Never restart; an unexpected exit leaves the upstream down.
    pub fn fail_stop() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    /// Delay before restart number `attempt` (1-based): doubles each time,
    /// capped at 30s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(MAX_RESTART_BACKOFF)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::fail_stop()
    }
}

/// Point-in-time view of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub last_exit: Option<String>,
}

#[derive(Debug, Default)]
struct StatusCell {
    running: AtomicBool,
    /// A monitor task owns a child or is waiting to restart one.
    supervised: AtomicBool,
    pid: AtomicU32,
    restarts: AtomicU32,
    last_exit: std::sync::Mutex<Option<String>>,
}

impl StatusCell {
    fn mark_started(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    fn mark_exited(&self, description: String) {
        self.running.store(false, Ordering::SeqCst);
        self.pid.store(0, Ordering::SeqCst);
        *self
            .last_exit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(description);
    }

    fn snapshot(&self) -> UpstreamStatus {
        let pid = self.pid.load(Ordering::SeqCst);
        UpstreamStatus {
            running: self.running.load(Ordering::SeqCst),
            pid: (pid != 0).then_some(pid),
            restarts: self.restarts.load(Ordering::SeqCst),
            last_exit: self
                .last_exit
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}

/// Read-only handle on the supervisor's status, cheap to clone into other
/// tasks such as the status endpoint.
#[derive(Debug, Clone)]
pub struct StatusHandle(Arc<StatusCell>);

impl StatusHandle {
    pub fn snapshot(&self) -> UpstreamStatus {
        self.0.snapshot()
    }

    /// `false` once the upstream has exited and will not be restarted.
    pub fn is_supervised(&self) -> bool {
        self.0.supervised.load(Ordering::SeqCst)
    }
}

type SharedHandle = Arc<Mutex<Option<RunningUpstream>>>;

struct RunningUpstream {
    generation: u64,
    pid: u32,
    stop_tx: oneshot::Sender<()>,
    monitor: JoinHandle<bool>,
}

#[derive(Clone)]
struct MonitorContext {
    generation: u64,
    handle: SharedHandle,
    command: UpstreamCommand,
    logs: LogSender,
    status: Arc<StatusCell>,
    restart: RestartPolicy,
    stop_timeout: Duration,
}

/// Owns at most one upstream process at a time.
pub struct UpstreamSupervisor {
    command: UpstreamCommand,
    logs: LogSender,
    stop_timeout: Duration,
    restart: RestartPolicy,
    handle: SharedHandle,
    generations: AtomicU64,
    status: Arc<StatusCell>,
}

impl UpstreamSupervisor {
    pub fn new(command: UpstreamCommand, logs: LogSender) -> Self {
        Self {
            command,
            logs,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            restart: RestartPolicy::fail_stop(),
            handle: Arc::new(Mutex::new(None)),
            generations: AtomicU64::new(0),
            status: Arc::new(StatusCell::default()),
        }
    }

    /// Grace period between SIGTERM and SIGKILL when stopping.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn status(&self) -> UpstreamStatus {
        self.status.snapshot()
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle(self.status.clone())
    }

    /// Spawn the upstream and start draining its output. Returns its pid.
    ///
    /// Fails with [`ShimError::AlreadyRunning`] while a previous process is
    /// still supervised, and with [`ShimError::Spawn`] when the executable
    /// cannot be started.
    pub async fn start(&self) -> Result<u32, ShimError> {
        let mut guard = self.handle.lock().await;
        if let Some(running) = guard.as_ref()
            && !running.monitor.is_finished()
        {
            return Err(ShimError::AlreadyRunning { pid: running.pid });
        }

        let child = spawn_child(&self.command, &self.logs)?;
        let pid = child.id().unwrap_or_default();
        self.status.mark_started(pid);
        self.status.supervised.store(true, Ordering::SeqCst);
        info!(pid, command = %self.command, dir = %self.command.working_dir().display(), "Upstream started");

        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let ctx = MonitorContext {
            generation,
            handle: self.handle.clone(),
            command: self.command.clone(),
            logs: self.logs.clone(),
            status: self.status.clone(),
            restart: self.restart,
            stop_timeout: self.stop_timeout,
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, ctx, stop_rx));

        *guard = Some(RunningUpstream {
            generation,
            pid,
            stop_tx,
            monitor,
        });
        Ok(pid)
    }

    /// Terminate the upstream and clear the handle.
    ///
    /// Sends SIGTERM to the upstream's process group, waits for the stop
    /// timeout, then escalates to SIGKILL. Returns `true` only if a live
    /// process was terminated. Calling it again, after the upstream already
    /// exited, or while a restart is still backing off, returns `false`.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.handle.lock().await.take() else {
            debug!("No upstream to stop");
            return false;
        };

        let _ = running.stop_tx.send(());
        let terminated = match running.monitor.await {
            Ok(terminated) => terminated,
            Err(e) => {
                error!(error = %e, "Upstream monitor task failed");
                false
            }
        };
        if !terminated {
            debug!(pid = running.pid, "Upstream was not running");
        }
        terminated
    }

    /// SIGKILL the upstream's process group right away, without waiting or
    /// reaping. For forced exits where `stop()` will never get to run.
    pub fn kill_now(&self) -> bool {
        let pid = self.status.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return false;
        }

        kill_group(pid)
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => {
            warn!(pid, "Upstream process group killed");
            true
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to kill upstream process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

fn spawn_child(command: &UpstreamCommand, logs: &LogSender) -> Result<Child, ShimError> {
    let mut cmd = Command::new(command.program());
    cmd.args(command.args())
        .current_dir(command.working_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // If the shim dies without running stop(), the child goes with it.
        .kill_on_drop(true);
    // Own process group so signals reach the whole tree (npm → node).
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ShimError::Spawn {
        program: command.program().to_string(),
        source,
    })?;

    if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
        let tx = logs.clone();
        let pid = child.id();
        tokio::spawn(async move {
            let lines = logs::drain(stdout, stderr, tx).await;
            debug!(pid, lines, "Upstream output closed");
        });
    }

    Ok(child)
}

/// Returns `true` if it terminated a live child on request.
async fn monitor(mut child: Child, ctx: MonitorContext, mut stop_rx: oneshot::Receiver<()>) -> bool {
    let mut restarts = 0u32;

    let terminated = loop {
        let pid = child.id();
        tokio::select! {
            // A dropped sender means the supervisor is gone; stop as well.
            _ = &mut stop_rx => {
                terminate(&mut child, ctx.stop_timeout).await;
                ctx.status.mark_exited("stopped".to_string());
                break true;
            }
            exit = child.wait() => {
                let description = describe_exit(&exit);
                warn!(pid, exit = %description, "Upstream exited unexpectedly");
                ctx.status.mark_exited(description);

                match respawn(&ctx, &mut stop_rx, &mut restarts).await {
                    Some(next) => child = next,
                    None => break false,
                }
            }
        }
    };

    ctx.status.supervised.store(false, Ordering::SeqCst);
    if !terminated {
        // Nobody asked for this exit, so the handle is still registered.
        let mut guard = ctx.handle.lock().await;
        if guard
            .as_ref()
            .is_some_and(|running| running.generation == ctx.generation)
        {
            *guard = None;
        }
    }
    terminated
}

async fn respawn(
    ctx: &MonitorContext,
    stop_rx: &mut oneshot::Receiver<()>,
    restarts: &mut u32,
) -> Option<Child> {
    while *restarts < ctx.restart.max_restarts() {
        *restarts += 1;
        let delay = ctx.restart.backoff(*restarts);
        info!(
            attempt = *restarts,
            max_restarts = ctx.restart.max_restarts(),
            delay_ms = delay.as_millis() as u64,
            "Restarting upstream"
        );

        tokio::select! {
            _ = &mut *stop_rx => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match spawn_child(&ctx.command, &ctx.logs) {
            Ok(child) => {
                let pid = child.id().unwrap_or_default();
                ctx.status.mark_started(pid);
                ctx.status.restarts.fetch_add(1, Ordering::SeqCst);
                info!(pid, attempt = *restarts, "Upstream restarted");
                return Some(child);
            }
            Err(e) => error!(error = %e, attempt = *restarts, "Upstream restart failed"),
        }
    }

    if ctx.restart.max_restarts() > 0 {
        error!(
            max_restarts = ctx.restart.max_restarts(),
            "Upstream restart budget exhausted; requests will fail with 502"
        );
    } else {
        error!("Upstream is down and will not be restarted; requests will fail with 502");
    }
    None
}

/// SIGTERM the process group, wait `grace`, then SIGKILL.
///
/// On non-Unix platforms there is no SIGTERM, so this goes straight to kill.
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            warn!(pid, error = %e, "Failed to send SIGTERM to upstream");
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, %status, "Upstream exited after SIGTERM");
                return;
            }
            Ok(Err(e)) => warn!(pid, error = %e, "Error waiting for upstream"),
            Err(_) => warn!(
                pid,
                grace_ms = grace.as_millis() as u64,
                "Upstream ignored SIGTERM, escalating to SIGKILL"
            ),
        }
        let _ = killpg(group, Signal::SIGKILL);
    }

    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.start_kill();
    match tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => info!(pid, %status, "Upstream killed"),
        Ok(Err(e)) => error!(pid, error = %e, "Error waiting for killed upstream"),
        Err(_) => error!(pid, "Upstream still alive 5s after SIGKILL"),
    }
}

fn describe_exit(exit: &std::io::Result<ExitStatus>) -> String {
    match exit {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}
