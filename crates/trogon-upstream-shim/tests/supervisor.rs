//! Supervisor and shutdown tests with real child processes.
//!
//! Run with:
//!   cargo test -p trogon-upstream-shim --test supervisor

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::net::TcpListener;
use trogon_upstream_shim::forwarder::ForwarderState;
use trogon_upstream_shim::logs::{self, LogReceiver, LogStream};
use trogon_upstream_shim::{RestartPolicy, UpstreamCommand, UpstreamSupervisor, serve};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn shell(script: &str) -> UpstreamCommand {
    UpstreamCommand::new("/bin/sh", std::env::temp_dir()).with_args(["-c", script])
}

async fn next_line(rx: &mut LogReceiver) -> logs::LogLine {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for upstream output")
        .expect("log channel closed")
}

/// True while `pid` is alive. Zombies count as gone: an orphaned grandchild
/// may never be reaped when the test runs as PID 1 in a container.
fn process_exists(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_none_or(|state| state != "Z"),
        Err(_) => true,
    }
}

/// Poll `check` every 20ms until it holds or `timeout` elapses.
async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stdout_and_stderr_reach_the_log_channel() {
    let (tx, mut rx) = logs::channel();
    let supervisor = UpstreamSupervisor::new(
        shell("echo 'Server is running on port 3000'; sleep 0.2; echo 'boom' 1>&2; sleep 30"),
        tx,
    )
    .with_stop_timeout(Duration::from_secs(2));

    supervisor.start().await.unwrap();

    let first = next_line(&mut rx).await;
    assert_eq!(first.stream, LogStream::Stdout);
    assert_eq!(first.text, "Server is running on port 3000");

    let second = next_line(&mut rx).await;
    assert_eq!(second.stream, LogStream::Stderr);
    assert_eq!(second.text, "boom");

    assert!(supervisor.stop().await);
}

#[tokio::test]
async fn unexpected_exit_is_restarted_until_budget_is_spent() {
    let (tx, _rx) = logs::channel();
    let supervisor = UpstreamSupervisor::new(shell("exit 3"), tx)
        .with_restart_policy(RestartPolicy::new(2, Duration::from_millis(10)));

    supervisor.start().await.unwrap();

    let settled = eventually(Duration::from_secs(5), || {
        let status = supervisor.status();
        status.restarts == 2 && !status.running
    })
    .await;
    assert!(settled, "status: {:?}", supervisor.status());

    let status = supervisor.status();
    assert!(status.last_exit.as_deref().is_some_and(|e| e.contains('3')));
    let upstream = supervisor.status_handle();
    assert!(eventually(Duration::from_secs(5), || !upstream.is_supervised()).await);
    assert!(!supervisor.stop().await);
    assert_eq!(supervisor.status().restarts, 2);
}

#[tokio::test]
async fn fail_stop_leaves_upstream_down_after_exit() {
    let (tx, _rx) = logs::channel();
    let supervisor = UpstreamSupervisor::new(shell("exit 0"), tx);

    supervisor.start().await.unwrap();

    let upstream = supervisor.status_handle();
    assert!(eventually(Duration::from_secs(5), || !upstream.is_supervised()).await);
    assert!(!supervisor.status().running);
    assert_eq!(supervisor.status().restarts, 0);

    // The handle is already released: nothing to stop, and a new start works.
    assert!(!supervisor.stop().await);
    supervisor.start().await.unwrap();
}

/// Stopping while a restart is only waiting out its backoff terminates
/// nothing, returns promptly and cancels the restart.
#[tokio::test]
async fn stop_during_restart_backoff_reports_nothing_terminated() {
    let (tx, _rx) = logs::channel();
    let supervisor = UpstreamSupervisor::new(shell("exit 1"), tx)
        .with_restart_policy(RestartPolicy::new(3, Duration::from_secs(30)));

    supervisor.start().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || !supervisor.status().running).await);
    assert!(supervisor.status_handle().is_supervised());

    let started = std::time::Instant::now();
    assert!(!supervisor.stop().await);
    assert!(started.elapsed() < Duration::from_secs(5));

    let status = supervisor.status();
    assert!(!status.running);
    assert_eq!(status.restarts, 0);
    assert!(!supervisor.status_handle().is_supervised());
}

/// `kill_now` takes the whole group down at once, even an upstream that
/// ignores SIGTERM.
#[tokio::test]
async fn kill_now_takes_down_the_process_group() {
    let (tx, mut rx) = logs::channel();
    let supervisor = UpstreamSupervisor::new(
        shell("trap '' TERM; echo ready; while true; do sleep 1; done"),
        tx,
    );
    let pid = supervisor.start().await.unwrap();
    assert_eq!(next_line(&mut rx).await.text, "ready");

    assert!(supervisor.kill_now());

    assert!(eventually(Duration::from_secs(5), || !process_exists(pid)).await);
    assert!(eventually(Duration::from_secs(5), || !supervisor.status().running).await);
}

/// An upstream that ignores SIGTERM is killed once the grace period passes,
/// and the stop call does not hang on it.
#[tokio::test]
async fn sigterm_ignoring_upstream_is_killed_after_grace_period() {
    let (tx, mut rx) = logs::channel();
    let supervisor = UpstreamSupervisor::new(
        shell("trap '' TERM; echo ready; while true; do sleep 1; done"),
        tx,
    )
    .with_stop_timeout(Duration::from_millis(300));

    let pid = supervisor.start().await.unwrap();
    assert_eq!(next_line(&mut rx).await.text, "ready");

    let started = std::time::Instant::now();
    assert!(supervisor.stop().await);
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(300), "stopped after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "stopped after {elapsed:?}");
    assert!(!process_exists(pid));
    assert!(!supervisor.status().running);
}

/// Stopping signals the whole process group, so grandchildren go too.
#[tokio::test]
async fn stop_reaches_the_whole_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let (tx, _rx) = logs::channel();
    let supervisor =
        UpstreamSupervisor::new(shell(&script), tx).with_stop_timeout(Duration::from_secs(2));
    supervisor.start().await.unwrap();

    assert!(
        eventually(Duration::from_secs(5), || {
            std::fs::read_to_string(&pid_file).is_ok_and(|s| s.trim().parse::<u32>().is_ok())
        })
        .await
    );
    let grandchild: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(process_exists(grandchild));

    assert!(supervisor.stop().await);

    assert!(eventually(Duration::from_secs(5), || !process_exists(grandchild)).await);
}

/// `serve` relays requests until its shutdown future resolves, then stops the
/// upstream and returns.
#[tokio::test]
async fn serve_stops_upstream_on_shutdown() {
    let mock_server = httpmock::MockServer::start_async().await;
    let _hello = mock_server
        .mock_async(|when, then| {
            when.path("/api/hello");
            then.status(200).body("hello");
        })
        .await;

    let (tx, _rx) = logs::channel();
    let supervisor = Arc::new(
        UpstreamSupervisor::new(shell("sleep 30"), tx).with_stop_timeout(Duration::from_secs(2)),
    );
    let pid = supervisor.start().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ForwarderState::new(mock_server.base_url(), Duration::from_secs(5)).unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve(
        listener,
        state,
        supervisor.clone(),
        Duration::from_secs(10),
        async move {
            let _ = shutdown_rx.await;
        },
    ));

    let body = reqwest::get(format!("http://{addr}/api/hello"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello");

    shutdown_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("serve did not return after shutdown")
        .unwrap();

    assert!(result.is_ok());
    assert!(!supervisor.status().running);
    assert!(!process_exists(pid));
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}
