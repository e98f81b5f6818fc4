//! # trogon-upstream-shim
//!
//! Supervises a single upstream HTTP server process and transparently proxies
//! every inbound request to it.
//!
//! ## How it works
//!
//! ```text
//! client → http://0.0.0.0:8001/api/batches?owner=42
//!               ↓
//!          [Forwarder (axum fallback)]
//!               ↓ same method, path, query, headers, body
//!          http://127.0.0.1:3000/api/batches?owner=42
//!               ↓
//!          [Upstream process (npm run dev), owned by UpstreamSupervisor]
//!               ↓ stdout/stderr lines → log channel → tracing (target "upstream")
//! ```
//!
//! 1. [`UpstreamSupervisor::start`] spawns the upstream command in its own
//!    process group and drains its output into the log channel.
//! 2. [`readiness::wait_until_ready`] polls the upstream port with backoff
//!    until it accepts connections or the ready timeout expires.
//! 3. The forwarder relays requests and responses byte-for-byte. Transport
//!    failures become a `502` JSON payload; nothing else is synthesized.
//! 4. On SIGINT/SIGTERM the listener stops accepting, the upstream is stopped
//!    (SIGTERM, then SIGKILL after the grace period) and the process exits `0`.
//!    A second signal SIGKILLs the upstream's process group and exits `130`.
//!
//! ## Configuration (env vars)
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `SHIM_LISTEN_ADDR` | `0.0.0.0:8001` | Forwarder listen address |
//! | `SHIM_STATUS_PORT` | unset | Status endpoint port (disabled when unset) |
//! | `UPSTREAM_PORT` | `3000` | Port the upstream listens on (loopback) |
//! | `UPSTREAM_COMMAND` | `npm run dev` | Whitespace-separated startup command |
//! | `UPSTREAM_DIR` | `/app/backend` | Upstream working directory |
//! | `UPSTREAM_READY_TIMEOUT_SECS` | `30` | Readiness wait budget |
//! | `UPSTREAM_REQUEST_TIMEOUT_SECS` | `30` | Per-request forward timeout |
//! | `UPSTREAM_STOP_TIMEOUT_SECS` | `10` | Grace period after SIGTERM |
//! | `UPSTREAM_MAX_RESTARTS` | `0` | Restarts after an unexpected exit |
//! | `UPSTREAM_RESTART_BACKOFF_MS` | `500` | Initial restart delay (doubles) |
//! | `SHIM_SHUTDOWN_TIMEOUT_SECS` | `20` | Bound on the whole shutdown |
//! | `RUST_LOG` | `info` | Log filter (tracing-subscriber) |

pub mod config;
pub mod env;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod logs;
pub mod readiness;
pub mod signal;
pub mod supervisor;

pub use config::{Config, UpstreamCommand};
pub use error::ShimError;
pub use supervisor::{RestartPolicy, UpstreamStatus, UpstreamSupervisor};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::forwarder::ForwarderState;
use crate::health::StatusState;
use crate::readiness::Readiness;
use crate::signal::Signals;

/// Runs the shim until SIGINT/SIGTERM: spawns the upstream, waits for it to
/// accept connections, serves the forwarder and stops the upstream on exit.
///
/// Signal handlers are installed before the upstream is spawned. A signal
/// during startup stops the upstream and returns `Ok(())` without serving; a
/// second signal at any point kills the upstream's process group and exits
/// with [`signal::FORCED_EXIT_CODE`].
pub async fn run(config: Config) -> Result<(), ShimError> {
    let signals = Signals::install().map_err(ShimError::Signal)?;

    let (log_tx, log_rx) = logs::channel();
    let relay = tokio::spawn(logs::relay(log_rx));

    let supervisor = Arc::new(
        UpstreamSupervisor::new(config.command().clone(), log_tx)
            .with_stop_timeout(config.stop_timeout())
            .with_restart_policy(RestartPolicy::new(
                config.max_restarts(),
                config.restart_backoff(),
            )),
    );

    let (requested_tx, requested_rx) = watch::channel(false);
    let forced = supervisor.clone();
    let coordinator = signal::coordinate(signals, requested_tx, move || {
        forced.kill_now();
    });

    tokio::select! {
        () = start_upstream(&supervisor, &config) => {}
        () = signal::shutdown_requested(requested_rx.clone()) => {
            info!("Shutdown requested during startup, stopping upstream");
            if supervisor.stop().await {
                info!("Upstream stopped");
            }
            coordinator.abort();
            relay.abort();
            return Ok(());
        }
    }

    let prepared = async {
        let state = ForwarderState::new(config.upstream_base_url(), config.request_timeout())?;
        let listener = TcpListener::bind(config.listen_addr())
            .await
            .map_err(|source| ShimError::Bind {
                addr: config.listen_addr(),
                source,
            })?;
        Ok::<_, ShimError>((state, listener))
    }
    .await;

    let (state, listener) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            // The caller exits right after; don't leave the upstream orphaned.
            supervisor.stop().await;
            coordinator.abort();
            relay.abort();
            return Err(e);
        }
    };

    let status_server = match config.status_port() {
        Some(port) => {
            let status = StatusState::new(supervisor.status_handle());
            Some(tokio::spawn(async move {
                if let Err(e) = health::serve_status(status, port).await {
                    error!(error = %e, "Status endpoint stopped");
                }
            }))
        }
        None => None,
    };

    info!(
        addr = %config.listen_addr(),
        upstream = %config.upstream_base_url(),
        "Upstream shim listening"
    );

    let result = serve(
        listener,
        state,
        supervisor.clone(),
        config.shutdown_timeout(),
        signal::shutdown_requested(requested_rx),
    )
    .await;

    if let Some(handle) = status_server {
        handle.abort();
    }
    coordinator.abort();
    relay.abort();

    result
}

/// Spawn the upstream and wait until it accepts connections, gives up for
/// good, or the ready timeout passes. Failures are logged; the shim serves
/// regardless and answers with 502 until the upstream is reachable.
async fn start_upstream(supervisor: &UpstreamSupervisor, config: &Config) {
    let pid = match supervisor.start().await {
        Ok(pid) => pid,
        Err(e) => {
            error!(error = %e, "Upstream failed to start; requests will be answered with 502");
            return;
        }
    };

    info!(pid, upstream = %config.upstream_addr(), "Waiting for upstream to accept connections");
    let upstream = supervisor.status_handle();
    let readiness = readiness::wait_until_ready(config.upstream_addr(), config.ready_timeout(), || {
        upstream.is_supervised()
    })
    .await;

    match readiness {
        Readiness::Ready { elapsed, attempts } => info!(
            elapsed_ms = elapsed.as_millis() as u64,
            attempts,
            "Upstream is ready"
        ),
        Readiness::TimedOut { attempts } => warn!(
            attempts,
            timeout_secs = config.ready_timeout().as_secs(),
            "Upstream not ready in time; serving anyway"
        ),
        Readiness::Exited { attempts } => error!(
            attempts,
            "Upstream exited before accepting connections; requests will be answered with 502"
        ),
    }
}

/// Serves the forwarder on `listener` until `shutdown` resolves, then stops
/// accepting connections, stops the upstream and waits for in-flight requests.
///
/// The whole sequence after `shutdown` is bounded by `shutdown_timeout`.
pub async fn serve<F>(
    listener: TcpListener,
    state: ForwarderState,
    supervisor: Arc<UpstreamSupervisor>,
    shutdown_timeout: Duration,
    shutdown: F,
) -> Result<(), ShimError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let app = forwarder::router(state);

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = drain_rx.await;
            })
            .await
    });

    tokio::select! {
        joined = &mut server => {
            // The server ended without a shutdown request.
            supervisor.stop().await;
            return match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ShimError::Serve(e)),
                Err(e) => Err(ShimError::Serve(std::io::Error::other(e))),
            };
        }
        _ = shutdown => {}
    }

    info!("Stopping upstream");

    let _ = drain_tx.send(());
    let sequence = async {
        if supervisor.stop().await {
            info!("Upstream stopped");
        }
        server.await
    };

    match tokio::time::timeout(shutdown_timeout, sequence).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(ShimError::Serve(e)),
        Ok(Err(e)) => Err(ShimError::Serve(std::io::Error::other(e))),
        Err(_) => {
            warn!(
                timeout_secs = shutdown_timeout.as_secs(),
                "Shutdown did not finish in time, exiting anyway"
            );
            Ok(())
        }
    }
}
