//! Bounded TCP readiness check for the upstream port.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

const INITIAL_PROBE_DELAY: Duration = Duration::from_millis(50);
const MAX_PROBE_DELAY: Duration = Duration::from_secs(1);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { elapsed: Duration, attempts: u32 },
    TimedOut { attempts: u32 },
    /// The upstream went away for good while we were waiting.
    Exited { attempts: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Poll `addr` until a TCP connection succeeds or `timeout` elapses.
///
/// The delay between attempts starts at 50ms and doubles up to 1s. Each successful
/// connection is closed immediately; nothing is sent over it. `alive` is
/// checked after every failed attempt; once it reports `false` there is
/// nothing left to wait for and the wait returns [`Readiness::Exited`].
pub async fn wait_until_ready<F>(addr: SocketAddr, timeout: Duration, alive: F) -> Readiness
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut delay = INITIAL_PROBE_DELAY;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .min(CONNECT_ATTEMPT_TIMEOUT);

        match tokio::time::timeout(budget, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                return Readiness::Ready {
                    elapsed: start.elapsed(),
                    attempts,
                };
            }
            Ok(Err(e)) => debug!(%addr, attempt = attempts, error = %e, "Upstream not accepting yet"),
            Err(_) => debug!(%addr, attempt = attempts, "Upstream connect attempt timed out"),
        }

        if !alive() {
            return Readiness::Exited { attempts };
        }
        let now = Instant::now();
        if now >= deadline {
            return Readiness::TimedOut { attempts };
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(MAX_PROBE_DELAY);
    }
}
