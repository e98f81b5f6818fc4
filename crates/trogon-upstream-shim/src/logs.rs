//! Upstream output capture.
//!
//! The drain task of the running child is the only producer; [`relay`] is the
//! only consumer and turns each line into a `tracing` event with target
//! `upstream`. Lines from stdout and stderr are merged in arrival order.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Lines buffered between the drain task and the relay. When full, the drain
/// task waits, which in turn back-pressures the child's pipes.
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

pub type LogSender = mpsc::Sender<LogLine>;
pub type LogReceiver = mpsc::Receiver<LogLine>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// One line of upstream output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

pub fn channel() -> (LogSender, LogReceiver) {
    mpsc::channel(LOG_CHANNEL_CAPACITY)
}

/// Read `stdout` and `stderr` line by line until both reach EOF and send every
/// line to `tx`. Invalid UTF-8 is replaced rather than dropped so the pipes
/// are always drained. Returns the number of lines sent.
pub async fn drain<O, E>(stdout: O, stderr: E, tx: LogSender) -> usize
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = BufReader::new(stdout);
    let mut err = BufReader::new(stderr);
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_open = true;
    let mut err_open = true;
    let mut sent = 0;

    while out_open || err_open {
        // `read_until` is cancel-safe: a partial line stays in its buffer.
        let line = tokio::select! {
            read = out.read_until(b'\n', &mut out_buf), if out_open => {
                match read {
                    Ok(0) => { out_open = false; continue; }
                    Ok(_) => LogLine { stream: LogStream::Stdout, text: take_line(&mut out_buf) },
                    Err(e) => {
                        warn!(error = %e, "Failed to read upstream stdout");
                        out_open = false;
                        continue;
                    }
                }
            }
            read = err.read_until(b'\n', &mut err_buf), if err_open => {
                match read {
                    Ok(0) => { err_open = false; continue; }
                    Ok(_) => LogLine { stream: LogStream::Stderr, text: take_line(&mut err_buf) },
                    Err(e) => {
                        warn!(error = %e, "Failed to read upstream stderr");
                        err_open = false;
                        continue;
                    }
                }
            }
        };

        if tx.send(line).await.is_err() {
            break;
        }
        sent += 1;
    }

    sent
}

/// Emit every received line until all senders are gone. Returns the number of
/// lines relayed.
pub async fn relay(mut rx: LogReceiver) -> usize {
    let mut relayed = 0;
    while let Some(line) = rx.recv().await {
        info!(target: "upstream", stream = %line.stream, "{}", line.text);
        relayed += 1;
    }
    relayed
}

fn take_line(buf: &mut Vec<u8>) -> String {
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    let text = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    text
}
