use std::net::SocketAddr;

/// Errors raised while starting, serving or supervising.
///
/// Request-path failures are not represented here; they are turned into
/// responses by [`ForwardError`](crate::forwarder::ForwardError).
#[derive(Debug)]
pub enum ShimError {
    /// The upstream executable could not be started.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// `start()` was called while an upstream process is still alive.
    AlreadyRunning { pid: u32 },
    InvalidCommand(String),
    HttpClient(reqwest::Error),
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    Serve(std::io::Error),
    /// SIGINT/SIGTERM handlers could not be registered.
    Signal(std::io::Error),
}

impl std::fmt::Display for ShimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { program, source } => {
                write!(f, "Failed to spawn upstream '{program}': {source}")
            }
            Self::AlreadyRunning { pid } => write!(f, "Upstream already running (pid {pid})"),
            Self::InvalidCommand(reason) => write!(f, "Invalid upstream command: {reason}"),
            Self::HttpClient(e) => write!(f, "Failed to build HTTP client: {e}"),
            Self::Bind { addr, source } => write!(f, "Failed to bind {addr}: {source}"),
            Self::Serve(e) => write!(f, "HTTP server error: {e}"),
            Self::Signal(e) => write!(f, "Failed to install signal handlers: {e}"),
        }
    }
}

impl std::error::Error for ShimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } | Self::Bind { source, .. } => Some(source),
            Self::HttpClient(e) => Some(e),
            Self::Serve(e) | Self::Signal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ShimError {
    fn from(e: reqwest::Error) -> Self {
        Self::HttpClient(e)
    }
}
