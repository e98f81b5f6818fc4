//! Configuration for the shim and the upstream it supervises.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::env::ReadEnv;
use crate::error::ShimError;

const DEFAULT_LISTEN_PORT: u16 = 8001;
const DEFAULT_UPSTREAM_PORT: u16 = 3000;
const DEFAULT_UPSTREAM_COMMAND: &str = "npm run dev";
const DEFAULT_UPSTREAM_DIR: &str = "/app/backend";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_RESTARTS: u32 = 0;
const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_millis(500);
const MIN_TIMEOUT_SECS: u64 = 1;

const ENV_LISTEN_ADDR: &str = "SHIM_LISTEN_ADDR";
const ENV_STATUS_PORT: &str = "SHIM_STATUS_PORT";
const ENV_SHUTDOWN_TIMEOUT_SECS: &str = "SHIM_SHUTDOWN_TIMEOUT_SECS";
const ENV_UPSTREAM_PORT: &str = "UPSTREAM_PORT";
const ENV_UPSTREAM_COMMAND: &str = "UPSTREAM_COMMAND";
const ENV_UPSTREAM_DIR: &str = "UPSTREAM_DIR";
const ENV_READY_TIMEOUT_SECS: &str = "UPSTREAM_READY_TIMEOUT_SECS";
const ENV_REQUEST_TIMEOUT_SECS: &str = "UPSTREAM_REQUEST_TIMEOUT_SECS";
const ENV_STOP_TIMEOUT_SECS: &str = "UPSTREAM_STOP_TIMEOUT_SECS";
const ENV_MAX_RESTARTS: &str = "UPSTREAM_MAX_RESTARTS";
const ENV_RESTART_BACKOFF_MS: &str = "UPSTREAM_RESTART_BACKOFF_MS";

/// The upstream's startup command and the directory it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamCommand {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl UpstreamCommand {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Split a command line on whitespace. No quoting is supported; wrap
    /// anything more involved in a script.
    pub fn parse(line: &str, working_dir: impl Into<PathBuf>) -> Result<Self, ShimError> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ShimError::InvalidCommand("command is empty".to_string()))?;
        Ok(Self::new(program, working_dir).with_args(parts))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

impl std::fmt::Display for UpstreamCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Shim configuration. Every value has a fixed default; `from_env` applies
/// overrides from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    listen_addr: SocketAddr,
    status_port: Option<u16>,
    upstream_port: u16,
    command: UpstreamCommand,
    ready_timeout: Duration,
    request_timeout: Duration,
    stop_timeout: Duration,
    shutdown_timeout: Duration,
    max_restarts: u32,
    restart_backoff: Duration,
}

impl Config {
    pub fn new(command: UpstreamCommand) -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_LISTEN_PORT)),
            status_port: None,
            upstream_port: DEFAULT_UPSTREAM_PORT,
            command,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
        }
    }

    /// Resolve the configuration from environment variables.
    ///
    /// Unparseable numbers and timeouts below one second are ignored with a
    /// warning. Only an empty `UPSTREAM_COMMAND` is a hard error.
    pub fn from_env<E: ReadEnv>(env: &E) -> Result<Self, ShimError> {
        let line = env
            .var(ENV_UPSTREAM_COMMAND)
            .unwrap_or_else(|_| DEFAULT_UPSTREAM_COMMAND.to_string());
        let dir = env
            .var(ENV_UPSTREAM_DIR)
            .unwrap_or_else(|_| DEFAULT_UPSTREAM_DIR.to_string());
        let mut config = Self::new(UpstreamCommand::parse(&line, dir)?);

        if let Some(addr) = parse_var::<SocketAddr, _>(env, ENV_LISTEN_ADDR) {
            config.listen_addr = addr;
        }
        config.status_port = parse_var(env, ENV_STATUS_PORT);
        if let Some(port) = parse_var(env, ENV_UPSTREAM_PORT) {
            config.upstream_port = port;
        }
        config.ready_timeout = timeout_var(env, ENV_READY_TIMEOUT_SECS, DEFAULT_READY_TIMEOUT);
        config.request_timeout =
            timeout_var(env, ENV_REQUEST_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT);
        config.stop_timeout = timeout_var(env, ENV_STOP_TIMEOUT_SECS, DEFAULT_STOP_TIMEOUT);
        config.shutdown_timeout =
            timeout_var(env, ENV_SHUTDOWN_TIMEOUT_SECS, DEFAULT_SHUTDOWN_TIMEOUT);
        if let Some(max) = parse_var(env, ENV_MAX_RESTARTS) {
            config.max_restarts = max;
        }
        if let Some(ms) = parse_var::<u64, _>(env, ENV_RESTART_BACKOFF_MS) {
            config.restart_backoff = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_status_port(mut self, port: u16) -> Self {
        self.status_port = Some(port);
        self
    }

    pub fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = port;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_restarts(mut self, max_restarts: u32, backoff: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.restart_backoff = backoff;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn status_port(&self) -> Option<u16> {
        self.status_port
    }

    pub fn upstream_port(&self) -> u16 {
        self.upstream_port
    }

    /// Loopback address the readiness check connects to.
    pub fn upstream_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.upstream_port))
    }

    /// Base URL requests are forwarded to; the inbound path and query are
    /// appended verbatim.
    pub fn upstream_base_url(&self) -> String {
        format!("http://{}", self.upstream_addr())
    }

    pub fn command(&self) -> &UpstreamCommand {
        &self.command
    }

    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    pub fn restart_backoff(&self) -> Duration {
        self.restart_backoff
    }
}

fn parse_var<T, E>(env: &E, key: &str) -> Option<T>
where
    T: FromStr,
    E: ReadEnv,
{
    let raw = env.var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{key}={raw:?} is not valid, using default");
            None
        }
    }
}

fn timeout_var<E: ReadEnv>(env: &E, key: &str, default: Duration) -> Duration {
    match parse_var::<u64, _>(env, key) {
        Some(secs) if secs >= MIN_TIMEOUT_SECS => Duration::from_secs(secs),
        Some(secs) => {
            warn!("{key}={secs} is below minimum ({MIN_TIMEOUT_SECS}), using default");
            default
        }
        None => default,
    }
}
