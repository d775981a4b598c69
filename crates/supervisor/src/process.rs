//! Process server and process handle contracts.
//!
//! Every check on a handle is non-blocking when called with a zero timeout,
//! so a single cooperative loop can drive many deployments.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DeploymentError, DeploymentResult};

/// Machine name used when a deployment is not given an explicit host.
pub const LOCALHOST: &str = "localhost";

/// Default output redirection pattern: `%m` is the deployment name and `%p`
/// the process id.
pub const DEFAULT_OUTPUT_PATTERN: &str = "%m-%p.txt";

/// Identity of a spawned process, usable as a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(String);

impl ProcessId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Normal exit with a status code.
    Exited { code: i32 },
    /// Termination by signal.
    Signaled { signal: i32 },
}

impl ProcessExit {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    #[must_use]
    pub const fn signal(&self) -> Option<i32> {
        match self {
            Self::Signaled { signal } => Some(*signal),
            Self::Exited { .. } => None,
        }
    }

    /// SIGINT or SIGTERM, i.e. a termination the process was asked for.
    #[must_use]
    pub const fn is_graceful_signal(&self) -> bool {
        matches!(self, Self::Signaled { signal: 2 | 15 })
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled { signal };
            }
        }
        Self::Exited {
            code: status.code().unwrap_or(-1),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with status {code}"),
            Self::Signaled { signal } => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Output redirection request passed to a process server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pattern: String,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_PATTERN)
    }
}

impl OutputSpec {
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Expand `%m` and `%p` in the pattern.
    #[must_use]
    pub fn render(&self, deployment: &str, pid: &str) -> String {
        self.pattern.replace("%m", deployment).replace("%p", pid)
    }
}

/// Handle to a spawned deployment process.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    /// Registry identity of this process.
    fn id(&self) -> ProcessId;

    /// Whether the OS process is still alive.
    fn is_running(&self) -> bool;

    /// Whether the process reached its running state (all of its tasks are
    /// reachable). A zero timeout must return immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the readiness probe itself fails.
    fn wait_running(&self, timeout: Duration) -> DeploymentResult<bool>;

    /// Non-blocking exit observation. `Ok(None)` while the process runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the exit status cannot be queried.
    fn try_exit(&self) -> DeploymentResult<Option<ProcessExit>>;

    /// Request termination; `force` kills without giving the process a
    /// chance to clean up.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal could not be delivered.
    fn kill(&self, force: bool) -> DeploymentResult<()>;

    /// Start logging one output port of a task hosted by this process.
    ///
    /// # Errors
    ///
    /// Returns an error if the logger could not be attached.
    fn log_port(&self, task: &str, port: &str, log_dir: &Path, remote: bool) -> DeploymentResult<()>;
}

/// Spawns deployment executables on one machine.
pub trait ProcessServer: Send + Sync {
    /// Start `deployment` inside `working_directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable cannot be started.
    fn start(
        &self,
        deployment: &str,
        working_directory: &Path,
        output: &OutputSpec,
    ) -> DeploymentResult<Arc<dyn ProcessHandle>>;
}

/// A process server together with the log directory its deployments run in.
#[derive(Clone)]
pub struct ProcessServerEntry {
    pub server: Arc<dyn ProcessServer>,
    pub log_dir: PathBuf,
}

impl fmt::Debug for ProcessServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessServerEntry")
            .field("log_dir", &self.log_dir)
            .finish_non_exhaustive()
    }
}

/// The set of known process servers, keyed by machine name.
#[derive(Debug, Clone, Default)]
pub struct ProcessServers {
    servers: HashMap<String, ProcessServerEntry>,
}

impl ProcessServers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the process server for `host`.
    #[must_use]
    pub fn with_server(
        mut self,
        host: impl Into<String>,
        server: Arc<dyn ProcessServer>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        self.servers.insert(
            host.into(),
            ProcessServerEntry {
                server,
                log_dir: log_dir.into(),
            },
        );
        self
    }

    /// Look up the process server for `host`.
    ///
    /// # Errors
    ///
    /// Returns `DeploymentError::UnknownProcessServer` if none is registered.
    pub fn get(&self, host: &str) -> DeploymentResult<&ProcessServerEntry> {
        self.servers
            .get(host)
            .ok_or_else(|| DeploymentError::unknown_process_server(host))
    }

    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }
}
