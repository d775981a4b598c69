//! Process server spawning deployments on the local machine.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DeploymentError, DeploymentResult};
use crate::process::{OutputSpec, ProcessExit, ProcessHandle, ProcessId, ProcessServer};

/// Executable and arguments used for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CommandLine {
    program: String,
    args: Vec<String>,
}

/// Spawns deployment executables as child processes.
///
/// A deployment runs the executable named after it, looked up in `PATH`,
/// unless a command was registered for it.
#[derive(Debug, Default)]
pub struct LocalProcessServer {
    commands: HashMap<String, CommandLine>,
}

impl LocalProcessServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `program args...` when `deployment` is started.
    #[must_use]
    pub fn with_command<I, S>(mut self, deployment: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.insert(
            deployment.into(),
            CommandLine {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    fn command_line(&self, deployment: &str) -> CommandLine {
        self.commands.get(deployment).cloned().unwrap_or_else(|| CommandLine {
            program: deployment.to_string(),
            args: Vec::new(),
        })
    }
}

impl ProcessServer for LocalProcessServer {
    fn start(
        &self,
        deployment: &str,
        working_directory: &Path,
        output: &OutputSpec,
    ) -> DeploymentResult<Arc<dyn ProcessHandle>> {
        std::fs::create_dir_all(working_directory).map_err(|e| {
            fleet_core::Error::directory_creation_failed(working_directory, e.to_string())
        })?;

        // The pid is only known after spawning, so the output file is renamed.
        let pending = working_directory.join(output.render(deployment, "starting"));
        let file = File::create(&pending)
            .map_err(|e| DeploymentError::process(format!("cannot create {}: {e}", pending.display())))?;
        let stderr = file
            .try_clone()
            .map_err(|e| DeploymentError::process(e.to_string()))?;

        let command = self.command_line(deployment);
        let child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(file)
            .stderr(stderr)
            .spawn()
            .map_err(|e| {
                if let Err(cleanup) = std::fs::remove_file(&pending) {
                    debug!(path = %pending.display(), error = %cleanup, "cannot remove pending output file");
                }
                DeploymentError::process(format!("cannot execute {}: {e}", command.program))
            })?;

        // The child runs from here on: a failed rename keeps the pending name.
        let pid = child.id();
        let renamed = working_directory.join(output.render(deployment, &pid.to_string()));
        let output_path = if renamed == pending {
            pending
        } else {
            match std::fs::rename(&pending, &renamed) {
                Ok(()) => renamed,
                Err(e) => {
                    warn!(
                        deployment,
                        pid,
                        output = %pending.display(),
                        error = %e,
                        "cannot rename output file, keeping its pending name"
                    );
                    pending
                }
            }
        };
        info!(deployment, pid, output = %output_path.display(), "spawned deployment process");

        Ok(Arc::new(LocalProcess {
            pid,
            child: Mutex::new(child),
            exit: Mutex::new(None),
            output_path,
        }))
    }
}

/// A child process spawned by [`LocalProcessServer`].
#[derive(Debug)]
pub struct LocalProcess {
    pid: u32,
    child: Mutex<Child>,
    exit: Mutex<Option<ProcessExit>>,
    output_path: PathBuf,
}

impl LocalProcess {
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// File receiving the process stdout and stderr.
    #[must_use]
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

impl ProcessHandle for LocalProcess {
    fn id(&self) -> ProcessId {
        ProcessId::new(self.pid.to_string())
    }

    fn is_running(&self) -> bool {
        matches!(self.try_exit(), Ok(None))
    }

    /// Without task introspection, a local process is running as soon as it
    /// is alive.
    fn wait_running(&self, _timeout: Duration) -> DeploymentResult<bool> {
        Ok(self.try_exit()?.is_none())
    }

    fn try_exit(&self) -> DeploymentResult<Option<ProcessExit>> {
        let mut exit = self.exit.lock();
        if exit.is_none() {
            *exit = self
                .child
                .lock()
                .try_wait()
                .map_err(|e| DeploymentError::process(format!("cannot wait for {}: {e}", self.pid)))?
                .map(ProcessExit::from);
        }
        Ok(*exit)
    }

    fn kill(&self, force: bool) -> DeploymentResult<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| DeploymentError::process(format!("pid {} out of range", self.pid)))?;
        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        debug!(pid = self.pid, signal = ?sig, "signaling deployment process");
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DeploymentError::process(format!("cannot signal {}: {e}", self.pid))),
        }
    }

    /// Port loggers need a component framework inside the deployment, which
    /// a plain child process does not offer.
    fn log_port(&self, task: &str, port: &str, _log_dir: &Path, _remote: bool) -> DeploymentResult<()> {
        Err(DeploymentError::unsupported(
            format!("logging {task}:{port}"),
            "the local process server",
        ))
    }
}
