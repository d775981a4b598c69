//! Task handles and the collaborators that produce them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::DeploymentResult;
use crate::model::{PortDecl, TaskActivity, TaskModel};
use crate::process::ProcessId;

/// Port-level control over a running task component.
///
/// The transport behind it is up to the implementation.
pub trait RemoteTask: Send + Sync + fmt::Debug {
    /// Ports currently exposed by the running task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be reached.
    fn ports(&self) -> DeploymentResult<Vec<PortDecl>>;

    /// Disconnect this task's output `source_port` from `sink_task:sink_port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails.
    fn disconnect_from(
        &self,
        source_port: &str,
        sink_task: &str,
        sink_port: &str,
    ) -> DeploymentResult<()>;

    /// Drop every connection attached to `port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote call fails.
    fn disconnect_all(&self, port: &str) -> DeploymentResult<()>;
}

/// Resolves a task name to a live remote task.
pub trait TaskDiscovery: Send + Sync {
    /// # Errors
    ///
    /// Returns `DeploymentError::DiscoveryFailed` if no such task is reachable.
    fn lookup(&self, qualified_name: &str) -> DeploymentResult<Arc<dyn RemoteTask>>;
}

/// Live reference to a task running inside a deployment process.
#[derive(Clone)]
pub struct TaskHandle {
    name: String,
    deployment: Option<String>,
    process: Option<ProcessId>,
    remote: Arc<dyn RemoteTask>,
    valid: Arc<AtomicBool>,
}

impl TaskHandle {
    /// A handle not owned by any supervised deployment.
    #[must_use]
    pub fn detached(name: impl Into<String>, remote: Arc<dyn RemoteTask>) -> Self {
        Self {
            name: name.into(),
            deployment: None,
            process: None,
            remote,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn owned(
        name: impl Into<String>,
        deployment: impl Into<String>,
        process: ProcessId,
        remote: Arc<dyn RemoteTask>,
        valid: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name: name.into(),
            deployment: Some(deployment.into()),
            process: Some(process),
            remote,
            valid,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the deployment this handle is bound to, if any.
    #[must_use]
    pub fn deployment(&self) -> Option<&str> {
        self.deployment.as_deref()
    }

    /// The process hosting this task, if known.
    #[must_use]
    pub const fn process(&self) -> Option<&ProcessId> {
        self.process.as_ref()
    }

    #[must_use]
    pub fn remote(&self) -> &dyn RemoteTask {
        self.remote.as_ref()
    }

    /// False once the owning deployment died.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("deployment", &self.deployment)
            .field("process", &self.process)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Name to handle mapping of the tasks running in one deployment.
///
/// Empty until the deployment is ready; every handle it ever produced is
/// invalidated together when the deployment dies.
#[derive(Debug)]
pub struct TaskHandleRegistry {
    tasks: BTreeMap<String, TaskHandle>,
    valid: Arc<AtomicBool>,
}

impl Default for TaskHandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHandleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn validity(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.valid)
    }

    /// Replace the whole content in one step.
    pub(crate) fn populate(&mut self, tasks: BTreeMap<String, TaskHandle>) {
        self.tasks = tasks;
    }

    /// Invalidate every handle and return the ones that were registered.
    pub(crate) fn invalidate(&mut self) -> Vec<TaskHandle> {
        self.valid.store(false, Ordering::Release);
        std::mem::take(&mut self.tasks).into_values().collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TaskHandle> {
        self.tasks.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn handles(&self) -> impl Iterator<Item = &TaskHandle> {
        self.tasks.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A task instance executed by a deployment.
///
/// Cloning shares the binding: the supervisor binds the live handle when the
/// deployment becomes ready and clears it when the deployment dies.
#[derive(Debug, Clone)]
pub struct TaskBinding {
    deployment: String,
    activity: TaskActivity,
    handle: Arc<Mutex<Option<TaskHandle>>>,
}

impl TaskBinding {
    pub(crate) fn new(deployment: impl Into<String>, activity: TaskActivity) -> Self {
        Self {
            deployment: deployment.into(),
            activity,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.activity.name
    }

    /// Deployment acting as execution agent of this task.
    #[must_use]
    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    #[must_use]
    pub fn model(&self) -> &TaskModel {
        &self.activity.model
    }

    /// Current live handle, if the deployment is ready.
    #[must_use]
    pub fn handle(&self) -> Option<TaskHandle> {
        self.handle.lock().clone()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub(crate) fn bind(&self, handle: TaskHandle) {
        *self.handle.lock() = Some(handle);
    }

    pub(crate) fn unbind(&self) {
        *self.handle.lock() = None;
    }
}

/// Names of tasks whose configuration step has run.
///
/// A task loses its marker when its deployment dies, so it is configured
/// again after a restart.
#[derive(Debug, Default)]
pub struct ConfiguredTasks {
    names: Mutex<HashSet<String>>,
}

impl ConfiguredTasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, name: impl Into<String>) {
        self.names.lock().insert(name.into());
    }

    #[must_use]
    pub fn is_configured(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }

    /// Returns true if a marker was removed.
    pub fn clear(&self, name: &str) -> bool {
        self.names.lock().remove(name)
    }
}
