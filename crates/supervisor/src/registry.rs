//! Process-wide deployment registry.
//!
//! Maps a process identity to the deployment that owns it. The reaper uses
//! it to decide whether a connection peer is still alive. Access is guarded
//! by a reentrant lock: a thread that pinned the registry with [`hold`] can
//! keep calling lookups without deadlocking.
//!
//! [`hold`]: DeploymentRegistry::hold

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::debug;

use crate::deployment::DeploymentState;
use crate::process::{ProcessHandle, ProcessId};

/// What the registry knows about one live deployment process.
#[derive(Debug, Clone)]
pub struct DeploymentRecord {
    pub deployment: String,
    pub machine: String,
    pub state: DeploymentState,
    pub process: Arc<dyn ProcessHandle>,
}

impl DeploymentRecord {
    /// Registered and not on its way out. The process itself may already
    /// have exited: until its supervisor processes the death, the peer is
    /// still expected to take part in teardown.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        !self.state.is_finishing()
    }
}

type Entries = HashMap<ProcessId, DeploymentRecord>;

/// Registry of deployments keyed by process identity.
#[derive(Debug, Default)]
pub struct DeploymentRegistry {
    entries: ReentrantMutex<RefCell<Entries>>,
}

/// Keeps the registry locked for the current thread while alive.
#[must_use = "the registry is only pinned while the snapshot is held"]
pub struct RegistrySnapshot<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<Entries>>,
}

impl DeploymentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut Entries) -> R) -> R {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();
        f(&mut entries)
    }

    /// Pin the registry so a sequence of lookups sees one consistent state.
    pub fn hold(&self) -> RegistrySnapshot<'_> {
        RegistrySnapshot {
            _guard: self.entries.lock(),
        }
    }

    /// Register a deployment process. Returns the record it replaced, if any.
    pub fn register(&self, record: DeploymentRecord) -> Option<DeploymentRecord> {
        let pid = record.process.id();
        debug!(process = %pid, deployment = %record.deployment, "registering deployment");
        self.with_entries(|entries| entries.insert(pid, record))
    }

    /// Update the lifecycle state recorded for `pid`.
    pub fn update_state(&self, pid: &ProcessId, state: DeploymentState) -> bool {
        self.with_entries(|entries| {
            entries
                .get_mut(pid)
                .map(|record| record.state = state)
                .is_some()
        })
    }

    pub fn remove(&self, pid: &ProcessId) -> Option<DeploymentRecord> {
        self.with_entries(|entries| entries.remove(pid))
    }

    #[must_use]
    pub fn lookup(&self, pid: &ProcessId) -> Option<DeploymentRecord> {
        self.with_entries(|entries| entries.get(pid).cloned())
    }

    #[must_use]
    pub fn contains(&self, pid: &ProcessId) -> bool {
        self.with_entries(|entries| entries.contains_key(pid))
    }

    /// Whether the deployment owning `pid` is registered and neither
    /// stopping nor dead.
    #[must_use]
    pub fn is_peer_alive(&self, pid: &ProcessId) -> bool {
        self.with_entries(|entries| entries.get(pid).is_some_and(DeploymentRecord::is_alive))
    }

    /// Names of all registered deployments, sorted.
    #[must_use]
    pub fn deployments(&self) -> Vec<String> {
        let mut names = self.with_entries(|entries| {
            entries
                .values()
                .map(|r| r.deployment.clone())
                .collect::<Vec<_>>()
        });
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
