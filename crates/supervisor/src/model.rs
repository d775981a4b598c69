//! Static deployment models.
//!
//! Task models are registered once at load time and deployments resolve
//! their activities against that registry, so the lifecycle never has to
//! match model names at runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{DeploymentError, DeploymentResult};

/// Direction of a task port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

/// A port declared by a task model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDecl {
    pub name: String,
    pub direction: PortDirection,
    #[serde(default)]
    pub type_name: String,
}

impl PortDecl {
    /// Declare an input port.
    #[must_use]
    pub fn input(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Input,
            type_name: type_name.into(),
        }
    }

    /// Declare an output port.
    #[must_use]
    pub fn output(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Output,
            type_name: type_name.into(),
        }
    }
}

/// A component type that task activities instantiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskModel {
    name: String,
    ports: Vec<PortDecl>,
}

impl TaskModel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: PortDecl) -> Self {
        self.ports.push(port);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ports(&self) -> &[PortDecl] {
        &self.ports
    }
}

impl fmt::Display for TaskModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Typed registry of task models keyed by model identifier.
#[derive(Debug, Clone, Default)]
pub struct TaskModelRegistry {
    models: HashMap<String, Arc<TaskModel>>,
}

impl TaskModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, replacing any previous model with the same name.
    pub fn register(&mut self, model: TaskModel) -> Arc<TaskModel> {
        let model = Arc::new(model);
        self.models
            .insert(model.name().to_string(), Arc::clone(&model));
        model
    }

    /// Resolve a model identifier.
    ///
    /// # Errors
    ///
    /// Returns `DeploymentError::UnknownTaskModel` if nothing was registered
    /// under `name`.
    pub fn resolve(&self, name: &str) -> DeploymentResult<Arc<TaskModel>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| DeploymentError::unknown_task_model(name))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// A task hosted by a deployment, bound to its resolved model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskActivity {
    pub name: String,
    pub model: Arc<TaskModel>,
}

impl TaskActivity {
    #[must_use]
    pub fn new(name: impl Into<String>, model: Arc<TaskModel>) -> Self {
        Self {
            name: name.into(),
            model,
        }
    }
}

/// Compiled description of a deployment executable and its tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSpec {
    name: String,
    activities: Vec<TaskActivity>,
}

impl DeploymentSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            activities: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_activity(mut self, activity: TaskActivity) -> Self {
        self.activities.push(activity);
        self
    }

    /// Build a deployment from `(task name, model name)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `DeploymentError::UnknownTaskModel` for the first activity
    /// whose model is not registered.
    pub fn resolve<'a>(
        name: impl Into<String>,
        tasks: impl IntoIterator<Item = (&'a str, &'a str)>,
        models: &TaskModelRegistry,
    ) -> DeploymentResult<Self> {
        tasks.into_iter().try_fold(Self::new(name), |spec, (task, model)| {
            Ok(spec.with_activity(TaskActivity::new(task, models.resolve(model)?)))
        })
    }

    /// The executable name of this deployment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn activities(&self) -> &[TaskActivity] {
        &self.activities
    }

    #[must_use]
    pub fn activity(&self, name: &str) -> Option<&TaskActivity> {
        self.activities.iter().find(|a| a.name == name)
    }
}
