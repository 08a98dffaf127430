//! Build tasks.
//!
//! A task bundles an action closure with an ordered dependency list, an
//! optional description, and an interactive flag. Tasks are immutable once
//! built; the combinators return new tasks sharing the underlying actions,
//! so dependency graphs are acyclic by construction. Names are bound when a
//! project publishes the task.

use crate::{
    error::{KilnError, Result},
    graph::{self, Dag},
};
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, OnceLock},
};

/// An action produces `None` on success or a human-readable error.
pub type ActionResult = Option<String>;

type Action = Arc<dyn Fn() -> ActionResult + Send + Sync>;

#[derive(Clone)]
pub struct Task(Arc<TaskInner>);

struct TaskInner {
    description: Option<String>,
    dependencies: Vec<Task>,
    interactive: bool,
    action: Action,
    name: OnceLock<String>,
}

impl Task {
    pub fn new(action: impl Fn() -> ActionResult + Send + Sync + 'static) -> Task {
        Task(Arc::new(TaskInner {
            description: None,
            dependencies: Vec::new(),
            interactive: false,
            action: Arc::new(action),
            name: OnceLock::new(),
        }))
    }

    /// A task that does nothing itself, useful as an aggregation point.
    pub fn empty() -> Task {
        Task::new(|| None)
    }

    /// Returns this task extended with `dependencies`, which run before it.
    /// Interactive tasks cannot be depended on.
    pub fn depends_on(&self, dependencies: &[Task]) -> Result<Task> {
        for dependency in dependencies {
            if dependency.interactive() {
                return Err(KilnError::msg(format!(
                    "interactive task {} cannot be a dependency",
                    dependency.label()
                )));
            }
        }
        let mut all = self.0.dependencies.clone();
        all.extend_from_slice(dependencies);
        Ok(Task(Arc::new(TaskInner {
            description: self.0.description.clone(),
            dependencies: all,
            interactive: self.0.interactive,
            action: self.0.action.clone(),
            name: OnceLock::new(),
        })))
    }

    pub fn described_as(&self, description: impl Into<String>) -> Task {
        Task(Arc::new(TaskInner {
            description: Some(description.into()),
            dependencies: self.0.dependencies.clone(),
            interactive: self.0.interactive,
            action: self.0.action.clone(),
            name: OnceLock::new(),
        }))
    }

    /// Marks the task interactive: on a multi-project invocation its own
    /// action runs only on the current project.
    pub fn interactive(&self) -> bool {
        self.0.interactive
    }

    pub fn set_interactive(&self) -> Task {
        Task(Arc::new(TaskInner {
            description: self.0.description.clone(),
            dependencies: self.0.dependencies.clone(),
            interactive: true,
            action: self.0.action.clone(),
            name: OnceLock::new(),
        }))
    }

    /// Sequences two tasks: dependencies are concatenated, the combination
    /// is interactive iff either is, and the right action runs only when the
    /// left one succeeds.
    pub fn and_then(&self, other: &Task) -> Task {
        let left = self.0.action.clone();
        let right = other.0.action.clone();
        let mut dependencies = self.0.dependencies.clone();
        dependencies.extend_from_slice(&other.0.dependencies);
        Task(Arc::new(TaskInner {
            description: self.0.description.clone(),
            dependencies,
            interactive: self.0.interactive || other.0.interactive,
            action: Arc::new(move || left().or_else(|| right())),
            name: OnceLock::new(),
        }))
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    pub fn dependency_list(&self) -> &[Task] {
        &self.0.dependencies
    }

    /// Binds the published name; first binding wins.
    pub fn bind_name(&self, name: &str) {
        let _ = self.0.name.set(name.to_string());
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.get().map(String::as_str)
    }

    fn label(&self) -> String {
        self.name().map(str::to_string).unwrap_or_else(|| "<anonymous>".to_string())
    }

    /// Runs only this task's action.
    pub fn invoke(&self) -> ActionResult {
        (self.0.action)()
    }

    /// Runs the task tree sequentially in topological order, stopping at the
    /// first error.
    pub fn run(&self) -> ActionResult {
        for task in graph::topological_sort(self) {
            if let Some(error) = task.invoke() {
                return Some(error);
            }
        }
        None
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Task {}
impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state)
    }
}

impl Dag for Task {
    fn dependencies(&self) -> Vec<Task> {
        self.0.dependencies.clone()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name())
            .field("interactive", &self.0.interactive)
            .field("dependencies", &self.0.dependencies.len())
            .finish()
    }
}

/// Transforms a registration identifier like `testCompile` into the
/// published action name `test-compile`.
pub fn kebab_case(identifier: &str) -> String {
    let mut out = String::with_capacity(identifier.len() + 4);
    for ch in identifier.chars() {
        if ch.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('-');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
