mod graph;
mod runner;
mod session;
mod staleness;
mod step;

use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind;

use crate::core::KeyMaterial;
use crate::diagnostic::Diagnostic;
use crate::error::StalenessError;

pub use crate::engine::graph::{Graph, GraphId, TaskRef};
pub(crate) use crate::engine::graph::Unit;
pub use crate::engine::runner::{RunOptions, RunReport, Runner, TaskEvent, TaskExecution};
pub use crate::engine::session::{
    FileStorage, MemoryStorage, NoStorage, SessionMap, SessionRecord, SessionStorage,
};
pub use crate::engine::staleness::{Check, Files, StaleReason, Staleness, check};
pub use crate::engine::step::{Step, StepContext};

/// Kind tag and display name of a task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskName {
    pub kind: String,
    pub name: String,
}

impl TaskName {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl Display for TaskName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Lifecycle of a task within one run. Only the runner moves tasks between
/// states, and [`Graph::reset`] moves them back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[default]
    Waiting,
    Running,
    Done,
}

/// What a run asks every task to do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Configure,
    Build,
    Clean,
    /// Any other action. Tasks report it as unsupported and carry on.
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Configure => "configure",
            Action::Build => "build",
            Action::Clean => "clean",
            Action::Other(name) => name,
        }
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        match name {
            "configure" => Action::Configure,
            "build" => Action::Build,
            "clean" => Action::Clean,
            other => Action::Other(other.to_string()),
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in a [`Graph`].
///
/// Action hooks receive a [`Step`] and must end it with exactly one call to
/// [`Step::succeed`] or [`Step::fail`], either before returning or later from
/// a callback. Pushing further steps onto the `Step` before that is allowed.
pub trait Task {
    fn name(&self) -> TaskName;

    /// Key material of the task's identity. Tasks without one are never
    /// persisted and always run.
    fn key(&self) -> Option<KeyMaterial> {
        None
    }

    fn files(&self) -> Files {
        Files::default()
    }

    /// Decides whether a build has to run the task, given its last record.
    fn staleness(&self, record: Option<&SessionRecord>) -> Result<Check, StalenessError> {
        check(&self.files(), record)
    }

    /// The `build` action.
    fn run(&self, step: &Step);

    fn configure(&self, step: &Step) {
        step.succeed();
    }

    /// Removes the declared outputs. Outputs that are already gone are fine.
    fn clean(&self, step: &Step) {
        remove_outputs(&self.files(), step);
        step.succeed();
    }
}

pub(crate) fn remove_outputs(files: &Files, step: &Step) {
    for output in &files.outputs {
        match fs::remove_file(output) {
            Ok(()) => step.log(format!("removed {output}")),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => step.diagnostic(
                Diagnostic::error(format!("couldn't remove output: {e}")).with_path(output.clone()),
            ),
        }
    }
}
