//! Foundation tasks, and the factories building them from a kind tag.
mod copy;
mod process;
mod write;

use std::rc::Rc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use self::copy::CopyTask;
pub use self::process::ProcessTask;
pub use self::write::WriteFileTask;

use crate::engine::Task;
use crate::registry::Registry;

/// Builds a task named `name` out of its JSON parameters.
pub type TaskFactory = Rc<dyn Fn(&str, &Value) -> anyhow::Result<Box<dyn Task>>>;

fn params<P: DeserializeOwned>(kind: &str, name: &str, value: &Value) -> anyhow::Result<P> {
    P::deserialize(value).with_context(|| format!("invalid parameters for {kind} task '{name}'"))
}

fn build_copy(name: &str, value: &Value) -> anyhow::Result<Box<dyn Task>> {
    let task = params::<copy::Params>("copy", name, value)?.build(name)?;
    Ok(Box::new(task))
}

fn build_write(name: &str, value: &Value) -> anyhow::Result<Box<dyn Task>> {
    let task = params::<write::Params>("write-file", name, value)?.build();
    Ok(Box::new(task))
}

fn build_process(name: &str, value: &Value) -> anyhow::Result<Box<dyn Task>> {
    let task = params::<process::Params>("process", name, value)?.build(name);
    Ok(Box::new(task))
}

/// Registry holding the factories of every built-in task kind.
pub fn factories() -> Registry<TaskFactory> {
    let mut registry: Registry<TaskFactory> = Registry::new("task kind");
    registry.register(["copy"], Rc::new(build_copy));
    registry.register(["write-file", "write"], Rc::new(build_write));
    registry.register(["process", "run"], Rc::new(build_process));
    registry
}

/// Looks up `kind` in `registry` and builds the task.
pub fn create(
    registry: &Registry<TaskFactory>,
    kind: &str,
    name: &str,
    params: &Value,
) -> anyhow::Result<Box<dyn Task>> {
    let factory = registry.validate(kind)?;
    factory(name, params)
}
