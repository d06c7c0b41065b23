#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod diagnostic;
mod engine;
mod error;
pub mod flux;
#[cfg(feature = "logging")]
pub mod logging;
mod provider;
pub mod reactor;
mod registry;
pub mod tasks;

pub use crate::core::{Identity, KeyMaterial, KeyValue};
pub use crate::diagnostic::{Diagnostic, Reporter, Severity};
pub use crate::engine::{
    Action, Check, FileStorage, Files, Graph, GraphId, MemoryStorage, NoStorage, RunOptions,
    RunReport, Runner, SessionMap, SessionRecord, SessionStorage, StaleReason, Staleness, Step,
    StepContext, Task, TaskEvent, TaskExecution, TaskName, TaskRef, TaskState, check,
};
pub use crate::error::*;
pub use crate::flux::{Flux, FluxState};
pub use crate::provider::{
    Conditions, ProcessProvider, Provider, ProviderId, ProviderInfo, ProviderRegistry,
};
pub use crate::reactor::{ProcessOutput, Reactor};
pub use crate::registry::Registry;
