use camino::Utf8PathBuf;
use thiserror::Error;

use crate::engine::{TaskName, TaskRef};
use crate::provider::{Conditions, ProviderInfo};

pub use anyhow::Error as RuntimeError;

/// Rejected edits to a [`Graph`](crate::Graph).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task '{task}' cannot depend on itself")]
    SelfDependency { task: TaskName },

    #[error("task '{task}' cannot depend on {dependency}, which belongs to another graph")]
    CrossGraph { task: TaskName, dependency: TaskRef },

    #[error("task handle does not belong to graph '{graph}'")]
    ForeignTask { graph: TaskName },

    #[error("adding '{dependency}' as a dependency of '{task}' would create a cycle")]
    Cycle { task: TaskName, dependency: TaskName },
}

#[derive(Debug, Error)]
pub enum StalenessError {
    #[error("input file '{path}' is missing:\n{source}")]
    InputMissing {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't create output directory '{path}':\n{source}")]
    OutputDirectory {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("unable to find {kind} matching {query}")]
    NotFound {
        kind: String,
        query: Conditions,
        candidates: Vec<ProviderInfo>,
    },

    #[error("multiple {kind}s found matching {query}")]
    Ambiguous {
        kind: String,
        query: Conditions,
        matches: Vec<ProviderInfo>,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("couldn't access session file:\n{0}")]
    Io(#[from] std::io::Error),

    #[error("couldn't encode session file:\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("couldn't decode session file:\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("session file has version {found}, expected {expected}")]
    Version { found: u32, expected: u32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unable to find {kind} '{name}'")]
    NotFound {
        kind: &'static str,
        name: String,
        available: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("couldn't spawn process:\n{0}")]
    Spawn(#[from] std::io::Error),

    #[error("job panicked: {0}")]
    JobPanicked(String),
}

/// Violations caught by a flux running in debug mode.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FluxError {
    #[error("step continued {count} times, expected exactly once")]
    ContinuedTwice { count: u32 },

    #[error("steps were pushed after the step had already continued")]
    PushedAfterContinue,

    #[error("time budget was changed after the step had already continued")]
    BudgetAfterContinue,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(#[from] camino::FromPathBufError),

    #[error("'{path}' is not inside '{base}'")]
    OutsideBase { path: Utf8PathBuf, base: Utf8PathBuf },
}
