//! Decides whether a task has to run again.
//!
//! The decision is storage-driven: a task is fresh when its last recorded run
//! succeeded and every declared output still exists. File modification times
//! are never compared.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::diagnostic::Diagnostic;
use crate::engine::session::SessionRecord;
use crate::error::StalenessError;

/// Files a task declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Files {
    /// Must exist before the task runs.
    pub inputs: Vec<Utf8PathBuf>,
    /// Read when present. A missing one is only a warning.
    pub optional_inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
}

impl Files {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn optional_input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.optional_inputs.push(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.optional_inputs.is_empty() && self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NoRecord,
    NeverSucceeded,
    MissingOutput(Utf8PathBuf),
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::NoRecord => f.write_str("no previous run recorded"),
            StaleReason::NeverSucceeded => f.write_str("previous run failed"),
            StaleReason::MissingOutput(path) => write!(f, "output '{path}' is missing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale(StaleReason),
}

impl Staleness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Staleness::Fresh)
    }
}

/// Outcome of [`check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub staleness: Staleness,
    pub missing_optional: Vec<Utf8PathBuf>,
}

/// Stats every declared file and classifies the task.
///
/// Missing outputs get their parent directory created, so that the task can
/// write them. Missing inputs are fatal for the task. Inputs are checked even
/// when an output already made the task stale.
pub fn check(files: &Files, record: Option<&SessionRecord>) -> Result<Check, StalenessError> {
    let mut stale = None;

    for output in &files.outputs {
        if exists(output).is_some() {
            continue;
        }
        create_parent(output)?;
        stale.get_or_insert_with(|| StaleReason::MissingOutput(output.clone()));
    }

    for input in &files.inputs {
        if let Err(source) = fs::metadata(input) {
            return Err(StalenessError::InputMissing {
                path: input.clone(),
                source,
            });
        }
    }

    let missing_optional = files
        .optional_inputs
        .iter()
        .filter(|path| exists(path).is_none())
        .cloned()
        .collect();

    let stale = stale.or(match record {
        None => Some(StaleReason::NoRecord),
        Some(record) if record.last_success_time == 0 => Some(StaleReason::NeverSucceeded),
        Some(_) => None,
    });

    Ok(Check {
        staleness: stale.map_or(Staleness::Fresh, Staleness::Stale),
        missing_optional,
    })
}

fn exists(path: &Utf8Path) -> Option<fs::Metadata> {
    fs::metadata(path).ok()
}

fn create_parent(path: &Utf8Path) -> Result<(), StalenessError> {
    let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) else {
        return Ok(());
    };

    fs::create_dir_all(parent).map_err(|source| StalenessError::OutputDirectory {
        path: parent.to_path_buf(),
        source,
    })
}

impl From<&StalenessError> for Diagnostic {
    fn from(err: &StalenessError) -> Self {
        match err {
            StalenessError::InputMissing { path, source } => {
                Diagnostic::error(format!("input file is missing: {source}"))
                    .with_path(path.clone())
            }
            StalenessError::OutputDirectory { path, source } => {
                Diagnostic::error(format!("couldn't create output directory: {source}"))
                    .with_path(path.clone())
            }
        }
    }
}
