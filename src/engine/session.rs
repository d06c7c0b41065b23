//! Per-target persistent results of previous runs.
//!
//! The session file is a gzip-compressed CBOR document mapping task
//! identities to one [`SessionRecord`] per action. It is read once, lazily,
//! when the first task of a run executes and written once when the run ends.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::core::Identity;
use crate::diagnostic::Diagnostic;
use crate::error::StorageError;

const SESSION_VERSION: u32 = 1;

/// Outcome of the latest run of one task for one action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub logs: String,
    pub diagnostics: Vec<Diagnostic>,
    /// Milliseconds since the Unix epoch.
    pub last_run_start_time: u64,
    pub last_run_end_time: u64,
    /// Zero when the last run failed, otherwise equal to `last_run_end_time`.
    pub last_success_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionMap {
    tasks: BTreeMap<Identity, BTreeMap<String, SessionRecord>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &Identity, action: &str) -> Option<&SessionRecord> {
        self.tasks.get(identity)?.get(action)
    }

    pub fn insert(&mut self, identity: Identity, action: &str, record: SessionRecord) {
        self.tasks
            .entry(identity)
            .or_default()
            .insert(action.to_string(), record);
    }

    /// Forgets every action recorded for `identity`.
    pub fn remove(&mut self, identity: &Identity) -> bool {
        self.tasks.remove(identity).is_some()
    }

    /// Number of identities with at least one record.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.tasks.keys()
    }
}

/// Where session maps are loaded from and saved to.
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> Result<SessionMap, StorageError>;

    fn save(&self, map: &SessionMap) -> Result<(), StorageError>;
}

/// Keeps nothing. Every identified task looks like it never ran.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStorage;

impl SessionStorage for NoStorage {
    fn load(&self) -> Result<SessionMap, StorageError> {
        Ok(SessionMap::default())
    }

    fn save(&self, _: &SessionMap) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Keeps the map in memory, surviving across runners sharing the storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: Mutex<SessionMap>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionMap {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self) -> Result<SessionMap, StorageError> {
        Ok(self.snapshot())
    }

    fn save(&self, map: &SessionMap) -> Result<(), StorageError> {
        *self.map.lock().unwrap_or_else(PoisonError::into_inner) = map.clone();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SessionFile<T> {
    version: u32,
    tasks: T,
}

/// Compressed session file on disk.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: Utf8PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Storage for `target` inside a build directory.
    pub fn for_target(build_dir: impl AsRef<Utf8Path>, target: &str) -> Self {
        Self::new(build_dir.as_ref().join(format!("{target}.session")))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl SessionStorage for FileStorage {
    /// A missing file is an empty map.
    fn load(&self) -> Result<SessionMap, StorageError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionMap::default()),
            Err(e) => return Err(e.into()),
        };

        let reader = BufReader::new(GzDecoder::new(file));
        let file: SessionFile<SessionMap> = ciborium::from_reader(reader)?;
        if file.version != SESSION_VERSION {
            return Err(StorageError::Version {
                found: file.version,
                expected: SESSION_VERSION,
            });
        }

        Ok(file.tasks)
    }

    /// Writes to a sibling temporary file first, then renames it over the
    /// previous session, so a crash never leaves a truncated file behind.
    fn save(&self, map: &SessionMap) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("session.tmp");
        {
            let file = fs::File::create(&tmp)?;
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            ciborium::into_writer(
                &SessionFile {
                    version: SESSION_VERSION,
                    tasks: map,
                },
                &mut encoder,
            )?;
            encoder.finish()?.flush()?;
        }
        fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path, records = map.len(), "saved session");
        Ok(())
    }
}
