//! Toolchain resolution.
//!
//! A [`Provider`] advertises a capability through a set of [`Conditions`].
//! Tasks describe what they need with a query, and the [`ProviderRegistry`]
//! answers with exactly one provider or a diagnostic explaining what was
//! available.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::diagnostic::Diagnostic;
use crate::error::ProviderError;

/// Ordered string map describing a provider, or what a task looks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(BTreeMap<String, String>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every entry of `query` is present here with the same value.
    pub fn satisfies(&self, query: &Conditions) -> bool {
        query
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Conditions
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(entries: [(K, V); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Display for Conditions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

/// A registered capability: a compiler, a linker, a packager...
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn conditions(&self) -> &Conditions;

    fn is_compatible(&self, query: &Conditions) -> bool {
        self.conditions().satisfies(query)
    }

    /// How well the provider fits `query`, zero meaning not at all.
    fn compatibility(&self, query: &Conditions) -> u32 {
        if self.is_compatible(query) {
            1 + query.len() as u32
        } else {
            0
        }
    }

    /// Command invoking the provided tool with `args`.
    fn command(&self, args: &[String]) -> Command;
}

/// A provider backed by an executable.
#[derive(Debug, Clone)]
pub struct ProcessProvider {
    name: String,
    conditions: Conditions,
    bin: Utf8PathBuf,
    args: Vec<String>,
    path: Vec<Utf8PathBuf>,
}

impl ProcessProvider {
    pub fn new(
        name: impl Into<String>,
        bin: impl Into<Utf8PathBuf>,
        conditions: Conditions,
    ) -> Self {
        Self {
            name: name.into(),
            conditions,
            bin: bin.into(),
            args: Vec::new(),
            path: Vec::new(),
        }
    }

    /// Arguments always passed before the caller's arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Directories prepended to `PATH` for the spawned process.
    pub fn with_path(mut self, dirs: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        self.path.extend(dirs.into_iter().map(Into::into));
        self
    }

    pub fn bin(&self) -> &Utf8PathBuf {
        &self.bin
    }
}

impl Provider for ProcessProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(self.bin.as_std_path());
        command.args(&self.args).args(args);

        if !self.path.is_empty() {
            let inherited = std::env::var_os("PATH").unwrap_or_default();
            let dirs = self
                .path
                .iter()
                .map(|dir| dir.as_std_path().to_path_buf())
                .chain(std::env::split_paths(&inherited));
            if let Ok(joined) = std::env::join_paths(dirs) {
                command.env("PATH", joined);
            }
        }

        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderId(u64);

/// Summary of a registered provider, as reported in resolution errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: ProviderId,
    pub name: String,
    pub conditions: Conditions,
}

type Loader = Box<dyn FnOnce(&ProviderRegistry) + Send>;

/// Loaders not yet run, and the thread currently running them.
#[derive(Default)]
struct Loading {
    pending: Vec<Loader>,
    owner: Option<ThreadId>,
}

/// Releases the loading slot even when a loader panics.
struct LoadGuard<'a>(&'a ProviderRegistry);

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.loading().owner = None;
        self.0.loaded.notify_all();
    }
}

#[derive(Default)]
struct Entries {
    next: u64,
    providers: HashMap<ProviderId, Arc<dyn Provider>>,
}

impl Entries {
    fn sorted(&self) -> Vec<(ProviderId, Arc<dyn Provider>)> {
        let mut all: Vec<_> = self
            .providers
            .iter()
            .map(|(id, p)| (*id, Arc::clone(p)))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}

/// Set of providers of one kind, shared by everything that resolves tools.
///
/// The registry is an ordinary value: build one per kind, fill it at startup
/// or through [`ProviderRegistry::add_loader`], and hand it to the
/// [`Runner`](crate::Runner).
pub struct ProviderRegistry {
    kind: &'static str,
    entries: RwLock<Entries>,
    loading: Mutex<Loading>,
    loaded: Condvar,
}

impl ProviderRegistry {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(Entries::default()),
            loading: Mutex::default(),
            loaded: Condvar::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn register(&self, provider: impl Provider + 'static) -> ProviderId {
        self.register_arc(Arc::new(provider))
    }

    pub fn register_arc(&self, provider: Arc<dyn Provider>) -> ProviderId {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let id = ProviderId(entries.next);
        entries.next += 1;
        tracing::debug!(kind = self.kind, name = provider.name(), "registered provider");
        entries.providers.insert(id, provider);
        id
    }

    pub fn unregister(&self, id: ProviderId) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .providers
            .remove(&id)
            .is_some()
    }

    /// Defers registration until the first lookup. Each loader runs at most
    /// once, and lookups from other threads wait until it is done.
    pub fn add_loader(&self, loader: impl FnOnce(&ProviderRegistry) + Send + 'static) {
        self.loading().pending.push(Box::new(loader));
    }

    fn loading(&self) -> MutexGuard<'_, Loading> {
        self.loading.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_loaded(&self) {
        let me = thread::current().id();
        let mut loading = self.loading();
        loop {
            match loading.owner {
                // A loader looking providers up sees what is registered so far.
                Some(owner) if owner == me => return,
                Some(_) => {
                    loading = self
                        .loaded
                        .wait(loading)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None if loading.pending.is_empty() => return,
                None => {
                    let loaders = std::mem::take(&mut loading.pending);
                    loading.owner = Some(me);
                    drop(loading);

                    let guard = LoadGuard(self);
                    for loader in loaders {
                        loader(self);
                    }
                    drop(guard);

                    loading = self.loading();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ensure_loaded();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .providers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.ensure_loaded();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .sorted()
            .into_iter()
            .map(|(id, p)| info(id, p.as_ref()))
            .collect()
    }

    /// Every provider compatible with `query`, in registration order.
    pub fn find(&self, query: &Conditions) -> Vec<Arc<dyn Provider>> {
        self.find_with_ids(query).into_iter().map(|(_, p)| p).collect()
    }

    fn find_with_ids(&self, query: &Conditions) -> Vec<(ProviderId, Arc<dyn Provider>)> {
        self.ensure_loaded();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .sorted()
            .into_iter()
            .filter(|(_, p)| p.is_compatible(query))
            .collect()
    }

    /// The provider with the highest compatibility, earliest registration
    /// winning ties.
    pub fn find_best(&self, query: &Conditions) -> Option<Arc<dyn Provider>> {
        self.ensure_loaded();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut best: Option<(u32, Arc<dyn Provider>)> = None;
        for (_, provider) in entries.sorted() {
            let score = provider.compatibility(query);
            if score > 0 && best.as_ref().is_none_or(|(top, _)| score > *top) {
                best = Some((score, provider));
            }
        }
        best.map(|(_, provider)| provider)
    }

    /// Resolves `query` to exactly one provider.
    ///
    /// Zero or several matches are errors. An ambiguous query is never
    /// settled by picking one of the matches.
    pub fn validate(&self, query: &Conditions) -> Result<Arc<dyn Provider>, ProviderError> {
        let mut found = self.find_with_ids(query);
        match found.len() {
            1 => Ok(found.remove(0).1),
            0 => Err(ProviderError::NotFound {
                kind: self.kind.to_string(),
                query: query.clone(),
                candidates: self.list(),
            }),
            _ => Err(ProviderError::Ambiguous {
                kind: self.kind.to_string(),
                query: query.clone(),
                matches: found
                    .iter()
                    .map(|(id, p)| info(*id, p.as_ref()))
                    .collect(),
            }),
        }
    }

    /// Like [`ProviderRegistry::validate`], but settles ambiguity by
    /// compatibility score.
    pub fn validate_best(&self, query: &Conditions) -> Result<Arc<dyn Provider>, ProviderError> {
        self.find_best(query).ok_or_else(|| ProviderError::NotFound {
            kind: self.kind.to_string(),
            query: query.clone(),
            candidates: self.list(),
        })
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

fn info(id: ProviderId, provider: &dyn Provider) -> ProviderInfo {
    ProviderInfo {
        id,
        name: provider.name().to_string(),
        conditions: provider.conditions().clone(),
    }
}

impl From<&ProviderError> for Diagnostic {
    fn from(err: &ProviderError) -> Self {
        let (kind, query, listed) = match err {
            ProviderError::NotFound {
                kind,
                query,
                candidates,
            } => (kind, query, candidates),
            ProviderError::Ambiguous {
                kind,
                query,
                matches,
            } => (kind, query, matches),
        };

        let mut diagnostic = Diagnostic::error(err.to_string())
            .with_note(Diagnostic::note(format!("while looking for {kind}: {query}")));
        for provider in listed {
            diagnostic = diagnostic.with_note(Diagnostic::note(format!(
                "found: {} {}",
                provider.name, provider.conditions
            )));
        }
        diagnostic
    }
}
