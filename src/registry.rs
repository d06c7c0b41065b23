use std::collections::BTreeMap;

use crate::diagnostic::Diagnostic;
use crate::error::RegistryError;

/// Map from a kind tag to a value, typically a factory.
///
/// Replaces type-level registration: whoever needs to construct tasks from
/// their tag holds a registry and passes it along explicitly.
#[derive(Debug, Clone)]
pub struct Registry<T> {
    kind: &'static str,
    map: BTreeMap<String, T>,
}

impl<T> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            map: BTreeMap::new(),
        }
    }

    /// Registers `value` under each of `names`, replacing earlier entries.
    pub fn register<I, S>(&mut self, names: I, value: T)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        T: Clone,
    {
        for name in names {
            self.map.insert(name.into(), value.clone());
        }
    }

    pub fn unregister<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.map.remove(name.as_ref());
        }
    }

    pub fn find(&self, name: &str) -> Option<&T> {
        self.map.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn validate(&self, name: &str) -> Result<&T, RegistryError> {
        self.map.get(name).ok_or_else(|| RegistryError::NotFound {
            kind: self.kind,
            name: name.to_string(),
            available: self.map.keys().cloned().collect(),
        })
    }
}

impl From<&RegistryError> for Diagnostic {
    fn from(err: &RegistryError) -> Self {
        let RegistryError::NotFound {
            kind,
            name,
            available,
        } = err;

        let mut diagnostic = Diagnostic::error(err.to_string())
            .with_note(Diagnostic::note(format!("while looking for {kind}: {name}")));
        for found in available {
            diagnostic = diagnostic.with_note(Diagnostic::note(format!("found: {found}")));
        }
        diagnostic
    }
}
