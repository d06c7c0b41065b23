use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// A single value inside [`KeyMaterial`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    List(Vec<KeyValue>),
}

impl KeyValue {
    // Tag byte, then a length-prefixed payload, so that no two distinct
    // values share an encoding.
    fn feed(&self, hasher: &mut blake3::Hasher) {
        match self {
            KeyValue::Str(s) => {
                hasher.update(&[0x01]);
                feed_bytes(hasher, s.as_bytes());
            }
            KeyValue::Int(i) => {
                hasher.update(&[0x02]);
                hasher.update(&i.to_le_bytes());
            }
            KeyValue::Bool(b) => {
                hasher.update(&[0x03, *b as u8]);
            }
            KeyValue::Bytes(bytes) => {
                hasher.update(&[0x04]);
                feed_bytes(hasher, bytes);
            }
            KeyValue::List(items) => {
                hasher.update(&[0x05]);
                hasher.update(&(items.len() as u64).to_le_bytes());
                for item in items {
                    item.feed(hasher);
                }
            }
        }
    }
}

fn feed_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Str(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Str(value)
    }
}

impl From<&String> for KeyValue {
    fn from(value: &String) -> Self {
        KeyValue::Str(value.clone())
    }
}

impl From<&Utf8Path> for KeyValue {
    fn from(value: &Utf8Path) -> Self {
        KeyValue::Str(value.to_string())
    }
}

impl From<Utf8PathBuf> for KeyValue {
    fn from(value: Utf8PathBuf) -> Self {
        KeyValue::Str(value.into_string())
    }
}

impl From<&Utf8PathBuf> for KeyValue {
    fn from(value: &Utf8PathBuf) -> Self {
        KeyValue::Str(value.to_string())
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<u32> for KeyValue {
    fn from(value: u32) -> Self {
        KeyValue::Int(value.into())
    }
}

impl From<bool> for KeyValue {
    fn from(value: bool) -> Self {
        KeyValue::Bool(value)
    }
}

impl<T> From<Vec<T>> for KeyValue
where
    T: Into<KeyValue>,
{
    fn from(value: Vec<T>) -> Self {
        KeyValue::List(value.into_iter().map(Into::into).collect())
    }
}

/// The structured value a task's identity is derived from: a kind tag plus an
/// explicitly ordered list of named fields.
///
/// Two tasks with equal key material share an identity, and therefore share
/// their persisted [`SessionRecord`](crate::SessionRecord)s, across process
/// restarts. Field order is significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    kind: String,
    fields: Vec<(String, KeyValue)>,
}

impl KeyMaterial {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn identity(&self) -> Identity {
        let mut hasher = blake3::Hasher::new();
        feed_bytes(&mut hasher, self.kind.as_bytes());
        hasher.update(&(self.fields.len() as u64).to_le_bytes());
        for (name, value) in &self.fields {
            feed_bytes(&mut hasher, name.as_bytes());
            value.feed(&mut hasher);
        }

        let hash = Hash32::from(hasher.finalize());
        Identity(format!("{}-{}", self.kind, hash.to_hex()))
    }
}

/// Stable, persisted identifier of a task, derived from its [`KeyMaterial`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch, never zero.
///
/// Zero is reserved in [`SessionRecord::last_success_time`](crate::SessionRecord)
/// to mean "the last run failed".
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
        .max(1)
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}
