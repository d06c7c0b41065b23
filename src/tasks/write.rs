use std::fs;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::core::{Hash32, KeyMaterial};
use crate::diagnostic::Diagnostic;
use crate::engine::{Files, Step, Task, TaskName};

/// Writes fixed content to a file. Changing the content changes the task's
/// identity, so the file is rewritten.
#[derive(Debug, Clone)]
pub struct WriteFileTask {
    path: Utf8PathBuf,
    content: Vec<u8>,
}

impl WriteFileTask {
    pub fn new(path: impl Into<Utf8PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    fn digest(&self) -> Hash32 {
        blake3::hash(&self.content).into()
    }
}

impl Task for WriteFileTask {
    fn name(&self) -> TaskName {
        TaskName::new("write-file", self.path.as_str())
    }

    fn key(&self) -> Option<KeyMaterial> {
        Some(
            KeyMaterial::new("write-file")
                .field("path", &self.path)
                .field("content", self.digest().to_hex()),
        )
    }

    fn files(&self) -> Files {
        Files::new().output(self.path.clone())
    }

    fn run(&self, step: &Step) {
        match fs::write(&self.path, &self.content) {
            Ok(()) => {
                step.log(format!("wrote {} bytes to {}", self.content.len(), self.path));
                step.succeed();
            }
            Err(e) => {
                step.diagnostic(
                    Diagnostic::error(format!("couldn't write file: {e}"))
                        .with_path(self.path.clone()),
                );
                step.fail(1);
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct Params {
    path: Utf8PathBuf,
    content: String,
}

impl Params {
    pub(super) fn build(self) -> WriteFileTask {
        WriteFileTask::new(self.path, self.content)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;
    use crate::engine::{Graph, MemoryStorage, Runner, SessionStorage};

    #[test]
    fn test_changed_content_rebuilds() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());

        let build = |content: &str| {
            let mut graph = Graph::new("root");
            graph.add_task(WriteFileTask::new(root.join("gen/config.h"), content));
            Runner::new("build")
                .with_storage(Arc::clone(&storage))
                .run(&Rc::new(graph))
        };

        assert_eq!(build("#define A 1\n").ran.len(), 1);
        assert_eq!(build("#define A 1\n").ran.len(), 0);
        assert_eq!(build("#define A 2\n").ran.len(), 1);
        assert_eq!(
            fs::read_to_string(root.join("gen/config.h")).unwrap(),
            "#define A 2\n"
        );
    }

    #[test]
    fn test_identity_follows_content() {
        let a = WriteFileTask::new("out.txt", "a").key().unwrap().identity();
        let b = WriteFileTask::new("out.txt", "b").key().unwrap().identity();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("write-file-"));
    }
}
