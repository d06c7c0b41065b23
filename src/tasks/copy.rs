use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::core::{KeyMaterial, KeyValue};
use crate::diagnostic::Diagnostic;
use crate::engine::{Files, Step, StepContext, Task, TaskName};
use crate::error::{ReactorError, TaskError};
use crate::flux::{Job, join_jobs};

/// Copies files, each on a worker thread.
#[derive(Debug, Clone)]
pub struct CopyTask {
    name: String,
    pairs: Vec<(Utf8PathBuf, Utf8PathBuf)>,
}

impl CopyTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pairs: Vec::new(),
        }
    }

    pub fn file(mut self, from: impl Into<Utf8PathBuf>, to: impl Into<Utf8PathBuf>) -> Self {
        self.pairs.push((from.into(), to.into()));
        self
    }

    /// Adds every file under `base` matching `pattern`, mirrored into `dest`.
    ///
    /// The pattern is expanded right away, so files appearing later are not
    /// picked up.
    pub fn glob(
        mut self,
        base: impl AsRef<Utf8Path>,
        pattern: &str,
        dest: impl AsRef<Utf8Path>,
    ) -> Result<Self, TaskError> {
        let base = base.as_ref();
        let dest = dest.as_ref();

        let mut found = Vec::new();
        for entry in glob::glob(base.join(pattern).as_str())? {
            let path = Utf8PathBuf::try_from(entry?)?;
            if path.is_dir() {
                continue;
            }
            let relative = path
                .strip_prefix(base)
                .map_err(|_| TaskError::OutsideBase {
                    path: path.clone(),
                    base: base.to_path_buf(),
                })?
                .to_path_buf();
            found.push((path, dest.join(relative)));
        }

        found.sort();
        self.pairs.extend(found);
        Ok(self)
    }

    pub fn pairs(&self) -> &[(Utf8PathBuf, Utf8PathBuf)] {
        &self.pairs
    }
}

type CopyResult = Result<io::Result<u64>, ReactorError>;

fn copy(from: &Utf8Path, to: &Utf8Path) -> io::Result<u64> {
    if let Some(parent) = to.parent().filter(|p| !p.as_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)
}

impl Task for CopyTask {
    fn name(&self) -> TaskName {
        TaskName::new("copy", &self.name)
    }

    fn key(&self) -> Option<KeyMaterial> {
        let pairs: Vec<KeyValue> = self
            .pairs
            .iter()
            .map(|(from, to)| KeyValue::List(vec![from.into(), to.into()]))
            .collect();

        Some(
            KeyMaterial::new("copy")
                .field("name", &self.name)
                .field("pairs", pairs),
        )
    }

    fn files(&self) -> Files {
        self.pairs
            .iter()
            .fold(Files::new(), |files, (from, to)| files.input(from.clone()).output(to.clone()))
    }

    fn run(&self, step: &Step) {
        let jobs = self
            .pairs
            .iter()
            .cloned()
            .map(|(from, to)| Box::new(move || copy(&from, &to)) as Job<io::Result<u64>>)
            .collect();

        let pairs = self.pairs.clone();
        let collect = move |ctx: &mut StepContext, results: Vec<CopyResult>| {
            for ((from, to), result) in pairs.iter().zip(results) {
                match result {
                    Ok(Ok(bytes)) => {
                        ctx.reporter.log(format!("copied {from} -> {to} ({bytes} bytes)"));
                    }
                    Ok(Err(e)) => ctx.reporter.diagnostic(
                        Diagnostic::error(format!("couldn't copy to '{to}': {e}"))
                            .with_path(from.clone()),
                    ),
                    Err(e) => ctx.reporter.error(e),
                }
            }
        };

        step.set_first_elements([join_jobs(&step.reactor(), jobs, collect)]);
        step.succeed();
    }
}

#[derive(Deserialize)]
struct GlobParams {
    base: Utf8PathBuf,
    pattern: String,
    dest: Utf8PathBuf,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct Params {
    #[serde(default)]
    files: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    #[serde(default)]
    globs: Vec<GlobParams>,
}

impl Params {
    pub(super) fn build(self, name: &str) -> Result<CopyTask, TaskError> {
        let mut task = CopyTask::new(name);
        for (from, to) in self.files {
            task = task.file(from, to);
        }
        for glob in self.globs {
            task = task.glob(&glob.base, &glob.pattern, &glob.dest)?;
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::engine::{Graph, Runner};

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        (tmp, root)
    }

    #[test]
    fn test_glob_mirrors_tree() {
        let (_tmp, root) = tempdir();
        fs::create_dir_all(root.join("static/css")).unwrap();
        fs::write(root.join("static/a.txt"), "a").unwrap();
        fs::write(root.join("static/css/b.css"), "b").unwrap();

        let task = CopyTask::new("static")
            .glob(root.join("static"), "**/*", root.join("dist"))
            .unwrap();

        assert_eq!(
            task.pairs(),
            [
                (root.join("static/a.txt"), root.join("dist/a.txt")),
                (root.join("static/css/b.css"), root.join("dist/css/b.css")),
            ]
        );
    }

    #[test]
    fn test_bad_pattern() {
        assert!(matches!(
            CopyTask::new("bad").glob("src", "[", "dist"),
            Err(TaskError::GlobPattern(_))
        ));
    }

    #[test]
    fn test_copies_files() {
        let (_tmp, root) = tempdir();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        fs::write(root.join("b.txt"), "beta").unwrap();

        let mut graph = Graph::new("root");
        graph.add_task(
            CopyTask::new("assets")
                .file(root.join("a.txt"), root.join("out/a.txt"))
                .file(root.join("b.txt"), root.join("out/nested/b.txt")),
        );
        let report = Runner::new("build").run(&Rc::new(graph));

        assert!(report.is_success());
        assert_eq!(fs::read_to_string(root.join("out/a.txt")).unwrap(), "alpha");
        assert_eq!(fs::read_to_string(root.join("out/nested/b.txt")).unwrap(), "beta");
    }

    #[test]
    fn test_missing_source_fails() {
        let (_tmp, root) = tempdir();

        let mut graph = Graph::new("root");
        let task = CopyTask::new("assets").file(root.join("gone.txt"), root.join("out/gone.txt"));
        graph.add_task(task);
        let report = Runner::new("build").run(&Rc::new(graph));

        assert_eq!(report.error_count, 1);
        assert_eq!(report.diagnostics[0].path, Some(root.join("gone.txt")));
    }

    #[test]
    fn test_key_depends_on_pairs() {
        let a = CopyTask::new("x").file("a", "b").key().unwrap().identity();
        let b = CopyTask::new("x").file("a", "c").key().unwrap().identity();
        assert_ne!(a, b);
    }
}
