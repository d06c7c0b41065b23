use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::core::{KeyMaterial, KeyValue};
use crate::diagnostic::Diagnostic;
use crate::engine::{Files, Step, Task, TaskName};
use crate::provider::Conditions;

/// Runs the tool of whichever provider matches a query.
///
/// Resolution happens when the task runs, so the task fails if the query
/// matches no provider or more than one.
#[derive(Debug, Clone)]
pub struct ProcessTask {
    name: String,
    kind: String,
    query: Conditions,
    args: Vec<String>,
    files: Files,
    cwd: Option<Utf8PathBuf>,
}

impl ProcessTask {
    /// A task invoking a provider of `kind` satisfying `query`.
    pub fn new(name: impl Into<String>, kind: impl Into<String>, query: Conditions) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            query,
            args: Vec::new(),
            files: Files::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.files = self.files.input(path);
        self
    }

    pub fn optional_input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.files = self.files.optional_input(path);
        self
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.files = self.files.output(path);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl Task for ProcessTask {
    fn name(&self) -> TaskName {
        TaskName::new("process", &self.name)
    }

    fn key(&self) -> Option<KeyMaterial> {
        let query: Vec<KeyValue> = self
            .query
            .iter()
            .map(|(key, value)| KeyValue::List(vec![key.into(), value.into()]))
            .collect();
        let cwd: Vec<KeyValue> = self.cwd.iter().map(KeyValue::from).collect();

        Some(
            KeyMaterial::new("process")
                .field("name", &self.name)
                .field("kind", &self.kind)
                .field("query", query)
                .field("args", self.args.clone())
                .field("inputs", self.files.inputs.clone())
                .field("optional_inputs", self.files.optional_inputs.clone())
                .field("outputs", self.files.outputs.clone())
                .field("cwd", cwd),
        )
    }

    fn files(&self) -> Files {
        self.files.clone()
    }

    fn run(&self, step: &Step) {
        let Some(provider) = step.resolve(&self.kind, &self.query) else {
            step.fail(1);
            return;
        };

        let mut command = provider.command(&self.args);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        let tool = provider.name().to_string();
        step.spawn(command, move |step, output| {
            if output.success {
                step.succeed();
                return;
            }

            let status = match output.code {
                Some(code) => format!("exit code {code}"),
                None => "a signal".to_string(),
            };
            step.diagnostic(
                Diagnostic::error(format!("{tool} failed with {status}"))
                    .with_category(tool.clone()),
            );
            step.fail(1);
        });
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct Params {
    provider: String,
    #[serde(default)]
    query: Conditions,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    inputs: Vec<Utf8PathBuf>,
    #[serde(default)]
    optional_inputs: Vec<Utf8PathBuf>,
    #[serde(default)]
    outputs: Vec<Utf8PathBuf>,
    #[serde(default)]
    cwd: Option<Utf8PathBuf>,
}

impl Params {
    pub(super) fn build(self, name: &str) -> ProcessTask {
        let mut task = ProcessTask::new(name, self.provider, self.query).args(self.args);
        task.files.inputs = self.inputs;
        task.files.optional_inputs = self.optional_inputs;
        task.files.outputs = self.outputs;
        task.cwd = self.cwd;
        task
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::rc::Rc;
    use std::sync::Arc;

    use super::*;
    use crate::engine::{Graph, RunOptions, Runner};
    use crate::provider::{ProcessProvider, ProviderRegistry};

    fn shells() -> Arc<ProviderRegistry> {
        let registry = Arc::new(ProviderRegistry::new("shell"));
        let posix = Conditions::from([("shell", "posix")]);
        registry.register(ProcessProvider::new("sh", "sh", posix).with_args(["-c"]));
        registry
    }

    #[test]
    fn test_runs_resolved_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let out = root.join("out/hello.txt");

        let mut graph = Graph::new("root");
        graph.add_task(
            ProcessTask::new("hello", "shell", Conditions::from([("shell", "posix")]))
                .arg(format!("echo hello > {out}"))
                .output(out.clone()),
        );
        let report = Runner::new("build")
            .with_providers(shells())
            .run(&Rc::new(graph));

        assert!(report.is_success(), "{}", report.render_diagnostics());
        assert_eq!(fs::read_to_string(out).unwrap(), "hello\n");
    }

    #[test]
    fn test_nonzero_exit_fails_and_blocks_dependents() {
        let query = Conditions::from([("shell", "posix")]);
        let mut graph = Graph::new("root");
        let broken =
            graph.add_task(ProcessTask::new("broken", "shell", query.clone()).arg("exit 3"));
        let after = graph.add_task(ProcessTask::new("after", "shell", query.clone()).arg("true"));
        let other = graph.add_task(ProcessTask::new("other", "shell", query).arg("true"));
        graph.add_dependency(after, broken).unwrap();
        let graph = Rc::new(graph);

        let report = Runner::new("build")
            .with_options(RunOptions::default().max_processes(1))
            .with_providers(shells())
            .run(&graph);

        assert_eq!(report.error_count, 1);
        assert_eq!(report.diagnostics[0].msg, "sh failed with exit code 3");
        assert_eq!(report.blocked, [TaskName::new("process", "after")]);
        assert_eq!(graph.error_count(other), Some(0));
    }

    #[test]
    fn test_identity_separates_query_values() {
        let identity = |task: ProcessTask| task.key().unwrap().identity();

        let joined = ProcessTask::new("t", "cc", Conditions::from([("a", "1, b=2")]));
        let split = ProcessTask::new("t", "cc", Conditions::from([("a", "1"), ("b", "2")]));
        assert_ne!(identity(joined), identity(split));

        let here = ProcessTask::new("t", "cc", Conditions::new());
        assert_ne!(identity(here.clone()), identity(here.clone().current_dir("sub")));
        assert_ne!(identity(here.clone()), identity(here.optional_input("extra.h")));
    }

    #[test]
    fn test_params() {
        let params: Params = serde_json::from_value(serde_json::json!({
            "provider": "compiler",
            "query": { "compiler": "clang" },
            "args": ["-c", "main.c"],
            "inputs": ["main.c"],
            "outputs": ["main.o"],
        }))
        .unwrap();
        let task = params.build("main.o");

        assert_eq!(task.query.get("compiler"), Some("clang"));
        assert_eq!(task.files().outputs, [Utf8PathBuf::from("main.o")]);
        assert_eq!(task.args, ["-c", "main.c"]);
    }
}
