mod report;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Identity, now_millis, panic_message};
use crate::diagnostic::Diagnostic;
use crate::engine::{
    Action, Graph, NoStorage, SessionMap, SessionRecord, SessionStorage, Staleness, Step,
    StepContext, Task, TaskName, TaskState, Unit,
};
use crate::flux::{Barrier, FluxState, Once, Resolver, step};
use crate::provider::ProviderRegistry;
use crate::reactor::Reactor;

pub use report::{RunReport, TaskExecution};

static RUN_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("Error setting progress bar template")
});

/// Knobs of a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip the staleness check and run every task.
    pub full: bool,
    /// Check that every step continues exactly once.
    pub debug_flux: bool,
    /// Abort any task still running after this long.
    pub time_budget: Option<Duration>,
    /// Cap on concurrently running processes. Zero means one per worker
    /// thread.
    pub max_processes: usize,
}

impl RunOptions {
    pub fn full(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    pub fn debug_flux(mut self, debug: bool) -> Self {
        self.debug_flux = debug;
        self
    }

    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }
}

/// Emitted to [`Runner::on_event`] listeners around every task and graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Begin {
        name: TaskName,
        identity: Option<Identity>,
    },
    End {
        name: TaskName,
        identity: Option<Identity>,
        error_count: u32,
        /// False when the task was reused or skipped.
        ran: bool,
    },
}

type Listener = Rc<dyn Fn(&TaskEvent)>;

/// Drives a graph through one action.
pub struct Runner {
    action: Action,
    options: RunOptions,
    providers: HashMap<&'static str, Arc<ProviderRegistry>>,
    storage: Arc<dyn SessionStorage>,
    listeners: Vec<Listener>,
}

impl Runner {
    pub fn new(action: impl Into<Action>) -> Self {
        Self {
            action: action.into(),
            options: RunOptions::default(),
            providers: HashMap::new(),
            storage: Arc::new(NoStorage),
            listeners: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Makes `registry` available to [`Step::resolve`] under its kind.
    pub fn with_providers(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.providers.insert(registry.kind(), registry);
        self
    }

    pub fn on_event(&mut self, listener: impl Fn(&TaskEvent) + 'static) {
        self.listeners.push(Rc::new(listener));
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Runs the action over `graph` and blocks until nothing is left to do.
    ///
    /// Tasks whose dependencies failed are never started. Everything else
    /// runs to completion regardless of failures elsewhere in the graph.
    pub fn run(&self, graph: &Rc<Graph>) -> RunReport {
        let progress = tracing::span!(Level::INFO, "run", action = %self.action);
        progress.pb_set_length(graph.leaf_count() as u64);
        progress.pb_set_style(&RUN_STYLE);
        progress.pb_set_message(&format!("Running {}...", self.action));
        let _enter = progress.enter();

        let shared = Rc::new(RunShared {
            action: self.action.clone(),
            options: self.options.clone(),
            providers: self.providers.clone(),
            reactor: Reactor::new(self.options.max_processes),
            storage: Arc::clone(&self.storage),
            loader: session_loader(),
            sessions: RefCell::default(),
            loaded: Cell::new(false),
            listeners: self.listeners.clone(),
            report: RefCell::default(),
            progress: progress.clone(),
        });

        execute(&shared, Unit::Root(Rc::clone(graph)), |_| {});
        shared.reactor.run();

        let mut report = shared.report.take();

        if graph.own_state() == TaskState::Done {
            report.error_count += graph.own_error_count();
        } else {
            let stalled = graph.leaves_in(TaskState::Running);
            let mut diagnostic = Diagnostic::fatal(format!(
                "run stalled with {} task(s) that never continued",
                stalled.len()
            ));
            for name in stalled {
                let note = Diagnostic::note(format!("still running: {name}"));
                diagnostic = diagnostic.with_note(note);
            }
            report.diagnostics.push(diagnostic);
            report.error_count += graph.leaf_errors() + 1;
        }

        if shared.loaded.get() {
            let sessions = shared.sessions.take();
            if let Err(e) = shared.storage.save(&sessions) {
                report
                    .diagnostics
                    .push(Diagnostic::error(format!("couldn't save session: {e}")));
                report.error_count += 1;
            }
        }

        report.blocked = graph.leaves_in(TaskState::Waiting);

        tracing::info!(
            ran = report.ran.len(),
            reused = report.reused.len(),
            errors = report.error_count,
            "{} complete",
            self.action
        );
        report
    }
}

/// State shared by every task of one run.
pub(crate) struct RunShared {
    pub(crate) action: Action,
    pub(crate) options: RunOptions,
    pub(crate) providers: HashMap<&'static str, Arc<ProviderRegistry>>,
    pub(crate) reactor: Rc<Reactor>,
    storage: Arc<dyn SessionStorage>,
    loader: Once<StepContext, ()>,
    sessions: RefCell<SessionMap>,
    loaded: Cell<bool>,
    listeners: Vec<Listener>,
    report: RefCell<RunReport>,
    progress: Span,
}

impl RunShared {
    /// Notifies listeners. A panicking listener is reported as an error of
    /// the run and never unwinds into the task's flux.
    fn emit(&self, event: &TaskEvent) {
        for listener in &self.listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let msg = panic_message(payload.as_ref());
                tracing::error!("event listener panicked: {msg}");

                let mut report = self.report.borrow_mut();
                report
                    .diagnostics
                    .push(Diagnostic::error(format!("event listener panicked: {msg}")));
                report.error_count += 1;
            }
        }
    }
}

/// Loads the session map on a worker the first time any task asks for it.
///
/// An unreadable session is not fatal, the run just starts from scratch.
fn session_loader() -> Once<StepContext, ()> {
    Once::new(|flux: &Step, resolver: Resolver<StepContext, ()>| {
        let shared = Rc::clone(&flux.context().run);
        let storage = Arc::clone(&shared.storage);
        let reactor = Rc::clone(&shared.reactor);

        reactor.submit(
            move || storage.load(),
            move |result| {
                let sessions = match result {
                    Ok(Ok(sessions)) => sessions,
                    Ok(Err(e)) => discard_session(&shared, e),
                    Err(e) => discard_session(&shared, e),
                };
                tracing::debug!(records = sessions.len(), "loaded session");

                *shared.sessions.borrow_mut() = sessions;
                shared.loaded.set(true);
                resolver.resolve(());
            },
        );
    })
}

fn discard_session(shared: &RunShared, err: impl std::fmt::Display) -> SessionMap {
    tracing::warn!("couldn't load session: {err}");
    shared.report.borrow_mut().diagnostics.push(Diagnostic::warning(format!(
        "couldn't load session, every task is considered stale: {err}"
    )));
    SessionMap::default()
}

/// Starts a flux for `unit`. `on_done` receives the unit's error count once
/// it ended, whether it succeeded, failed, panicked or ran out of time.
fn execute(shared: &Rc<RunShared>, unit: Unit, on_done: impl FnOnce(u32) + 'static) {
    let leaf = unit.task().is_some();
    let span = tracing::span!(parent: &shared.progress, Level::INFO, "task", name = %unit.name());
    let flux = Step::new(StepContext::new(Rc::clone(shared), unit, span));

    flux.set_debug(shared.options.debug_flux);
    flux.on_panic(|flux, msg| {
        flux.diagnostic(Diagnostic::fatal(format!("task panicked: {msg}")));
        flux.abort();
    });
    flux.set_first_elements([
        shared.loader.step(|_, _| {}),
        step(begin),
        step(perform),
        step(move |flux: &Step| {
            let errors = end(flux);
            on_done(errors);
            flux.proceed();
        }),
    ]);

    if leaf && let Some(budget) = shared.options.time_budget {
        flux.set_time_budget(&shared.reactor, budget);
    }
    if flux.state() == FluxState::Defining {
        flux.proceed();
    }
}

fn begin(flux: &Step) {
    let event = flux.with(|ctx| {
        let shared = Rc::clone(&ctx.run);
        ctx.previous = ctx.identity.as_ref().and_then(|identity| {
            shared
                .sessions
                .borrow()
                .get(identity, shared.action.as_str())
                .cloned()
        });
        ctx.started_at = now_millis();
        ctx.started = Some(Instant::now());

        if ctx.unit.task().is_some() {
            ctx.span.pb_set_style(&TASK_STYLE);
            ctx.span
                .pb_set_message(&format!("{} {}", shared.action, ctx.name));
            ctx.span.in_scope(|| tracing::debug!("begin"));
        }

        TaskEvent::Begin {
            name: ctx.name.clone(),
            identity: ctx.identity.clone(),
        }
    });

    flux.context().run.emit(&event);
    flux.proceed();
}

fn perform(flux: &Step) {
    let (shared, unit) = {
        let ctx = flux.context();
        (Rc::clone(&ctx.run), ctx.unit.clone())
    };

    if let Some(graph) = unit.subgraph() {
        unit.status().set_state(TaskState::Running);
        GraphWalk::start(shared, graph, flux.clone());
        return;
    }
    let Some(task) = unit.task() else {
        flux.proceed();
        return;
    };

    match &shared.action {
        Action::Build => {
            if !is_stale(flux, task, shared.options.full) {
                flux.proceed();
                return;
            }
            mark_running(flux, &unit);
            task.run(flux);
        }
        Action::Configure => {
            mark_running(flux, &unit);
            task.configure(flux);
        }
        Action::Clean => {
            mark_running(flux, &unit);
            task.clean(flux);
        }
        Action::Other(name) => {
            flux.warning(format!("task doesn't support \"{name}\" action"));
            flux.proceed();
        }
    }
}

/// Consults the staleness oracle. A fresh task gets its previous build
/// replayed, unless `full` forces it to run. A task whose check failed is
/// neither fresh nor run.
fn is_stale(flux: &Step, task: &dyn Task, full: bool) -> bool {
    let previous = flux.previous_record();

    let check = match task.staleness(previous.as_ref()) {
        Ok(check) => check,
        Err(e) => {
            flux.diagnostic(Diagnostic::from(&e));
            return false;
        }
    };

    for path in check.missing_optional {
        flux.diagnostic(Diagnostic::warning("optional input is missing").with_path(path));
    }

    if let Staleness::Stale(reason) = &check.staleness {
        tracing::debug!(task = %flux.task_name(), %reason, "stale");
        return true;
    }
    if full {
        return true;
    }

    flux.with(|ctx| {
        if let Some(previous) = &ctx.previous {
            ctx.reporter.logs.push_str(&previous.logs);
            ctx.reporter
                .diagnostics
                .extend(previous.diagnostics.iter().cloned());
        }
        ctx.reused = true;
    });
    false
}

fn mark_running(flux: &Step, unit: &Unit) {
    unit.status().set_state(TaskState::Running);
    flux.with(|ctx| ctx.ran = true);
}

fn end(flux: &Step) -> u32 {
    let aborted = flux.state() == FluxState::Aborted;
    let mut ctx = flux.context_mut();
    let shared = Rc::clone(&ctx.run);

    if aborted && ctx.error_count() == 0 {
        ctx.reporter
            .diagnostic(Diagnostic::fatal("task aborted: time budget exceeded"));
    }
    let errors = ctx.error_count();
    let leaf = ctx.unit.task().is_some();

    if leaf
        && !ctx.reused
        && ctx.started.is_some()
        && shared.loaded.get()
        && !matches!(shared.action, Action::Other(_))
        && let Some(identity) = ctx.identity.clone()
    {
        let end_time = now_millis().max(ctx.started_at);
        let record = SessionRecord {
            logs: ctx.reporter.logs.clone(),
            diagnostics: ctx.reporter.diagnostics.clone(),
            last_run_start_time: ctx.started_at,
            last_run_end_time: end_time,
            last_success_time: if errors == 0 { end_time } else { 0 },
        };
        shared
            .sessions
            .borrow_mut()
            .insert(identity, shared.action.as_str(), record);
    }

    ctx.unit.status().finish(errors);

    {
        let mut report = shared.report.borrow_mut();
        report
            .diagnostics
            .extend(ctx.reporter.diagnostics.iter().cloned());

        if leaf {
            if ctx.ran {
                report.ran.push(ctx.name.clone());
            }
            if ctx.reused {
                report.reused.push(ctx.name.clone());
            }
            if ctx.ran
                && let (Some(task), Some(start)) = (ctx.unit.task_ref(), ctx.started)
            {
                report.execution.insert(
                    task,
                    TaskExecution {
                        start,
                        duration: start.elapsed(),
                    },
                );
            }
        }
    }

    if leaf {
        shared.progress.pb_inc(1);
    }
    if errors > 0 {
        ctx.span
            .in_scope(|| tracing::warn!(task = %ctx.name, errors, "task failed"));
    }

    let event = TaskEvent::End {
        name: ctx.name.clone(),
        identity: ctx.identity.clone(),
        error_count: errors,
        ran: ctx.ran,
    };
    ctx.span = Span::none();
    drop(ctx);

    shared.emit(&event);
    errors
}

/// Schedules the tasks of one graph as their dependencies complete.
struct GraphWalk {
    shared: Rc<RunShared>,
    graph: Rc<Graph>,
    /// Dependencies each task still waits for.
    remaining: RefCell<HashMap<NodeIndex, usize>>,
    ready: RefCell<VecDeque<NodeIndex>>,
    draining: Cell<bool>,
    errors: Rc<Cell<u32>>,
    barrier: Barrier,
}

impl GraphWalk {
    /// Walks `graph`, then continues `flux`, the graph's own flux.
    fn start(shared: Rc<RunShared>, graph: Rc<Graph>, flux: Step) {
        let remaining = graph
            .indices()
            .map(|index| (index, graph.dependency_count(index)))
            .collect();

        let walk = Rc::new(GraphWalk {
            shared,
            graph,
            remaining: RefCell::new(remaining),
            ready: RefCell::default(),
            draining: Cell::new(false),
            errors: Rc::default(),
            barrier: Barrier::new(),
        });

        for index in walk.graph.input_indices() {
            walk.schedule(index);
        }

        let errors = Rc::clone(&walk.errors);
        walk.barrier.end_with(move || {
            flux.with(|ctx| ctx.child_errors = errors.get());
            flux.proceed();
        });
    }

    fn schedule(self: &Rc<Self>, index: NodeIndex) {
        self.barrier.inc();
        self.ready.borrow_mut().push_back(index);
        self.drain();
    }

    /// Launches queued tasks until none is left. Tasks completing
    /// synchronously only queue their dependents, so long chains don't
    /// nest.
    fn drain(self: &Rc<Self>) {
        if self.draining.replace(true) {
            return;
        }
        loop {
            let next = self.ready.borrow_mut().pop_front();
            let Some(index) = next else {
                break;
            };
            self.launch(index);
        }
        self.draining.set(false);
    }

    fn launch(self: &Rc<Self>, index: NodeIndex) {
        let status = self.graph.node_status(index);
        if status.state() == TaskState::Done {
            self.complete(index, status.errors());
            return;
        }

        let walk = Rc::clone(self);
        let unit = Unit::Node {
            owner: Rc::clone(&self.graph),
            index,
        };
        execute(&self.shared, unit, move |errors| walk.complete(index, errors));
    }

    fn complete(self: &Rc<Self>, index: NodeIndex, errors: u32) {
        if errors == 0 {
            for dependent in self.graph.dependents_of(index) {
                let ready = {
                    let mut remaining = self.remaining.borrow_mut();
                    let count = remaining.entry(dependent).or_insert(1);
                    *count = count.saturating_sub(1);
                    *count == 0
                };
                if ready {
                    self.schedule(dependent);
                }
            }
        } else {
            self.errors.set(self.errors.get() + errors);
        }
        self.barrier.dec();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::core::KeyMaterial;
    use crate::diagnostic::Severity;
    use crate::engine::{FileStorage, Files, MemoryStorage};
    use crate::provider::{Conditions, ProcessProvider};

    type Calls = Rc<RefCell<Vec<&'static str>>>;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
        Stall,
        ProceedTwice,
    }

    struct Probe {
        name: &'static str,
        calls: Calls,
        behavior: Behavior,
        output: Option<Utf8PathBuf>,
    }

    impl Probe {
        fn new(name: &'static str, calls: &Calls, behavior: Behavior) -> Self {
            Self {
                name,
                calls: Rc::clone(calls),
                behavior,
                output: None,
            }
        }

        fn writing(mut self, output: Utf8PathBuf) -> Self {
            self.output = Some(output);
            self
        }
    }

    impl Task for Probe {
        fn name(&self) -> TaskName {
            TaskName::new("probe", self.name)
        }

        fn key(&self) -> Option<KeyMaterial> {
            Some(KeyMaterial::new("probe").field("name", self.name))
        }

        fn files(&self) -> Files {
            self.output.iter().fold(Files::new(), |files, out| files.output(out.clone()))
        }

        fn run(&self, step: &Step) {
            self.calls.borrow_mut().push(self.name);
            match self.behavior {
                Behavior::Succeed => {
                    if let Some(output) = &self.output {
                        fs::write(output, self.name).unwrap();
                    }
                    step.log(format!("built {}", self.name));
                    step.succeed();
                }
                Behavior::Fail => {
                    step.error("broken");
                    step.fail(1);
                }
                Behavior::Panic => panic!("boom"),
                Behavior::Stall => {}
                Behavior::ProceedTwice => {
                    step.succeed();
                    step.succeed();
                }
            }
        }
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        (tmp, root)
    }

    fn name(name: &str) -> TaskName {
        TaskName::new("probe", name)
    }

    #[test]
    fn test_failure_isolates_dependents_only() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        let a = graph.add_task(Probe::new("a", &calls, Behavior::Fail));
        let b = graph.add_task(Probe::new("b", &calls, Behavior::Succeed));
        let c = graph.add_task(Probe::new("c", &calls, Behavior::Succeed));
        graph.add_dependency(b, a).unwrap();
        let graph = Rc::new(graph);

        let report = Runner::new("build").run(&graph);

        let mut seen = calls.borrow().clone();
        seen.sort();
        assert_eq!(seen, ["a", "c"]);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.blocked, [name("b")]);
        assert_eq!(graph.state(b), Some(TaskState::Waiting));
        assert_eq!(graph.state(c), Some(TaskState::Done));
        assert_eq!(graph.error_count(a), Some(1));
        assert_eq!(report.errors().count(), 1);
    }

    #[test]
    fn test_dependencies_run_first() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        let a = graph.add_task(Probe::new("a", &calls, Behavior::Succeed));
        let b = graph.add_task(Probe::new("b", &calls, Behavior::Succeed));
        let c = graph.add_task(Probe::new("c", &calls, Behavior::Succeed));
        graph.add_dependency(c, b).unwrap();
        graph.add_dependency(b, a).unwrap();

        let report = Runner::new("build").run(&Rc::new(graph));

        assert!(report.is_success());
        assert_eq!(*calls.borrow(), ["a", "b", "c"]);
        assert!(report.blocked.is_empty());
    }

    #[test]
    fn test_long_chain_completes() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        let mut previous = None;
        for _ in 0..5_000 {
            let task = graph.add_task(Probe::new("link", &calls, Behavior::Succeed));
            if let Some(previous) = previous {
                graph.add_dependency(task, previous).unwrap();
            }
            previous = Some(task);
        }

        let report = Runner::new("build").run(&Rc::new(graph));

        assert!(report.is_success());
        assert_eq!(calls.borrow().len(), 5_000);
    }

    #[test]
    fn test_second_build_reuses_everything() {
        let (_tmp, root) = tempdir();
        let storage = Arc::new(MemoryStorage::new());
        let calls = Calls::default();

        let build = |storage: &Arc<MemoryStorage>| {
            let mut graph = Graph::new("root");
            let a = graph.add_task(
                Probe::new("a", &calls, Behavior::Succeed).writing(root.join("out/a.txt")),
            );
            let b = graph.add_task(
                Probe::new("b", &calls, Behavior::Succeed).writing(root.join("out/b.txt")),
            );
            graph.add_dependency(b, a).unwrap();
            Runner::new("build")
                .with_storage(Arc::clone(storage) as Arc<dyn SessionStorage>)
                .run(&Rc::new(graph))
        };

        let first = build(&storage);
        assert_eq!(first.ran, [name("a"), name("b")]);
        let contents = fs::read(root.join("out/b.txt")).unwrap();

        let second = build(&storage);
        assert!(second.is_success());
        assert!(second.ran.is_empty());
        assert_eq!(second.reused, [name("a"), name("b")]);
        assert_eq!(second.execution.len(), 0);
        assert_eq!(fs::read(root.join("out/b.txt")).unwrap(), contents);
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn test_missing_output_makes_task_stale_again() {
        let (_tmp, root) = tempdir();
        let storage = Arc::new(MemoryStorage::new());
        let calls = Calls::default();

        let build = || {
            let mut graph = Graph::new("root");
            graph.add_task(Probe::new("a", &calls, Behavior::Succeed).writing(root.join("a.txt")));
            Runner::new("build")
                .with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>)
                .run(&Rc::new(graph))
        };

        build();
        fs::remove_file(root.join("a.txt")).unwrap();
        let report = build();

        assert_eq!(report.ran, [name("a")]);
        assert!(root.join("a.txt").exists());
    }

    #[test]
    fn test_session_records_follow_timestamp_law() {
        let storage = Arc::new(MemoryStorage::new());
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        graph.add_task(Probe::new("ok", &calls, Behavior::Succeed));
        graph.add_task(Probe::new("bad", &calls, Behavior::Fail));

        Runner::new("build")
            .with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>)
            .run(&Rc::new(graph));

        let sessions = storage.snapshot();
        let identity = |n: &str| KeyMaterial::new("probe").field("name", n).identity();

        let ok = sessions.get(&identity("ok"), "build").unwrap();
        assert!(ok.last_run_end_time >= ok.last_run_start_time);
        assert_eq!(ok.last_success_time, ok.last_run_end_time);
        assert_eq!(ok.logs, "built ok\n");

        let bad = sessions.get(&identity("bad"), "build").unwrap();
        assert_eq!(bad.last_success_time, 0);
        assert_eq!(bad.diagnostics[0].msg, "broken");
    }

    #[test]
    fn test_failed_task_reruns() {
        let storage = Arc::new(MemoryStorage::new());
        let calls = Calls::default();
        let build = || {
            let mut graph = Graph::new("root");
            graph.add_task(Probe::new("bad", &calls, Behavior::Fail));
            Runner::new("build")
                .with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>)
                .run(&Rc::new(graph))
        };

        assert_eq!(build().error_count, 1);
        assert_eq!(build().error_count, 1);
        assert_eq!(*calls.borrow(), ["bad", "bad"]);
    }

    #[test]
    fn test_full_build_ignores_session() {
        let storage = Arc::new(MemoryStorage::new());
        let calls = Calls::default();
        let build = |full: bool| {
            let mut graph = Graph::new("root");
            graph.add_task(Probe::new("a", &calls, Behavior::Succeed));
            Runner::new("build")
                .with_options(RunOptions::default().full(full))
                .with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>)
                .run(&Rc::new(graph))
        };

        build(false);
        assert!(build(false).ran.is_empty());
        assert_eq!(build(true).ran, [name("a")]);
    }

    #[test]
    fn test_full_build_still_prepares_output_dirs() {
        let (_tmp, root) = tempdir();
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        graph.add_task(Probe::new("a", &calls, Behavior::Succeed).writing(root.join("gen/a.txt")));

        let report = Runner::new("build")
            .with_options(RunOptions::default().full(true))
            .run(&Rc::new(graph));

        assert!(report.is_success(), "{}", report.render_diagnostics());
        assert_eq!(fs::read_to_string(root.join("gen/a.txt")).unwrap(), "a");
    }

    #[test]
    fn test_full_build_reports_missing_input() {
        let (_tmp, root) = tempdir();
        let mut graph = Graph::new("root");
        graph.add_task(
            crate::tasks::CopyTask::new("gone").file(root.join("gone.txt"), root.join("out.txt")),
        );

        let report = Runner::new("build")
            .with_options(RunOptions::default().full(true))
            .run(&Rc::new(graph));

        assert_eq!(report.error_count, 1);
        assert!(report.ran.is_empty());
        assert_eq!(report.diagnostics[0].path, Some(root.join("gone.txt")));
    }

    #[test]
    fn test_panic_becomes_fatal_diagnostic() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        let a = graph.add_task(Probe::new("a", &calls, Behavior::Panic));
        graph.add_task(Probe::new("c", &calls, Behavior::Succeed));
        let graph = Rc::new(graph);

        let report = Runner::new("build").run(&graph);

        assert_eq!(report.error_count, 1);
        assert_eq!(graph.error_count(a), Some(1));
        let fatal = report.errors().next().unwrap();
        assert_eq!(fatal.severity, Severity::FatalError);
        assert_eq!(fatal.msg, "task panicked: boom");
        assert!(calls.borrow().contains(&"c"));
    }

    #[test]
    fn test_debug_flux_reports_double_continue() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        graph.add_task(Probe::new("twice", &calls, Behavior::ProceedTwice));

        let report = Runner::new("build")
            .with_options(RunOptions::default().debug_flux(true))
            .run(&Rc::new(graph));

        assert_eq!(report.error_count, 1);
        assert!(report.diagnostics[0].msg.contains("continued 2 times"));
    }

    #[test]
    fn test_time_budget_aborts_stalled_task() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        let a = graph.add_task(Probe::new("slow", &calls, Behavior::Stall));
        let b = graph.add_task(Probe::new("after", &calls, Behavior::Succeed));
        graph.add_dependency(b, a).unwrap();

        let report = Runner::new("build")
            .with_options(RunOptions::default().time_budget(Duration::from_millis(20)))
            .run(&Rc::new(graph));

        assert_eq!(report.error_count, 1);
        assert_eq!(report.diagnostics[0].msg, "task aborted: time budget exceeded");
        assert_eq!(report.blocked, [name("after")]);
    }

    #[test]
    fn test_stalled_task_is_reported() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        graph.add_task(Probe::new("stuck", &calls, Behavior::Stall));

        let report = Runner::new("build").run(&Rc::new(graph));

        assert_eq!(report.error_count, 1);
        let fatal = &report.diagnostics[0];
        assert_eq!(fatal.severity, Severity::FatalError);
        assert_eq!(fatal.notes[0].msg, "still running: probe:stuck");
    }

    #[test]
    fn test_unknown_action_warns() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        graph.add_task(Probe::new("a", &calls, Behavior::Succeed));

        let report = Runner::new("package").run(&Rc::new(graph));

        assert!(report.is_success());
        assert!(calls.borrow().is_empty());
        assert_eq!(report.warnings().count(), 1);
        assert_eq!(report.diagnostics[0].msg, "task doesn't support \"package\" action");
    }

    #[test]
    fn test_clean_removes_outputs() {
        let (_tmp, root) = tempdir();
        fs::write(root.join("a.txt"), "stale").unwrap();
        let calls = Calls::default();

        let clean = || {
            let mut graph = Graph::new("root");
            graph.add_task(Probe::new("a", &calls, Behavior::Succeed).writing(root.join("a.txt")));
            Runner::new("clean").run(&Rc::new(graph))
        };

        assert!(clean().is_success());
        assert!(!root.join("a.txt").exists());
        assert!(clean().is_success());
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn test_done_tasks_short_circuit_until_reset() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        let a = graph.add_task(Probe::new("a", &calls, Behavior::Succeed));
        let b = graph.add_task(Probe::new("b", &calls, Behavior::Succeed));
        graph.add_dependency(b, a).unwrap();
        let graph = Rc::new(graph);
        let runner = Runner::new("build");

        runner.run(&graph);
        let again = runner.run(&graph);
        assert!(again.is_success());
        assert!(again.ran.is_empty());
        assert_eq!(calls.borrow().len(), 2);

        graph.reset(a).unwrap();
        let after_reset = runner.run(&graph);
        assert_eq!(after_reset.ran, [name("a"), name("b")]);
    }

    #[test]
    fn test_nested_graph_failure_blocks_outer_dependent() {
        let calls = Calls::default();
        let mut lib = Graph::new("lib");
        lib.add_task(Probe::new("lib-ok", &calls, Behavior::Succeed));
        lib.add_task(Probe::new("lib-bad", &calls, Behavior::Fail));

        let mut root = Graph::new("root");
        let lib = root.add_graph(lib);
        let app = root.add_task(Probe::new("app", &calls, Behavior::Succeed));
        let tool = root.add_task(Probe::new("tool", &calls, Behavior::Succeed));
        root.add_dependency(app, lib).unwrap();
        let root = Rc::new(root);

        let report = Runner::new("build").run(&root);

        assert_eq!(report.error_count, 1);
        assert_eq!(root.error_count(lib), Some(1));
        assert_eq!(report.blocked, [name("app")]);
        assert_eq!(root.state(tool), Some(TaskState::Done));
    }

    #[test]
    fn test_events_bracket_every_task() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        graph.add_task(Probe::new("a", &calls, Behavior::Succeed));

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        let mut runner = Runner::new("build");
        runner.on_event(move |event| sink.borrow_mut().push(event.clone()));
        runner.run(&Rc::new(graph));

        let events = events.borrow();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], TaskEvent::Begin { name, .. } if name.name == "root"));
        assert!(matches!(&events[1], TaskEvent::Begin { name, .. } if name.name == "a"));
        assert!(matches!(
            &events[2],
            TaskEvent::End { name, error_count: 0, ran: true, .. } if name.name == "a"
        ));
        assert!(matches!(&events[3], TaskEvent::End { name, .. } if name.name == "root"));
    }

    #[test]
    fn test_panicking_listener_does_not_stall_the_run() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        let a = graph.add_task(Probe::new("a", &calls, Behavior::Succeed));
        let b = graph.add_task(Probe::new("b", &calls, Behavior::Succeed));
        graph.add_dependency(b, a).unwrap();

        let mut runner = Runner::new("build");
        runner.on_event(|event| {
            if let TaskEvent::End { name, .. } = event
                && name.name == "a"
            {
                panic!("listener broke");
            }
        });
        let report = runner.run(&Rc::new(graph));

        assert_eq!(*calls.borrow(), ["a", "b"]);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].msg, "event listener panicked: listener broke");
    }

    #[test]
    fn test_corrupt_session_is_a_warning() {
        let (_tmp, root) = tempdir();
        fs::write(root.join("app.session"), "garbage").unwrap();
        let storage = Arc::new(FileStorage::for_target(&root, "app"));
        let calls = Calls::default();

        let mut graph = Graph::new("root");
        graph.add_task(Probe::new("a", &calls, Behavior::Succeed));
        let report = Runner::new("build")
            .with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>)
            .run(&Rc::new(graph));

        assert!(report.is_success());
        assert_eq!(report.warnings().count(), 1);
        assert_eq!(storage.load().unwrap().len(), 1);
    }

    struct Resolving;

    impl Task for Resolving {
        fn name(&self) -> TaskName {
            TaskName::new("resolving", "cc")
        }

        fn run(&self, step: &Step) {
            let query = Conditions::from([("compiler", "clang")]);
            match step.resolve("compiler", &query) {
                Some(_) => step.succeed(),
                None => step.fail(1),
            }
        }
    }

    #[test]
    fn test_ambiguous_provider_fails_the_task() {
        let registry = Arc::new(ProviderRegistry::new("compiler"));
        registry.register(ProcessProvider::new(
            "clang-17",
            "clang-17",
            Conditions::from([("compiler", "clang")]),
        ));
        registry.register(ProcessProvider::new(
            "clang-18",
            "clang-18",
            Conditions::from([("compiler", "clang")]),
        ));

        let mut graph = Graph::new("root");
        graph.add_task(Resolving);
        let report = Runner::new("build")
            .with_providers(registry)
            .run(&Rc::new(graph));

        assert_eq!(report.error_count, 1);
        let error = &report.diagnostics[0];
        assert!(error.msg.starts_with("multiple compilers found"));
        assert_eq!(error.notes.len(), 3);
    }

    #[test]
    fn test_missing_provider_kind_fails_the_task() {
        let mut graph = Graph::new("root");
        graph.add_task(Resolving);
        let report = Runner::new("build").run(&Rc::new(graph));

        assert_eq!(report.error_count, 1);
        assert!(report.diagnostics[0].msg.starts_with("unable to find compiler"));
    }

    #[test]
    fn test_mermaid_marks_failures_and_skips() {
        let calls = Calls::default();
        let mut graph = Graph::new("root");
        let a = graph.add_task(Probe::new("a", &calls, Behavior::Fail));
        let b = graph.add_task(Probe::new("b", &calls, Behavior::Succeed));
        graph.add_dependency(b, a).unwrap();
        graph.add_output(b).unwrap();
        let graph = Rc::new(graph);

        let report = Runner::new("build").run(&graph);
        let chart = report.render_mermaid(&graph);

        assert!(chart.starts_with("graph LR\n"));
        assert!(chart.contains("    0[\"probe:a\\nFailed\"]\n    style 0 fill:#B22222\n"));
        assert!(chart.contains("    1[\"probe:b\\nSkipped\"]\n"));
        assert!(chart.contains("    1 --> Output\n"));
        assert!(chart.contains("    0 --> 1\n"));
    }
}
