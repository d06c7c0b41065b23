use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::Command;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tracing::Span;

use crate::core::{Identity, panic_message};
use crate::diagnostic::{Diagnostic, Reporter};
use crate::engine::runner::RunShared;
use crate::engine::{Action, SessionRecord, TaskName, Unit};
use crate::error::ProviderError;
use crate::flux::Flux;
use crate::provider::{Conditions, Provider};
use crate::reactor::{ProcessOutput, Reactor};

/// The handle a task receives while one of its action hooks runs.
pub type Step = Flux<StepContext>;

/// Per-task state carried by a [`Step`].
pub struct StepContext {
    pub(crate) run: Rc<RunShared>,
    pub(crate) unit: Unit,
    pub(crate) name: TaskName,
    pub(crate) identity: Option<Identity>,
    pub(crate) reporter: Reporter,
    pub(crate) previous: Option<SessionRecord>,
    pub(crate) started_at: u64,
    pub(crate) started: Option<Instant>,
    /// The action hook was invoked.
    pub(crate) ran: bool,
    /// A previous successful build was replayed instead.
    pub(crate) reused: bool,
    pub(crate) failures: u32,
    pub(crate) child_errors: u32,
    pub(crate) span: Span,
}

impl StepContext {
    pub(crate) fn new(run: Rc<RunShared>, unit: Unit, span: Span) -> Self {
        Self {
            name: unit.name(),
            identity: unit.identity(),
            run,
            unit,
            reporter: Reporter::new(),
            previous: None,
            started_at: 0,
            started: None,
            ran: false,
            reused: false,
            failures: 0,
            child_errors: 0,
            span,
        }
    }

    /// Errors of the task itself plus those of its children, for graphs.
    pub(crate) fn error_count(&self) -> u32 {
        self.failures.max(self.reporter.error_count()) + self.child_errors
    }
}

impl Flux<StepContext> {
    pub fn task_name(&self) -> TaskName {
        self.context().name.clone()
    }

    pub fn action(&self) -> Action {
        self.context().run.action.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.context().identity.clone()
    }

    /// Record of the previous run of this task for the current action.
    pub fn previous_record(&self) -> Option<SessionRecord> {
        self.context().previous.clone()
    }

    /// Zero when the task never succeeded.
    pub fn last_success_time(&self) -> u64 {
        self.context()
            .previous
            .as_ref()
            .map_or(0, |record| record.last_success_time)
    }

    pub fn reactor(&self) -> Rc<Reactor> {
        Rc::clone(&self.context().run.reactor)
    }

    pub fn log(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        self.with(|ctx| {
            ctx.span.in_scope(|| tracing::trace!("{}", line.trim_end()));
            ctx.reporter.log(line);
        });
    }

    pub fn diagnostic(&self, diagnostic: Diagnostic) {
        self.with(|ctx| {
            ctx.span.in_scope(|| {
                if diagnostic.is_error() {
                    tracing::error!(task = %ctx.name, "{diagnostic}");
                } else {
                    tracing::debug!(task = %ctx.name, "{diagnostic}");
                }
            });
            ctx.reporter.diagnostic(diagnostic);
        });
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.diagnostic(Diagnostic::error(msg));
    }

    pub fn warning(&self, msg: impl Into<String>) {
        self.diagnostic(Diagnostic::warning(msg));
    }

    pub fn note(&self, msg: impl Into<String>) {
        self.diagnostic(Diagnostic::note(msg));
    }

    /// Resolves exactly one provider of `kind` matching `query`.
    ///
    /// Failures are reported as diagnostics on this step. The caller is
    /// expected to [`fail`](Flux::fail) when `None` comes back.
    pub fn resolve(&self, kind: &str, query: &Conditions) -> Option<Arc<dyn Provider>> {
        let registry = self.context().run.providers.get(kind).cloned();

        let result = match registry {
            Some(registry) => registry.validate(query),
            None => Err(ProviderError::NotFound {
                kind: kind.to_string(),
                query: query.clone(),
                candidates: Vec::new(),
            }),
        };

        match result {
            Ok(provider) => Some(provider),
            Err(e) => {
                self.diagnostic(Diagnostic::from(&e));
                None
            }
        }
    }

    /// Spawns `command` in a process slot and suspends until it exits.
    ///
    /// The captured output goes to the task's logs before `then` runs. A
    /// process that could not be started fails the task without calling
    /// `then`. A panic inside `then` is reported like one inside a step.
    pub fn spawn(&self, command: Command, then: impl FnOnce(&Step, ProcessOutput) + 'static) {
        let program = command.get_program().to_string_lossy().into_owned();
        self.log(format!("{program} {}", render_args(&command)));

        let step = self.clone();
        self.reactor().spawn_process(command, move |result| match result {
            Ok(output) => {
                if !output.output.is_empty() {
                    step.log(&output.output);
                }
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| then(&step, output))) {
                    step.diagnostic(Diagnostic::fatal(format!(
                        "task panicked: {}",
                        panic_message(payload.as_ref())
                    )));
                    step.abort();
                }
            }
            Err(e) => {
                step.diagnostic(Diagnostic::error(e.to_string()).with_category(program));
                step.fail(1);
            }
        });
    }

    /// Ends the current action hook.
    pub fn succeed(&self) {
        self.proceed();
    }

    /// Ends the current action hook with at least `errors` errors.
    pub fn fail(&self, errors: u32) {
        self.with(|ctx| ctx.failures = ctx.failures.max(errors.max(1)));
        self.proceed();
    }
}

fn render_args(command: &Command) -> String {
    command
        .get_args()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
