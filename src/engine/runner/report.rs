use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::diagnostic::Diagnostic;
use crate::engine::{Graph, TaskName, TaskRef, TaskState};

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Outcome of one [`Runner::run`](crate::Runner::run).
#[derive(Debug, Default)]
pub struct RunReport {
    /// Errors of every task plus failures of the run itself, such as an
    /// unsaved session.
    pub error_count: u32,
    /// Diagnostics of every task that ended, in completion order.
    pub diagnostics: Vec<Diagnostic>,
    /// Tasks whose action hook was invoked.
    pub ran: Vec<TaskName>,
    /// Tasks found fresh, whose previous build was replayed.
    pub reused: Vec<TaskName>,
    /// Tasks never scheduled because something they depend on failed.
    pub blocked: Vec<TaskName>,
    pub execution: HashMap<TaskRef, TaskExecution>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.error_count == 0
    }

    /// Process exit status matching the report.
    pub fn exit_code(&self) -> i32 {
        match self.error_count {
            0 => 0,
            _ => 1,
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_error())
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    /// Every diagnostic, rendered for a terminal.
    pub fn render_diagnostics(&self) -> String {
        self.diagnostics.iter().map(Diagnostic::render).collect()
    }

    /// Renders the direct children of `graph` as a Mermaid diagram.
    ///
    /// * **Green** to **red**: ran, from fastest to slowest
    /// * **Blue**: reused from a previous run
    /// * **Dark red**: failed
    /// * **Grey**: never started
    pub fn render_mermaid(&self, graph: &Graph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution;
        let (mut min_time, mut max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold((f64::MAX, f64::MIN), |(lo, hi), secs| (lo.min(secs), hi.max(secs)));

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for task in graph.tasks() {
            let Some(name) = graph.name_of(task) else {
                continue;
            };
            let id = graph.index(task);
            let label = name.to_string().replace('"', "\\\"");
            let failed = graph.error_count(task).unwrap_or(0) > 0;

            let (extra, color) = match (times.get(&task), graph.state(task)) {
                (_, Some(TaskState::Done)) if failed => {
                    ("Failed".to_string(), "#B22222".to_string())
                }
                (Some(exec), _) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), gradient(t))
                }
                (None, Some(TaskState::Done)) => ("Cached".to_string(), "#ADD8E6".to_string()),
                (None, _) => ("Skipped".to_string(), "#D3D3D3".to_string()),
            };

            let _ = writeln!(f, "    {id}[\"{label}\\n{extra}\"]");
            let _ = writeln!(f, "    style {id} fill:{color}");
            if graph.outputs().contains(&task) {
                let _ = writeln!(f, "    {id} --> Output");
            }
        }

        if !graph.outputs().is_empty() {
            let _ = writeln!(f, "    Output[Output]");
        }

        for (source, target) in graph.edges() {
            let _ = writeln!(f, "    {} --> {}", source.index(), target.index());
        }

        f
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}
