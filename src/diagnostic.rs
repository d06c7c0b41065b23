use std::fmt::{Display, Formatter};

use camino::Utf8PathBuf;
use console::style;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "note")]
    Note,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "fatal error")]
    FatalError,
}

impl Severity {
    pub fn is_error(self) -> bool {
        matches!(self, Severity::Error | Severity::FatalError)
    }

    fn label(self) -> &'static str {
        match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::FatalError => "fatal error",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A structured message attached to a task, persisted in its session record
/// and surfaced in the [`RunReport`](crate::RunReport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(rename = "type")]
    pub severity: Severity,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Diagnostic>,
}

impl Diagnostic {
    pub fn new(severity: Severity, msg: impl Into<String>) -> Self {
        Self {
            severity,
            msg: msg.into(),
            path: None,
            row: None,
            col: None,
            category: None,
            notes: Vec::new(),
        }
    }

    pub fn note(msg: impl Into<String>) -> Self {
        Self::new(Severity::Note, msg)
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        Self::new(Severity::Warning, msg)
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::new(Severity::Error, msg)
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::new(Severity::FatalError, msg)
    }

    pub fn with_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_location(mut self, row: u32, col: u32) -> Self {
        self.row = Some(row);
        self.col = Some(col);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_note(mut self, note: Diagnostic) -> Self {
        self.notes.push(note);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity.is_error()
    }

    /// Renders the diagnostic in the usual `path:row:col: severity: msg` form,
    /// with terminal colors when the output supports them.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        use std::fmt::Write;

        let severity = match self.severity {
            Severity::Note => style(self.severity.label()).cyan(),
            Severity::Warning => style(self.severity.label()).yellow(),
            Severity::Error | Severity::FatalError => style(self.severity.label()).red(),
        }
        .bold();

        let _ = write!(out, "{:indent$}", "", indent = depth * 2);
        if let Some(path) = &self.path {
            let _ = write!(out, "{path}:");
            if let (Some(row), Some(col)) = (self.row, self.col) {
                let _ = write!(out, "{row}:{col}:");
            }
            out.push(' ');
        }
        let _ = writeln!(out, "{severity}: {}", self.msg);

        for note in &self.notes {
            note.render_into(out, depth + 1);
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "{path}: ")?;
        }
        write!(f, "{}: {}", self.severity, self.msg)
    }
}

/// Collects diagnostics and logs produced while a task runs.
#[derive(Debug, Default, Clone)]
pub struct Reporter {
    pub diagnostics: Vec<Diagnostic>,
    pub logs: String,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn error(&mut self, err: impl Display) {
        self.diagnostic(Diagnostic::error(err.to_string()));
    }

    pub fn log(&mut self, line: impl AsRef<str>) {
        self.logs.push_str(line.as_ref());
        if !self.logs.ends_with('\n') {
            self.logs.push('\n');
        }
    }

    /// Number of diagnostics of type `error` or `fatal error`.
    pub fn error_count(&self) -> u32 {
        self.diagnostics.iter().filter(|d| d.is_error()).count() as u32
    }
}
