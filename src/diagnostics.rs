//! Source diagnostics and the per-compile context.
//!
//! Every phase reports through the same [`Diagnostics`] sink instead of returning early,
//! so a single run can surface several problems. Later phases consult
//! [`Diagnostics::has_errors`] and refuse to run once an error was recorded.

use std::fmt;
use std::rc::Rc;

use crate::frontend::token::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Unrecognized character, malformed numeric literal, unterminated literal.
    Lexical,
    /// Expected-token mismatch.
    Syntax,
    /// Undefined names, type mismatches, overload failures, type loops.
    Semantic,
    /// Unresolved labels or calls.
    Link,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Lexical => write!(f, "lexical"),
            DiagnosticKind::Syntax => write!(f, "syntax"),
            DiagnosticKind::Semantic => write!(f, "type"),
            DiagnosticKind::Link => write!(f, "link"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub pos: Option<Position>,
}

impl Diagnostic {
    /// Formats the diagnostic with the offending source line and a caret under the column.
    pub fn render(&self, source: &str) -> String {
        let label = match self.severity {
            Severity::Error => format!("{} error", self.kind),
            Severity::Warning => "warning".to_string(),
        };

        let Some(pos) = &self.pos else {
            return format!("{}: {}", label, self.message);
        };

        let mut out = format!("{}: {}: {}", pos, label, self.message);
        if let Some(line) = source.lines().nth(pos.line.saturating_sub(1) as usize) {
            let gutter = format!("{} | ", pos.line);
            out.push('\n');
            out.push_str(&gutter);
            out.push_str(line);
            out.push('\n');
            out.push_str(&" ".repeat(gutter.len() + pos.col.saturating_sub(1) as usize));
            out.push('^');
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pos {
            Some(pos) => write!(f, "{}: {}", pos, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Accumulating diagnostic sink with a single "has any error" flag.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
    errors: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error.
    ///
    /// Function bodies are lexed twice (header scan, then body parse), so a lexical
    /// error already recorded at the same offset is dropped.
    pub fn error(&mut self, kind: DiagnosticKind, pos: Option<&Position>, message: impl Into<String>) {
        let message = message.into();
        if kind == DiagnosticKind::Lexical && self.contains_lexical(pos, &message) {
            return;
        }
        tracing::debug!(%kind, %message, "error reported");
        self.errors += 1;
        self.items.push(Diagnostic {
            severity: Severity::Error,
            kind,
            message,
            pos: pos.cloned(),
        });
    }

    fn contains_lexical(&self, pos: Option<&Position>, message: &str) -> bool {
        self.items.iter().any(|d| {
            d.kind == DiagnosticKind::Lexical
                && d.message == message
                && d.pos.as_ref().map(|p| p.offset) == pos.map(|p| p.offset)
        })
    }

    /// Records a warning. Warnings never set the error flag.
    pub fn warning(&mut self, pos: Option<&Position>, message: impl Into<String>) {
        self.items.push(Diagnostic {
            severity: Severity::Warning,
            kind: DiagnosticKind::Semantic,
            message: message.into(),
            pos: pos.cloned(),
        });
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn items(&self) -> &[Diagnostic] {
        &self.items
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| d.severity == Severity::Warning)
    }

    pub fn render_all(&self, source: &str) -> String {
        self.items
            .iter()
            .map(|d| d.render(source))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// State threaded through every compile phase.
///
/// Owns the diagnostic sink so that separate compiles never share mutable state.
#[derive(Debug)]
pub struct CompileContext {
    pub file: Rc<str>,
    pub source: Rc<str>,
    pub diagnostics: Diagnostics,
}

impl CompileContext {
    pub fn new(file: impl Into<Rc<str>>, source: impl Into<Rc<str>>) -> Self {
        CompileContext {
            file: file.into(),
            source: source.into(),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn render_diagnostics(&self) -> String {
        self.diagnostics.render_all(&self.source)
    }
}
