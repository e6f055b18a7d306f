use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::frontend::token::Position;

/// A front-end error with source location.
///
/// Parsing and resolution functions return it through `?`; the statement or item
/// loop that catches it records it in the diagnostic sink and resynchronizes.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: DiagnosticKind,
    pub message: String,
    pub pos: Position,
}

impl ParseError {
    pub fn syntax(pos: &Position, message: impl Into<String>) -> Self {
        ParseError {
            kind: DiagnosticKind::Syntax,
            message: message.into(),
            pos: pos.clone(),
        }
    }

    pub fn semantic(pos: &Position, message: impl Into<String>) -> Self {
        ParseError {
            kind: DiagnosticKind::Semantic,
            message: message.into(),
            pos: pos.clone(),
        }
    }

    pub fn report(self, diags: &mut Diagnostics) {
        diags.error(self.kind, Some(&self.pos), self.message);
    }
}

impl std::fmt::Display for ParseError {
    /// Formats as `file:line:col: message`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.pos, self.message)
    }
}

pub type ParseResult<T> = Result<T, ParseError>;
