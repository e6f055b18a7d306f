use std::fmt::Write;

use crate::frontend::token::{Token, TokenKind};

/// Renders a token stream for `cinder tokens`.
pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints the source lexeme instead of the Debug form
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Token]) -> String {
        let mut out = String::new();
        for token in tokens {
            self.write_one(&mut out, token);
        }
        out
    }

    fn write_one(&self, out: &mut String, token: &Token) {
        let colr = if self.color { self.color(&token.kind) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };
        let kind = self.kind(&token.kind);

        // writing into a String cannot fail
        let _ = if self.show_debug_repr {
            writeln!(
                out,
                "[{:02}:{:02}] {}{:<8} {:?}{}",
                token.pos.line, token.pos.col, colr, kind, token.kind, reset
            )
        } else {
            writeln!(
                out,
                "[{:02}:{:02}] {}{:<8} {}{}",
                token.pos.line, token.pos.col, colr, kind, token.kind, reset
            )
        };
    }

    fn kind(&self, t: &TokenKind) -> &'static str {
        use TokenKind::*;
        match t {
            Eof => "EOF",

            // literals
            Integer(_) => "INT",
            Float(_) => "FLOAT",
            Char(_) => "CHAR",
            Str(_) => "STRING",
            True | False => "BOOL",

            // names
            Name(_) => "NAME",

            // structure
            LParen | RParen => "PAREN",
            LBracket | RBracket => "BRACKET",
            LBrace | RBrace => "BRACE",
            Colon | Semicolon | Comma | Arrow => "PUNCT",

            // ops / comparisons
            Plus | Minus | Star | Slash | Dot | Assign => "OP",
            EqEq | Lt | LtEq | Gt | GtEq => "CMP",

            // everything else is a keyword
            _ => "KEYWORD",
        }
    }

    fn color(&self, t: &TokenKind) -> &'static str {
        use TokenKind::*;
        match t {
            Eof => Self::DIM,
            Str(_) | Char(_) => Self::GRN,
            Integer(_) | Float(_) | True | False => Self::CYN,
            Name(_) => Self::YEL,
            Plus | Minus | Star | Slash | Dot | Assign => Self::MAG,
            EqEq | Lt | LtEq | Gt | GtEq => Self::MAG,
            _ => Self::RESET,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::frontend::lexer::Lexer;

    fn tokens(source: &str) -> Vec<Token> {
        let mut diags = Diagnostics::new();
        Lexer::new(source, Rc::from("t")).tokenize(&mut diags)
    }

    #[test]
    fn test_plain_dump() {
        let out = TokenDumper::new().no_color().pretty().dump(&tokens("let x = 1;"));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "[01:01] KEYWORD  let");
        assert_eq!(lines[1], "[01:05] NAME     x");
        assert_eq!(lines[3], "[01:09] INT      1");
        assert_eq!(lines.last().copied(), Some("[01:11] EOF      end of file"));
    }

    #[test]
    fn test_debug_dump_is_colored() {
        let out = TokenDumper::new().dump(&tokens("\"s\""));
        assert!(out.contains("\x1b[32m"));
        assert!(out.contains("Str(\"s\")"));
    }
}
