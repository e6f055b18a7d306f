use std::rc::Rc;

use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::frontend::token::{Position, Token, TokenKind};

/// A saved lexer position. Produced by [`Lexer::mark`], consumed by [`Lexer::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LexerMark {
    pos: usize,
    line: u32,
    col: u32,
    offset: usize,
}

/// Streaming lexer over a single source file.
///
/// Tokens are produced on demand by [`Lexer::next_token`]. The parser's header scan
/// records marks at function bodies and later rewinds to them with [`Lexer::reset`].
pub struct Lexer {
    source: Vec<char>,
    file: Rc<str>,
    pos: usize,
    line: u32,
    col: u32,
    offset: usize,
    /// State before the most recent `read`, restored by `unread`.
    back: Option<LexerMark>,
}

impl Lexer {
    pub fn new(source: &str, file: Rc<str>) -> Self {
        Lexer {
            source: source.chars().collect(),
            file,
            pos: 0,
            line: 1,
            col: 1,
            offset: 0,
            back: None,
        }
    }

    pub fn mark(&self) -> LexerMark {
        LexerMark {
            pos: self.pos,
            line: self.line,
            col: self.col,
            offset: self.offset,
        }
    }

    pub fn reset(&mut self, mark: LexerMark) {
        self.pos = mark.pos;
        self.line = mark.line;
        self.col = mark.col;
        self.offset = mark.offset;
        self.back = None;
    }

    fn position(&self) -> Position {
        Position {
            line: self.line,
            col: self.col,
            offset: self.offset,
            file: self.file.clone(),
        }
    }

    fn read(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.back = Some(self.mark());
        self.pos += 1;
        self.offset += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    /// Steps back over the character returned by the last `read`. Only one level deep.
    fn unread(&mut self) {
        if let Some(mark) = self.back.take() {
            self.reset(mark);
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn text_from(&self, start: usize) -> String {
        self.source[start..self.pos].iter().collect()
    }

    fn token(&self, kind: TokenKind, start: usize, pos: Position) -> Token {
        Token {
            kind,
            text: self.text_from(start),
            pos,
        }
    }

    /// Skips whitespace and comments. Returns false if a block comment ran into end of input.
    fn skip_trivia(&mut self, diags: &mut Diagnostics) -> bool {
        loop {
            match self.current() {
                Some(ch) if ch.is_whitespace() => {
                    self.read();
                }
                Some('#') => {
                    let start = self.position();
                    self.read();
                    if self.current() == Some('*') {
                        self.read();
                        if !self.skip_block_comment() {
                            diags.error(
                                DiagnosticKind::Lexical,
                                Some(&start),
                                "unterminated block comment",
                            );
                            return false;
                        }
                    } else {
                        while let Some(ch) = self.current() {
                            if ch == '\n' {
                                break;
                            }
                            self.read();
                        }
                    }
                }
                _ => return true,
            }
        }
    }

    fn skip_block_comment(&mut self) -> bool {
        while let Some(ch) = self.read() {
            if ch == '*' {
                if self.read() == Some('#') {
                    return true;
                }
                self.unread();
            }
        }
        false
    }

    /// Produces the next token. Lexical errors are reported and skipped; the lexer keeps going.
    pub fn next_token(&mut self, diags: &mut Diagnostics) -> Token {
        loop {
            if !self.skip_trivia(diags) {
                return self.eof();
            }

            let pos = self.position();
            let start = self.pos;
            let Some(ch) = self.read() else {
                return self.eof();
            };

            let kind = match ch {
                '+' => TokenKind::Plus,
                '*' => TokenKind::Star,
                '/' => TokenKind::Slash,
                '.' => TokenKind::Dot,
                ':' => TokenKind::Colon,
                ';' => TokenKind::Semicolon,
                ',' => TokenKind::Comma,
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                '[' => TokenKind::LBracket,
                ']' => TokenKind::RBracket,
                '{' => TokenKind::LBrace,
                '}' => TokenKind::RBrace,
                '-' => self.munch('>', TokenKind::Arrow, TokenKind::Minus),
                '>' => self.munch('=', TokenKind::GtEq, TokenKind::Gt),
                '<' => self.munch('=', TokenKind::LtEq, TokenKind::Lt),
                '=' => self.munch('=', TokenKind::EqEq, TokenKind::Assign),
                '"' => match self.read_string(&pos, diags) {
                    Some(s) => TokenKind::Str(s),
                    None => return self.eof(),
                },
                '\'' => match self.read_char(&pos, diags) {
                    Some(c) => TokenKind::Char(c),
                    None => return self.eof(),
                },
                c if c.is_ascii_digit() => {
                    self.unread();
                    self.read_number(&pos, diags)
                }
                c if c.is_alphabetic() || c == '_' => {
                    self.unread();
                    self.read_identifier()
                }
                other => {
                    diags.error(
                        DiagnosticKind::Lexical,
                        Some(&pos),
                        format!("unknown character '{}'", other.escape_default()),
                    );
                    continue;
                }
            };

            return self.token(kind, start, pos);
        }
    }

    /// Maximal munch for two-character operators: reads ahead, un-reads on mismatch.
    fn munch(&mut self, second: char, long: TokenKind, short: TokenKind) -> TokenKind {
        match self.read() {
            Some(ch) if ch == second => long,
            Some(_) => {
                self.unread();
                short
            }
            None => short,
        }
    }

    fn eof(&self) -> Token {
        Token {
            kind: TokenKind::Eof,
            text: String::new(),
            pos: self.position(),
        }
    }

    fn read_escape(&mut self, diags: &mut Diagnostics) -> Option<u8> {
        let pos = self.position();
        let ch = self.read()?;
        let byte = match ch {
            'n' => b'\n',
            '0' => b'\0',
            '\\' => b'\\',
            '\'' => b'\'',
            '"' => b'"',
            other => {
                diags.error(
                    DiagnosticKind::Lexical,
                    Some(&pos),
                    format!("unknown escape sequence '\\{}'", other.escape_default()),
                );
                other as u8
            }
        };
        Some(byte)
    }

    /// Reads the body of a string literal after the opening quote.
    /// Returns `None` when the input ends before the closing quote.
    fn read_string(&mut self, start: &Position, diags: &mut Diagnostics) -> Option<String> {
        let mut bytes = Vec::new();
        loop {
            match self.read() {
                Some('"') => return Some(String::from_utf8_lossy(&bytes).into_owned()),
                Some('\\') => match self.read_escape(diags) {
                    Some(b) => bytes.push(b),
                    None => break,
                },
                Some('\n') => {
                    diags.error(
                        DiagnosticKind::Lexical,
                        Some(start),
                        "unterminated string literal (newline before closing quote)",
                    );
                    return Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                Some(ch) => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
                None => break,
            }
        }
        diags.error(DiagnosticKind::Lexical, Some(start), "unterminated string literal");
        None
    }

    fn read_char(&mut self, start: &Position, diags: &mut Diagnostics) -> Option<u8> {
        let value = match self.read()? {
            '\\' => self.read_escape(diags)?,
            '\'' => {
                diags.error(DiagnosticKind::Lexical, Some(start), "empty character literal");
                return Some(0);
            }
            ch if ch.is_ascii() => ch as u8,
            ch => {
                diags.error(
                    DiagnosticKind::Lexical,
                    Some(start),
                    format!("character literal '{}' is not a single byte", ch),
                );
                b'?'
            }
        };

        match self.read() {
            Some('\'') => Some(value),
            Some(_) => {
                self.unread();
                diags.error(
                    DiagnosticKind::Lexical,
                    Some(start),
                    "unterminated character literal",
                );
                Some(value)
            }
            None => {
                diags.error(
                    DiagnosticKind::Lexical,
                    Some(start),
                    "unterminated character literal",
                );
                None
            }
        }
    }

    fn read_number(&mut self, start: &Position, diags: &mut Diagnostics) -> TokenKind {
        let mut digits = String::new();
        let mut dots = 0;

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.read();
            } else if ch == '.' {
                // `1.x` is member access on a literal, not a float
                self.read();
                let follows_digit = self.current().is_some_and(|c| c.is_ascii_digit());
                if !follows_digit && dots == 0 {
                    self.unread();
                    break;
                }
                dots += 1;
                digits.push('.');
            } else {
                break;
            }
        }

        if dots > 1 {
            diags.error(
                DiagnosticKind::Lexical,
                Some(start),
                format!("malformed float literal '{}'", digits),
            );
            return TokenKind::Float(0.0);
        }

        if dots == 1 {
            match digits.parse::<f64>() {
                Ok(v) => TokenKind::Float(v),
                Err(_) => {
                    diags.error(
                        DiagnosticKind::Lexical,
                        Some(start),
                        format!("malformed float literal '{}'", digits),
                    );
                    TokenKind::Float(0.0)
                }
            }
        } else {
            match digits.parse::<i64>() {
                Ok(v) => TokenKind::Integer(v),
                Err(_) => {
                    diags.error(
                        DiagnosticKind::Lexical,
                        Some(start),
                        format!("integer literal '{}' is too large", digits),
                    );
                    TokenKind::Integer(0)
                }
            }
        }
    }

    fn read_identifier(&mut self) -> TokenKind {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.read();
            } else {
                break;
            }
        }

        TokenKind::keyword(&ident).unwrap_or(TokenKind::Name(ident))
    }

    /// Lexes the whole input, including the trailing `Eof`.
    pub fn tokenize(&mut self, diags: &mut Diagnostics) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token(diags);
            let done = token.is_eof();
            tokens.push(token);
            if done {
                return tokens;
            }
        }
    }
}
