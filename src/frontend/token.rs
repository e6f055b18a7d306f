use std::fmt;
use std::rc::Rc;

/// A location in a source file.
///
/// `line` and `col` are 1-based, `offset` is the byte offset from the start of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub line: u32,
    pub col: u32,
    pub offset: usize,
    pub file: Rc<str>,
}

impl Position {
    pub fn start(file: Rc<str>) -> Self {
        Position {
            line: 1,
            col: 1,
            offset: 0,
            file,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Integer(i64),
    Float(f64),
    Char(u8),
    Str(String),
    Name(String),

    // Keywords
    Func,
    Class,
    Let,
    Return,
    If,
    For,
    While,
    From,
    Import,
    Ref,
    Array,
    Copy,
    As,
    Typename,
    Typesize,
    Typeof,
    Auto,
    To,
    True,
    False,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Gt,
    Lt,
    GtEq,
    LtEq,
    EqEq,
    Assign,
    Dot,
    Arrow,
    Colon,
    Semicolon,
    Comma,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    Eof,
}

impl TokenKind {
    /// Looks up the keyword table.
    pub fn keyword(ident: &str) -> Option<TokenKind> {
        let kind = match ident {
            "func" => TokenKind::Func,
            "class" => TokenKind::Class,
            "let" => TokenKind::Let,
            "return" => TokenKind::Return,
            "if" => TokenKind::If,
            "for" => TokenKind::For,
            "while" => TokenKind::While,
            "from" => TokenKind::From,
            "import" => TokenKind::Import,
            "ref" => TokenKind::Ref,
            "array" => TokenKind::Array,
            "copy" => TokenKind::Copy,
            "as" => TokenKind::As,
            "typename" => TokenKind::Typename,
            "typesize" => TokenKind::Typesize,
            "typeof" => TokenKind::Typeof,
            "auto" => TokenKind::Auto,
            "to" => TokenKind::To,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            _ => return None,
        };
        Some(kind)
    }

    /// True when two kinds are the same variant, ignoring literal payloads.
    pub fn same_variant(&self, other: &TokenKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Integer(n) => write!(f, "{}", n),
            TokenKind::Float(n) => write!(f, "{}", n),
            TokenKind::Char(c) => write!(f, "'{}'", (*c as char).escape_default()),
            TokenKind::Str(s) => write!(f, "\"{}\"", s.escape_default()),
            TokenKind::Name(s) => write!(f, "{}", s),
            TokenKind::Func => write!(f, "func"),
            TokenKind::Class => write!(f, "class"),
            TokenKind::Let => write!(f, "let"),
            TokenKind::Return => write!(f, "return"),
            TokenKind::If => write!(f, "if"),
            TokenKind::For => write!(f, "for"),
            TokenKind::While => write!(f, "while"),
            TokenKind::From => write!(f, "from"),
            TokenKind::Import => write!(f, "import"),
            TokenKind::Ref => write!(f, "ref"),
            TokenKind::Array => write!(f, "array"),
            TokenKind::Copy => write!(f, "copy"),
            TokenKind::As => write!(f, "as"),
            TokenKind::Typename => write!(f, "typename"),
            TokenKind::Typesize => write!(f, "typesize"),
            TokenKind::Typeof => write!(f, "typeof"),
            TokenKind::Auto => write!(f, "auto"),
            TokenKind::To => write!(f, "to"),
            TokenKind::True => write!(f, "true"),
            TokenKind::False => write!(f, "false"),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::GtEq => write!(f, ">="),
            TokenKind::LtEq => write!(f, "<="),
            TokenKind::EqEq => write!(f, "=="),
            TokenKind::Assign => write!(f, "="),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Arrow => write!(f, "->"),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::LBracket => write!(f, "["),
            TokenKind::RBracket => write!(f, "]"),
            TokenKind::LBrace => write!(f, "{{"),
            TokenKind::RBrace => write!(f, "}}"),
            TokenKind::Eof => write!(f, "end of file"),
        }
    }
}

/// A lexed token. `text` is the raw lexeme as it appeared in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pos: Position,
}

impl Token {
    pub fn is(&self, kind: &TokenKind) -> bool {
        self.kind.same_variant(kind)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }
}
