use std::fmt;
use std::rc::Rc;

use crate::frontend::token::Position;
use crate::lang::symbol::Symbol;
use crate::lang::types::{DataType, Primitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 9] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Gt,
        BinaryOp::Lt,
        BinaryOp::Ge,
        BinaryOp::Le,
        BinaryOp::Eq,
    ];

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le | BinaryOp::Eq
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Gt => ">",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "==",
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Gt => "gt",
            BinaryOp::Lt => "lt",
            BinaryOp::Ge => "ge",
            BinaryOp::Le => "le",
            BinaryOp::Eq => "eq",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// The kind both operands are promoted to before the operation runs.
    ///
    /// `float` wins over everything, `int` wins over `char`. `bool` takes part in
    /// no arithmetic or comparison.
    pub fn operand_kind(left: Primitive, right: Primitive) -> Option<Primitive> {
        use Primitive::*;
        match (left, right) {
            (Bool, _) | (_, Bool) => None,
            (Float, _) | (_, Float) => Some(Float),
            (Int, _) | (_, Int) => Some(Int),
            (Char, Char) => Some(Char),
        }
    }

    /// Result kind of `left op right`, or `None` if the combination is undefined.
    pub fn result_kind(self, left: Primitive, right: Primitive) -> Option<Primitive> {
        let kind = Self::operand_kind(left, right)?;
        if self.is_comparison() {
            Some(Primitive::Bool)
        } else {
            Some(kind)
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i32),
    Float(f32),
    Char(u8),
    Bool(bool),
    /// String bytes without the trailing NUL; typed as `array[len + 1] char`.
    Str(Rc<[u8]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    /// Not yet resolved.
    Pending,
    /// Same type; emits nothing.
    Identity,
    /// Reading through a reference; emits nothing since rvalues of references
    /// already produce the referent.
    Deref,
    /// `array[N] T` (or a reference to one) viewed as `ref T`.
    Decay,
    Primitive { from: Primitive, to: Primitive },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Name {
        name: Rc<str>,
        symbol: Option<Rc<Symbol>>,
    },
    Call {
        name: Rc<str>,
        args: Vec<Expr>,
        symbol: Option<Rc<Symbol>>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// Member access; `offset` is filled in by the resolver.
    Member {
        base: Box<Expr>,
        name: Rc<str>,
        offset: u32,
    },
    Cast {
        inner: Box<Expr>,
        target: DataType,
        kind: CastKind,
    },
    RefOf(Box<Expr>),
    Copy(Box<Expr>),
    ArrayLiteral(Vec<Expr>),
}

/// An expression tree node. `ty` is `DataType::Auto` until the resolver runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: DataType,
    pub pos: Position,
}

impl Expr {
    pub fn new(kind: ExprKind, pos: Position) -> Self {
        Expr {
            kind,
            ty: DataType::Auto,
            pos,
        }
    }

    pub fn typed(kind: ExprKind, ty: DataType, pos: Position) -> Self {
        Expr { kind, ty, pos }
    }

    pub fn literal(literal: Literal, pos: Position) -> Self {
        Expr::new(ExprKind::Literal(literal), pos)
    }

    /// Folds integer literal arithmetic. Used for array sizes and constant indexes.
    ///
    /// Covers `int` literals combined with `+ - * /`. Unary minus needs no case of its
    /// own: the parser folds it into a literal or lowers it to `0 - x`. Char literals,
    /// casts and comparisons are not constants here.
    pub fn const_int(&self) -> Option<i64> {
        match &self.kind {
            ExprKind::Literal(Literal::Int(v)) => Some(i64::from(*v)),
            ExprKind::Binary { op, left, right } => {
                let l = left.const_int()?;
                let r = right.const_int()?;
                match op {
                    BinaryOp::Add => l.checked_add(r),
                    BinaryOp::Sub => l.checked_sub(r),
                    BinaryOp::Mul => l.checked_mul(r),
                    BinaryOp::Div => l.checked_div(r),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}
