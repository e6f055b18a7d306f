//! Expression typing: operand promotion, overload selection, implicit casts and
//! lvalue classification.
//!
//! Resolution runs while a statement is being parsed, against the scope state at that
//! point, so every name in the resolved tree carries the symbol it referred to.

use std::rc::Rc;

use crate::diagnostics::Diagnostics;
use crate::frontend::parse_error::{ParseError, ParseResult};
use crate::frontend::token::Position;
use crate::lang::expr::{BinaryOp, CastKind, Expr, ExprKind, Literal};
use crate::lang::node::{Ast, NodeId};
use crate::lang::symbol::Symbol;
use crate::lang::types::{DataType, Primitive, TypeTable};

/// Where an assignable expression lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lvalue {
    /// Address known at compile time: a frame offset or a global address.
    Static,
    /// Address computed at run time, through a reference or an index.
    Dynamic,
}

/// Classifies `expr` as an lvalue, or `None` if it cannot be assigned to.
pub fn classify(expr: &Expr) -> Option<Lvalue> {
    match &expr.kind {
        ExprKind::Name {
            symbol: Some(symbol),
            ..
        } if symbol.is_storage() => {
            if expr.ty.is_reference() {
                Some(Lvalue::Dynamic)
            } else {
                Some(Lvalue::Static)
            }
        }
        ExprKind::Index { base, index } => match classify(base) {
            Some(Lvalue::Static) if !base.ty.is_reference() && index.const_int().is_some() => {
                Some(Lvalue::Static)
            }
            Some(_) => Some(Lvalue::Dynamic),
            None if base.ty.is_reference() => Some(Lvalue::Dynamic),
            None => None,
        },
        ExprKind::Member { base, .. } => match classify(base) {
            Some(Lvalue::Static) if !base.ty.is_reference() => Some(Lvalue::Static),
            Some(_) => Some(Lvalue::Dynamic),
            None if base.ty.is_reference() => Some(Lvalue::Dynamic),
            None => None,
        },
        _ => None,
    }
}

/// The conversion applied when a value of type `from` is used where `to` is expected.
///
/// Returns `None` when no implicit conversion exists.
pub fn implicit_cast(from: &DataType, to: &DataType) -> Option<CastKind> {
    if from == to {
        return Some(CastKind::Identity);
    }

    let value = from.value_type();
    if value == to {
        return Some(CastKind::Deref);
    }

    if let (Some(from), Some(to)) = (value.primitive(), to.primitive()) {
        return Some(CastKind::Primitive { from, to });
    }

    if let (DataType::Array { element, .. }, DataType::Reference(target)) = (value, to) {
        if element == target {
            return Some(CastKind::Decay);
        }
    }

    None
}

/// True when a primitive conversion may lose data.
pub fn is_narrowing(kind: CastKind) -> bool {
    match kind {
        CastKind::Primitive { from, to } => to.rank() < from.rank(),
        _ => false,
    }
}

/// Resolves expressions against the scope chain visible from one node.
pub struct Resolver<'a> {
    ast: &'a Ast,
    types: &'a TypeTable,
    scope: NodeId,
    diags: &'a mut Diagnostics,
}

impl<'a> Resolver<'a> {
    pub fn new(ast: &'a Ast, types: &'a TypeTable, scope: NodeId, diags: &'a mut Diagnostics) -> Self {
        Resolver {
            ast,
            types,
            scope,
            diags,
        }
    }

    fn display(&self, ty: &DataType) -> String {
        self.types.display(ty)
    }

    /// Types `expr` and everything below it, inserting implicit casts where needed.
    pub fn resolve(&mut self, expr: &mut Expr) -> ParseResult<()> {
        let pos = expr.pos.clone();
        let ty = match &mut expr.kind {
            ExprKind::Literal(literal) => match literal {
                Literal::Int(_) => DataType::int(),
                Literal::Float(_) => DataType::float(),
                Literal::Char(_) => DataType::char(),
                Literal::Bool(_) => DataType::bool(),
                Literal::Str(bytes) => DataType::array(DataType::char(), bytes.len() as u32 + 1),
            },

            ExprKind::Name { name, symbol } => {
                let found = self.lookup_value(name, &pos)?;
                let ty = found.ty.clone();
                *symbol = Some(found);
                ty
            }

            ExprKind::Call { name, args, symbol } => {
                for arg in args.iter_mut() {
                    self.resolve(arg)?;
                }
                let callee = self.select_overload(name, &args[..], &pos)?;
                for (arg, param) in args.iter_mut().zip(&callee.params) {
                    self.coerce(arg, param)?;
                }
                let ty = callee.ty.clone();
                *symbol = Some(callee);
                ty
            }

            ExprKind::Binary { op, left, right } => {
                self.resolve(left)?;
                self.resolve(right)?;
                let kinds = (
                    left.ty.value_type().primitive(),
                    right.ty.value_type().primitive(),
                );
                match kinds {
                    (Some(l), Some(r)) => match op.result_kind(l, r) {
                        Some(kind) => DataType::primitive_type(kind),
                        None => return Err(self.operand_error(*op, left, right, &pos)),
                    },
                    _ => return Err(self.operand_error(*op, left, right, &pos)),
                }
            }

            ExprKind::Index { base, index } => {
                self.resolve(base)?;
                self.resolve(index)?;
                let (element, count) = match &base.ty {
                    DataType::Array { element, count } => ((**element).clone(), Some(*count)),
                    DataType::Reference(inner) => match &**inner {
                        DataType::Array { element, count } => ((**element).clone(), Some(*count)),
                        other => (other.clone(), None),
                    },
                    other => {
                        return Err(ParseError::semantic(
                            &pos,
                            format!("cannot index into a value of type '{}'", self.display(other)),
                        ));
                    }
                };
                match index.ty.value_type().primitive() {
                    Some(Primitive::Int | Primitive::Char) => {
                        self.coerce(index, &DataType::int())?;
                    }
                    _ => {
                        return Err(ParseError::semantic(
                            &index.pos,
                            format!(
                                "array index must be an integer, found '{}'",
                                self.display(&index.ty)
                            ),
                        ));
                    }
                }
                if let (Some(count), Some(at)) = (count, index.const_int()) {
                    if at < 0 || at >= i64::from(count) {
                        return Err(ParseError::semantic(
                            &index.pos,
                            format!("index {} out of range for array[{}]", at, count),
                        ));
                    }
                }
                element
            }

            ExprKind::Member { base, name, offset } => {
                self.resolve(base)?;
                let base_ty = base.ty.value_type().clone();
                let attribute = match &base_ty {
                    DataType::Named(id) => self.types.get(*id).attribute(name).cloned(),
                    _ => None,
                };
                let Some(attribute) = attribute else {
                    return Err(ParseError::semantic(
                        &pos,
                        format!("'{}' has no attribute '{}'", self.display(&base_ty), name),
                    ));
                };
                *offset = attribute.offset;
                attribute.ty
            }

            ExprKind::Cast {
                inner,
                target,
                kind,
                ..
            } => {
                self.resolve(inner)?;
                let Some(cast) = implicit_cast(&inner.ty, target) else {
                    return Err(ParseError::semantic(
                        &pos,
                        format!(
                            "cannot cast '{}' to '{}'",
                            self.display(&inner.ty),
                            self.display(target)
                        ),
                    ));
                };
                if is_narrowing(cast) {
                    self.warn_narrowing(&inner.ty, target, &pos);
                }
                *kind = cast;
                target.clone()
            }

            ExprKind::RefOf(inner) => {
                self.resolve(inner)?;
                if classify(inner).is_none() && !inner.ty.is_reference() {
                    return Err(ParseError::semantic(
                        &pos,
                        "cannot take a reference to a temporary value",
                    ));
                }
                DataType::reference(inner.ty.value_type().clone())
            }

            ExprKind::Copy(inner) => {
                self.resolve(inner)?;
                inner.ty.value_type().clone()
            }

            ExprKind::ArrayLiteral(elements) => {
                let Some((first, rest)) = elements.split_first_mut() else {
                    return Err(ParseError::semantic(&pos, "empty array literal"));
                };
                self.resolve(first)?;
                let element = first.ty.value_type().clone();
                if element.is_null() {
                    return Err(ParseError::semantic(&first.pos, "array element has no value"));
                }
                for item in rest.iter_mut() {
                    self.resolve(item)?;
                    self.coerce(item, &element)?;
                }
                DataType::array(element, elements.len() as u32)
            }
        };

        expr.ty = ty;
        Ok(())
    }

    fn lookup_value(&self, name: &str, pos: &Position) -> ParseResult<Rc<Symbol>> {
        match self.ast.lookup(self.scope, name) {
            Some(symbol) if symbol.is_storage() => Ok(symbol),
            Some(_) => Err(ParseError::semantic(
                pos,
                format!("'{}' is a function and cannot be used as a value", name),
            )),
            None => Err(ParseError::semantic(
                pos,
                format!("undefined symbol '{}'", name),
            )),
        }
    }

    fn operand_error(&self, op: BinaryOp, left: &Expr, right: &Expr, pos: &Position) -> ParseError {
        ParseError::semantic(
            pos,
            format!(
                "invalid operand types '{}' and '{}' for '{}'",
                self.display(&left.ty),
                self.display(&right.ty),
                op
            ),
        )
    }

    fn warn_narrowing(&mut self, from: &DataType, to: &DataType, pos: &Position) {
        let message = format!(
            "possible loss of data converting '{}' to '{}'",
            self.display(from.value_type()),
            self.display(to)
        );
        self.diags.warning(Some(pos), message);
    }

    /// Wraps an already resolved `expr` in the implicit cast to `target`.
    pub fn coerce(&mut self, expr: &mut Expr, target: &DataType) -> ParseResult<()> {
        let Some(kind) = implicit_cast(&expr.ty, target) else {
            return Err(ParseError::semantic(
                &expr.pos,
                format!(
                    "cannot convert '{}' to '{}'",
                    self.display(&expr.ty),
                    self.display(target)
                ),
            ));
        };
        if kind == CastKind::Identity {
            return Ok(());
        }
        if is_narrowing(kind) {
            self.warn_narrowing(&expr.ty, target, &expr.pos);
        }

        let pos = expr.pos.clone();
        let placeholder = Expr::literal(Literal::Bool(false), pos.clone());
        let inner = std::mem::replace(expr, placeholder);
        *expr = Expr::typed(
            ExprKind::Cast {
                inner: Box::new(inner),
                target: target.clone(),
                kind,
            },
            target.clone(),
            pos,
        );
        Ok(())
    }

    /// Picks the overload of `name` for `args`.
    ///
    /// An exact parameter match wins. Otherwise exactly one candidate may accept the
    /// arguments through implicit casts; two or more is an ambiguous call.
    fn select_overload(&self, name: &str, args: &[Expr], pos: &Position) -> ParseResult<Rc<Symbol>> {
        let candidates = self.ast.overloads(self.scope, name);
        if candidates.is_empty() {
            let message = match self.ast.lookup(self.scope, name) {
                Some(_) => format!("'{}' is not a function", name),
                None => format!("undefined function '{}'", name),
            };
            return Err(ParseError::semantic(pos, message));
        }

        let same_arity = || {
            candidates
                .iter()
                .filter(|c| c.params.len() == args.len())
        };

        if let Some(exact) =
            same_arity().find(|c| c.params.iter().zip(args).all(|(p, a)| *p == a.ty))
        {
            return Ok(exact.clone());
        }

        let viable: Vec<&Rc<Symbol>> = same_arity()
            .filter(|c| {
                c.params
                    .iter()
                    .zip(args)
                    .all(|(p, a)| implicit_cast(&a.ty, p).is_some())
            })
            .collect();

        match viable.as_slice() {
            [only] => Ok((*only).clone()),
            [] => Err(ParseError::semantic(
                pos,
                format!(
                    "could not find a function that matches `{}`",
                    self.call_signature(name, args)
                ),
            )),
            many => Err(ParseError::semantic(
                pos,
                format!(
                    "ambiguous call to `{}`: {} candidates match",
                    self.call_signature(name, args),
                    many.len()
                ),
            )),
        }
    }

    fn call_signature(&self, name: &str, args: &[Expr]) -> String {
        let types: Vec<String> = args.iter().map(|a| self.display(&a.ty)).collect();
        format!("{}({})", name, types.join(", "))
    }

    /// Resolves `expr` and checks that it reads as `expected`.
    pub fn expect_value(&mut self, expr: &mut Expr, expected: &DataType, what: &str) -> ParseResult<()> {
        self.resolve(expr)?;
        if expr.ty.value_type() != expected {
            return Err(ParseError::semantic(
                &expr.pos,
                format!(
                    "{} must be '{}', found '{}'",
                    what,
                    self.display(expected),
                    self.display(&expr.ty)
                ),
            ));
        }
        Ok(())
    }

    /// Resolves an assignment target and checks that it is an lvalue.
    pub fn resolve_target(&mut self, expr: &mut Expr) -> ParseResult<Lvalue> {
        self.resolve(expr)?;
        classify(expr).ok_or_else(|| ParseError::semantic(&expr.pos, "expression is not assignable"))
    }
}
