use std::rc::Rc;

use crate::frontend::parse_error::{ParseError, ParseResult};
use crate::frontend::token::{Position, TokenKind};
use crate::lang::expr::{BinaryOp, CastKind, Expr, ExprKind, Literal};

use super::Parser;

const MIN_INT_MAGNITUDE: i64 = 1 << 31;

impl Parser<'_> {
    /// Parses an expression. Nothing is resolved here; callers resolve once the
    /// whole expression is known.
    ///
    /// ```text
    /// expr       := additive (("<" | ">" | "<=" | ">=" | "==") additive)*
    /// additive   := term (("+" | "-") term)*
    /// term       := unary (("*" | "/") unary)*
    /// unary      := ("ref" | "copy" | "-") unary | postfix
    /// postfix    := primary ("[" expr "]" | "." NAME | "as" type)*
    /// ```
    pub(super) fn parse_expression(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_additive()?;
        while let Some(op) = self.comparison_op() {
            let pos = self.advance().pos;
            let right = self.parse_additive()?;
            left = binary(op, left, right, pos);
        }
        Ok(left)
    }

    fn comparison_op(&self) -> Option<BinaryOp> {
        match self.current.kind {
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::LtEq => Some(BinaryOp::Le),
            TokenKind::GtEq => Some(BinaryOp::Ge),
            TokenKind::EqEq => Some(BinaryOp::Eq),
            _ => None,
        }
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            let pos = self.advance().pos;
            let right = self.parse_term()?;
            left = binary(op, left, right, pos);
        }
    }

    fn parse_term(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(left),
            };
            let pos = self.advance().pos;
            let right = self.parse_unary()?;
            left = binary(op, left, right, pos);
        }
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let pos = self.current.pos.clone();
        match self.current.kind {
            TokenKind::Ref => {
                self.advance();
                let inner = self.parse_unary()?;
                Ok(Expr::new(ExprKind::RefOf(Box::new(inner)), pos))
            }
            TokenKind::Copy => {
                self.advance();
                let inner = self.parse_unary()?;
                Ok(Expr::new(ExprKind::Copy(Box::new(inner)), pos))
            }
            TokenKind::Minus => {
                self.advance();
                // i32::MIN has no positive literal.
                if matches!(self.current.kind, TokenKind::Integer(v) if v == MIN_INT_MAGNITUDE) {
                    self.advance();
                    let literal = Expr::literal(Literal::Int(i32::MIN), pos);
                    return self.parse_postfix_chain(literal);
                }
                let inner = self.parse_unary()?;
                Ok(negate(inner, pos))
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix_chain(primary)
            }
        }
    }

    fn parse_postfix_chain(&mut self, mut expr: Expr) -> ParseResult<Expr> {
        loop {
            let pos = self.current.pos.clone();
            match self.current.kind {
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&TokenKind::RBracket)?;
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        pos,
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let (name, _) = self.expect_name("attribute name after '.'")?;
                    expr = Expr::new(
                        ExprKind::Member {
                            base: Box::new(expr),
                            name,
                            offset: 0,
                        },
                        pos,
                    );
                }
                TokenKind::As => {
                    self.advance();
                    let target = self.parse_type()?;
                    expr = Expr::new(
                        ExprKind::Cast {
                            inner: Box::new(expr),
                            target,
                            kind: CastKind::Pending,
                        },
                        pos,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    /// ```text
    /// primary := INT | FLOAT | CHAR | STRING | "true" | "false"
    ///          | NAME | NAME "(" args ")" | "(" expr ")" | "[" expr ("," expr)* "]"
    ///          | "typesize" "(" type ")" | "typename" "(" type ")"
    /// ```
    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let pos = self.current.pos.clone();
        let literal = match &self.current.kind {
            TokenKind::Integer(value) => {
                let value = i32::try_from(*value).map_err(|_| {
                    ParseError::syntax(&pos, format!("integer literal '{}' is out of range", value))
                })?;
                Some(Literal::Int(value))
            }
            TokenKind::Float(value) => Some(Literal::Float(*value as f32)),
            TokenKind::Char(value) => Some(Literal::Char(*value)),
            TokenKind::Str(value) => Some(Literal::Str(Rc::from(value.as_bytes()))),
            TokenKind::True => Some(Literal::Bool(true)),
            TokenKind::False => Some(Literal::Bool(false)),
            _ => None,
        };
        if let Some(literal) = literal {
            self.advance();
            return Ok(Expr::literal(literal, pos));
        }

        match self.current.kind {
            TokenKind::Name(_) => {
                let (name, pos) = self.expect_name("a name")?;
                if self.check(&TokenKind::LParen) {
                    let args = self.parse_arguments()?;
                    Ok(Expr::new(
                        ExprKind::Call {
                            name,
                            args,
                            symbol: None,
                        },
                        pos,
                    ))
                } else {
                    Ok(Expr::new(ExprKind::Name { name, symbol: None }, pos))
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        elements.push(self.parse_expression()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBracket)?;
                Ok(Expr::new(ExprKind::ArrayLiteral(elements), pos))
            }
            TokenKind::Typesize => {
                self.advance();
                self.expect(&TokenKind::LParen)?;
                let ty = self.parse_type()?;
                self.expect(&TokenKind::RParen)?;
                if !self.types.is_sized(&ty) {
                    return Err(ParseError::semantic(
                        &pos,
                        format!("the size of '{}' is not known here", self.display(&ty)),
                    ));
                }
                let size = self.types.size_of(&ty);
                Ok(Expr::literal(Literal::Int(size as i32), pos))
            }
            TokenKind::Typename => {
                self.advance();
                self.expect(&TokenKind::LParen)?;
                let ty = self.parse_type()?;
                self.expect(&TokenKind::RParen)?;
                let name = self.display(&ty);
                Ok(Expr::literal(Literal::Str(Rc::from(name.as_bytes())), pos))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parse_arguments(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(args)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr, pos: Position) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        pos,
    )
}

/// `-x`. Numeric literals fold; anything else becomes `0 - x`.
fn negate(inner: Expr, pos: Position) -> Expr {
    match inner.kind {
        ExprKind::Literal(Literal::Int(v)) => Expr::literal(Literal::Int(v.wrapping_neg()), pos),
        ExprKind::Literal(Literal::Float(v)) => Expr::literal(Literal::Float(-v), pos),
        kind => {
            let inner = Expr::new(kind, inner.pos);
            let zero = Expr::literal(Literal::Int(0), pos.clone());
            binary(BinaryOp::Sub, zero, inner, pos)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CompileContext;

    /// Parses `source` as a single expression.
    fn expr(source: &str) -> Expr {
        let mut ctx = CompileContext::new("t", source);
        let mut parser = Parser::new(&mut ctx);
        let expr = parser.parse_expression().expect("expression should parse");
        assert!(parser.current.is_eof(), "trailing tokens after {:?}", source);
        expr
    }

    fn shape(e: &Expr) -> String {
        match &e.kind {
            ExprKind::Literal(Literal::Int(v)) => v.to_string(),
            ExprKind::Literal(Literal::Float(v)) => format!("{:?}", v),
            ExprKind::Literal(Literal::Bool(v)) => v.to_string(),
            ExprKind::Literal(Literal::Char(c)) => format!("'{}'", *c as char),
            ExprKind::Literal(Literal::Str(s)) => format!("{:?}", String::from_utf8_lossy(s)),
            ExprKind::Name { name, .. } => name.to_string(),
            ExprKind::Call { name, args, .. } => {
                let args: Vec<String> = args.iter().map(shape).collect();
                format!("{}({})", name, args.join(", "))
            }
            ExprKind::Binary { op, left, right } => {
                format!("({} {} {})", shape(left), op, shape(right))
            }
            ExprKind::Index { base, index } => format!("{}[{}]", shape(base), shape(index)),
            ExprKind::Member { base, name, .. } => format!("{}.{}", shape(base), name),
            ExprKind::Cast { inner, .. } => format!("({} as _)", shape(inner)),
            ExprKind::RefOf(inner) => format!("(ref {})", shape(inner)),
            ExprKind::Copy(inner) => format!("(copy {})", shape(inner)),
            ExprKind::ArrayLiteral(items) => {
                let items: Vec<String> = items.iter().map(shape).collect();
                format!("[{}]", items.join(", "))
            }
        }
    }

    #[test]
    fn test_precedence() {
        assert_eq!(shape(&expr("2 + 3 * 4")), "(2 + (3 * 4))");
        assert_eq!(shape(&expr("(2 + 3) * 4")), "((2 + 3) * 4)");
        assert_eq!(shape(&expr("1 + 2 < 3 * 4")), "((1 + 2) < (3 * 4))");
        assert_eq!(shape(&expr("10 - 4 - 3")), "((10 - 4) - 3)");
        assert_eq!(shape(&expr("8 / 2 / 2")), "((8 / 2) / 2)");
    }

    #[test]
    fn test_postfix_chains_left_to_right() {
        assert_eq!(shape(&expr("a.b[1].c")), "a.b[1].c");
        assert_eq!(shape(&expr("x as float + 1")), "((x as _) + 1)");
        assert_eq!(shape(&expr("f(1, g(2))[0]")), "f(1, g(2))[0]");
    }

    #[test]
    fn test_prefix_operators() {
        assert_eq!(shape(&expr("ref a[2]")), "(ref a[2])");
        assert_eq!(shape(&expr("copy r + 1")), "((copy r) + 1)");
        assert_eq!(shape(&expr("-5")), "-5");
        assert_eq!(shape(&expr("-2.5")), "-2.5");
        assert_eq!(shape(&expr("-x * 2")), "((0 - x) * 2)");
    }

    #[test]
    fn test_literals() {
        assert_eq!(shape(&expr("[1, 2, 3]")), "[1, 2, 3]");
        assert_eq!(shape(&expr("'a'")), "'a'");
        assert_eq!(shape(&expr("\"hi\"")), "\"hi\"");
        assert_eq!(shape(&expr("true == false")), "(true == false)");
    }

    #[test]
    fn test_typesize_and_typename_fold() {
        assert_eq!(shape(&expr("typesize(float) * 2")), "(4 * 2)");
        assert_eq!(shape(&expr("typename(array[3] int)")), "\"array[3] int\"");
    }

    fn expr_error(source: &str) -> String {
        let mut ctx = CompileContext::new("t", source);
        let mut parser = Parser::new(&mut ctx);
        parser.parse_expression().unwrap_err().message
    }

    #[test]
    fn test_integer_out_of_range() {
        assert!(expr_error("3000000000").contains("out of range"));
        assert!(expr_error("2147483648").contains("out of range"));
        assert!(expr_error("-2147483649").contains("out of range"));
    }

    #[test]
    fn test_most_negative_int_literal() {
        assert_eq!(shape(&expr("-2147483648")), "-2147483648");
        assert_eq!(shape(&expr("-2147483648 + 1")), "(-2147483648 + 1)");
        assert_eq!(shape(&expr("-2147483648 as float")), "(-2147483648 as _)");
        assert_eq!(expr("-2147483648").const_int(), Some(i64::from(i32::MIN)));
    }

    #[test]
    fn test_negation_lowering_is_constant() {
        assert_eq!(shape(&expr("-(1 + 2)")), "(0 - (1 + 2))");
        assert_eq!(expr("-(1 + 2)").const_int(), Some(-3));
        assert_eq!(expr("-(-3)").const_int(), Some(3));
        assert_eq!(expr("-(4 * 2) / 2").const_int(), Some(-4));
        assert_eq!(expr("-x").const_int(), None);
    }
}
