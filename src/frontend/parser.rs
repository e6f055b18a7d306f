mod expression;

use std::rc::Rc;

use crate::diagnostics::CompileContext;
use crate::frontend::lexer::{Lexer, LexerMark};
use crate::frontend::parse_error::{ParseError, ParseResult};
use crate::frontend::resolve::Resolver;
use crate::frontend::token::{Position, Token, TokenKind};
use crate::lang::expr::Expr;
use crate::lang::node::{Ast, ExternalDecl, FunctionDecl, NodeId, NodeKind, Param, ScopeId};
use crate::lang::symbol::{FrameAllocator, GLOBAL_BASE, Symbol, SymbolKind, argument_offset};
use crate::lang::types::{ConstructId, DataType, Primitive, TypeTable};

/// Result of parsing one source file: the typed tree and every construct it uses.
#[derive(Debug)]
pub struct ParsedModule {
    pub ast: Ast,
    pub types: TypeTable,
}

/// A class found by the header scan, laid out before anything else is parsed.
#[derive(Debug)]
struct ClassHeader {
    name: Rc<str>,
    pos: Position,
    body: LexerMark,
    construct: Option<ConstructId>,
}

/// Marks recorded by the header scan, in source order per item kind.
#[derive(Debug, Default)]
struct HeaderScan {
    classes: Vec<ClassHeader>,
    functions: Vec<LexerMark>,
    externals: Vec<LexerMark>,
    globals: Vec<LexerMark>,
}

/// A registered function whose body is still to be parsed.
#[derive(Debug)]
struct PendingBody {
    node: NodeId,
    body: LexerMark,
}

/// Two-pass recursive-descent parser.
///
/// Pass one walks the top-level items and records lexer marks without looking inside
/// bodies. Pass two lays out classes, registers every function and external header,
/// parses globals in source order and finally re-lexes each function body from its
/// mark. By the time a body is parsed every function in the file is visible, so calls
/// may refer to functions declared further down.
///
/// Expressions are resolved as soon as their statement is parsed; block scoping is
/// implemented by truncating the function's symbol table on block exit.
pub struct Parser<'a> {
    lexer: Lexer,
    ctx: &'a mut CompileContext,
    types: TypeTable,
    ast: Ast,
    current: Token,
    /// Lexer state just before `current` was lexed.
    current_mark: LexerMark,
    /// Node that new statements attach to; name lookups start here.
    parent: NodeId,
    /// Symbol table of the function being parsed, `None` at module level.
    locals: Option<ScopeId>,
    frame: FrameAllocator,
    return_type: DataType,
}

impl<'a> Parser<'a> {
    pub fn new(ctx: &'a mut CompileContext) -> Self {
        let mut lexer = Lexer::new(&ctx.source, ctx.file.clone());
        let current_mark = lexer.mark();
        let current = lexer.next_token(&mut ctx.diagnostics);
        let ast = Ast::new(Position::start(ctx.file.clone()));
        let parent = ast.root();
        let mut parser = Parser {
            lexer,
            ctx,
            types: TypeTable::new(),
            ast,
            current,
            current_mark,
            parent,
            locals: None,
            frame: FrameAllocator::new(),
            return_type: DataType::Null,
        };
        parser.register_primitives();
        parser
    }

    /// Parses the whole file. Problems are recorded in the context's diagnostics.
    pub fn parse(mut self) -> ParsedModule {
        let mut scan = self.scan_headers();
        tracing::debug!(
            classes = scan.classes.len(),
            functions = scan.functions.len(),
            externals = scan.externals.len(),
            globals = scan.globals.len(),
            "header scan complete"
        );

        self.layout_classes(&mut scan.classes);
        let bodies = self.register_functions(&scan.functions);
        self.register_externals(&scan.externals);
        self.parse_globals(&scan.globals);
        for pending in bodies {
            self.parse_function_body(pending);
        }

        ParsedModule {
            ast: self.ast,
            types: self.types,
        }
    }

    // ---- token plumbing ----

    fn advance(&mut self) -> Token {
        self.current_mark = self.lexer.mark();
        let next = self.lexer.next_token(&mut self.ctx.diagnostics);
        std::mem::replace(&mut self.current, next)
    }

    /// Rewinds the lexer to `mark` and reloads the current token.
    fn seek(&mut self, mark: LexerMark) {
        self.lexer.reset(mark);
        self.advance();
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.current.is(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::syntax(
            &self.current.pos,
            format!("expected {}, found '{}'", expected, self.current.kind),
        )
    }

    fn expect(&mut self, kind: &TokenKind) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("'{}'", kind)))
        }
    }

    fn expect_name(&mut self, what: &str) -> ParseResult<(Rc<str>, Position)> {
        match &self.current.kind {
            TokenKind::Name(name) => {
                let name = Rc::from(name.as_str());
                let token = self.advance();
                Ok((name, token.pos))
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn resolver(&mut self) -> Resolver<'_> {
        Resolver::new(&self.ast, &self.types, self.parent, &mut self.ctx.diagnostics)
    }

    fn display(&self, ty: &DataType) -> String {
        self.types.display(ty)
    }

    /// Skips to the end of the current statement: past the next `;`, or past the
    /// block that was opened while skipping, or up to an enclosing `}`.
    fn synchronize(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.current.kind {
                TokenKind::Eof => return,
                TokenKind::Semicolon if depth == 0 => {
                    self.advance();
                    return;
                }
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    if depth == 0 {
                        self.advance();
                        return;
                    }
                }
                _ => {}
            }
            self.advance();
        }
    }

    // ---- pass one ----

    fn is_item_start(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Func
                | TokenKind::Class
                | TokenKind::Let
                | TokenKind::Import
                | TokenKind::From
                | TokenKind::Eof
        )
    }

    /// Records where every top-level item starts without parsing bodies.
    fn scan_headers(&mut self) -> HeaderScan {
        let mut scan = HeaderScan::default();
        while !self.current.is_eof() {
            let mark = self.current_mark;
            match self.current.kind {
                TokenKind::Class => match self.scan_class() {
                    Ok(class) => scan.classes.push(class),
                    Err(err) => err.report(&mut self.ctx.diagnostics),
                },
                TokenKind::Func => {
                    scan.functions.push(mark);
                    self.skip_function();
                }
                TokenKind::From | TokenKind::Import => {
                    scan.externals.push(mark);
                    self.skip_declaration();
                }
                TokenKind::Let => {
                    scan.globals.push(mark);
                    self.skip_declaration();
                }
                _ => {
                    let err = self.unexpected("'func', 'class', 'import' or 'let'");
                    err.report(&mut self.ctx.diagnostics);
                    self.advance();
                    while !self.is_item_start() {
                        self.advance();
                    }
                }
            }
        }
        scan
    }

    /// ```text
    /// class <Name> { ... }
    /// ```
    fn scan_class(&mut self) -> ParseResult<ClassHeader> {
        self.advance(); // consume 'class'
        let (name, pos) = self.expect_name("class name")?;
        let body = self.current_mark;
        if !self.check(&TokenKind::LBrace) {
            let err = self.unexpected("'{' after the class name");
            self.skip_declaration();
            return Err(err);
        }
        self.skip_braces();
        Ok(ClassHeader {
            name,
            pos,
            body,
            construct: None,
        })
    }

    fn skip_function(&mut self) {
        self.advance(); // consume 'func'
        loop {
            match self.current.kind {
                TokenKind::LBrace => {
                    self.skip_braces();
                    return;
                }
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                _ if self.is_item_start() => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn skip_declaration(&mut self) {
        self.advance();
        while !self.is_item_start() {
            if self.advance().is(&TokenKind::Semicolon) {
                return;
            }
        }
    }

    /// Skips a balanced `{ ... }` group starting at the current `{`.
    fn skip_braces(&mut self) {
        let mut depth = 0usize;
        loop {
            let token = self.advance();
            match token.kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return;
                    }
                }
                TokenKind::Eof => return,
                _ => {}
            }
            if self.current.is_eof() {
                return;
            }
        }
    }

    // ---- pass two: classes ----

    fn register_primitives(&mut self) {
        let root = self.ast.root_scope();
        let primitives: Vec<(ConstructId, Rc<str>)> = self
            .types
            .primitives()
            .map(|(id, c)| (id, c.name.clone()))
            .collect();
        for (id, name) in primitives {
            self.ast.scope_mut(root).insert_construct(name, id);
        }
    }

    fn layout_classes(&mut self, classes: &mut [ClassHeader]) {
        let root_scope = self.ast.root_scope();
        let root = self.ast.root();
        for class in classes.iter_mut() {
            if self.ast.scope(root_scope).lookup_construct(&class.name).is_some() {
                ParseError::semantic(&class.pos, format!("type '{}' is already defined", class.name))
                    .report(&mut self.ctx.diagnostics);
                continue;
            }
            let id = self.types.declare_class(class.name.clone());
            self.ast
                .scope_mut(root_scope)
                .insert_construct(class.name.clone(), id);
            class.construct = Some(id);
            let node = self.ast.add(NodeKind::Class { construct: id }, Some(root), class.pos.clone());
            self.ast.push_item(node);
        }

        let mut stack = Vec::new();
        for index in 0..classes.len() {
            self.layout_class(classes, index, &mut stack);
        }
    }

    /// Computes the layout of one class, laying out classes it embeds by value first.
    ///
    /// `stack` holds the classes whose layout is in progress; meeting one of them again
    /// means the class would contain itself.
    fn layout_class(&mut self, classes: &[ClassHeader], index: usize, stack: &mut Vec<ConstructId>) {
        let header = &classes[index];
        let Some(id) = header.construct else {
            return;
        };
        if self.types.is_sized(&DataType::Named(id)) {
            return;
        }
        if stack.contains(&id) {
            ParseError::semantic(
                &header.pos,
                format!("type loop detected: class '{}' contains itself", header.name),
            )
            .report(&mut self.ctx.diagnostics);
            return;
        }

        stack.push(id);
        let fields = match self.parse_class_body(header) {
            Ok(fields) => fields,
            Err(err) => {
                err.report(&mut self.ctx.diagnostics);
                Vec::new()
            }
        };

        for (_, ty, _) in &fields {
            if let Some(dependency) = embedded_class(ty) {
                if let Some(dep_index) = classes.iter().position(|c| c.construct == Some(dependency)) {
                    self.layout_class(classes, dep_index, stack);
                }
            }
        }

        let size = self.types.define_class(
            id,
            fields.into_iter().map(|(name, ty, _)| (name, ty)).collect(),
        );
        tracing::debug!(class = %classes[index].name, size, "class laid out");
        stack.pop();
    }

    /// ```text
    /// { <name>: <type>; ... }
    /// ```
    fn parse_class_body(&mut self, header: &ClassHeader) -> ParseResult<Vec<(Rc<str>, DataType, Position)>> {
        self.seek(header.body);
        self.parent = self.ast.root();
        self.expect(&TokenKind::LBrace)?;

        let mut fields: Vec<(Rc<str>, DataType, Position)> = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.current.is_eof() {
            let (name, pos) = self.expect_name("attribute name")?;
            self.expect(&TokenKind::Colon)?;
            let ty = self.parse_type()?;
            if matches!(ty, DataType::Null | DataType::Auto) {
                return Err(ParseError::semantic(
                    &pos,
                    format!("attribute '{}' cannot have type '{}'", name, self.display(&ty)),
                ));
            }
            if fields.iter().any(|(n, _, _)| *n == name) {
                return Err(ParseError::semantic(
                    &pos,
                    format!("attribute '{}' is already defined in '{}'", name, header.name),
                ));
            }
            fields.push((name, ty, pos));

            if !self.eat(&TokenKind::Semicolon)
                && !self.eat(&TokenKind::Comma)
                && !self.check(&TokenKind::RBrace)
            {
                return Err(self.unexpected("';' after the attribute"));
            }
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(fields)
    }

    // ---- pass two: headers ----

    fn register_functions(&mut self, marks: &[LexerMark]) -> Vec<PendingBody> {
        let mut pending = Vec::new();
        for &mark in marks {
            self.seek(mark);
            match self.parse_function_header() {
                Ok(body) => pending.push(body),
                Err(err) => err.report(&mut self.ctx.diagnostics),
            }
        }
        pending
    }

    fn register_externals(&mut self, marks: &[LexerMark]) {
        for &mark in marks {
            self.seek(mark);
            if let Err(err) = self.parse_external() {
                err.report(&mut self.ctx.diagnostics);
            }
        }
    }

    /// ```text
    /// (<name>: <type> (, <name>: <type>)*)?
    /// ```
    fn parse_params(&mut self) -> ParseResult<Vec<Param>> {
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let (name, pos) = self.expect_name("parameter name")?;
                self.expect(&TokenKind::Colon)?;
                let ty = self.parse_type()?;
                if matches!(ty, DataType::Null | DataType::Auto) {
                    return Err(ParseError::semantic(
                        &pos,
                        format!("parameter '{}' cannot have type '{}'", name, self.display(&ty)),
                    ));
                }
                if params.iter().any(|p: &Param| p.name == name) {
                    return Err(ParseError::semantic(
                        &pos,
                        format!("parameter '{}' is already defined", name),
                    ));
                }
                params.push(Param { name, ty, pos });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(params)
    }

    fn parse_return_type(&mut self) -> ParseResult<DataType> {
        if !self.eat(&TokenKind::Arrow) {
            return Ok(DataType::Null);
        }
        let pos = self.current.pos.clone();
        let ty = self.parse_type()?;
        if matches!(ty, DataType::Auto) {
            return Err(ParseError::semantic(&pos, "return type cannot be 'auto'"));
        }
        Ok(ty)
    }

    /// Adds a callable to the module scope, rejecting a second definition with the
    /// same parameter types and clashes with non-callable names.
    fn declare_callable(&mut self, symbol: Symbol, pos: &Position) -> ParseResult<Rc<Symbol>> {
        let root = self.ast.root_scope();
        let scope = self.ast.scope(root);
        if scope
            .overloads(&symbol.name)
            .any(|other| other.params == symbol.params)
        {
            let params: Vec<String> = symbol.params.iter().map(|p| self.display(p)).collect();
            return Err(ParseError::semantic(
                pos,
                format!(
                    "function already defined: `{}({})`",
                    symbol.name,
                    params.join(", ")
                ),
            ));
        }
        if scope.lookup(&symbol.name).is_some_and(|s| !s.is_callable()) {
            return Err(ParseError::semantic(
                pos,
                format!("'{}' is already defined", symbol.name),
            ));
        }
        Ok(self.ast.scope_mut(root).insert(symbol))
    }

    /// ```text
    /// func <name>(<params>) (-> <type>)? { ... }
    /// ```
    ///
    /// Registers the function and its parameters; the body is only located.
    fn parse_function_header(&mut self) -> ParseResult<PendingBody> {
        self.parent = self.ast.root();
        let start = self.expect(&TokenKind::Func)?.pos;
        let (name, pos) = self.expect_name("function name")?;
        let params = self.parse_params()?;
        let return_type = self.parse_return_type()?;
        if !self.check(&TokenKind::LBrace) {
            return Err(self.unexpected(&format!("'{{' to start the body of '{}'", name)));
        }
        let body = self.current_mark;

        let index = self.ast.functions.len() as u32;
        let arg_size: u32 = params.iter().map(|p| self.types.size_of(&p.ty)).sum();
        let symbol = self.declare_callable(
            Symbol {
                name,
                ty: return_type,
                kind: SymbolKind::Function,
                location: index as i32,
                params: params.iter().map(|p| p.ty.clone()).collect(),
            },
            &pos,
        )?;

        let scope = self.ast.add_scope();
        let mut prefix = 0;
        for param in &params {
            let location = argument_offset(arg_size, prefix);
            prefix += self.types.size_of(&param.ty);
            self.ast.scope_mut(scope).insert(Symbol::variable(
                param.name.clone(),
                param.ty.clone(),
                SymbolKind::Argument,
                location,
            ));
        }

        let root = self.ast.root();
        let node = self.ast.add(
            NodeKind::Function(FunctionDecl {
                symbol,
                index,
                params,
                body: Vec::new(),
                scope: Some(scope),
                frame_size: 0,
                arg_size,
            }),
            Some(root),
            start,
        );
        self.ast.functions.push(node);
        self.ast.push_item(node);
        Ok(PendingBody { node, body })
    }

    /// ```text
    /// (from <lib>)? import func <name>(<params>) (-> <type>)? ;
    /// ```
    fn parse_external(&mut self) -> ParseResult<()> {
        self.parent = self.ast.root();
        let library = if self.eat(&TokenKind::From) {
            Some(self.expect_name("library name")?.0)
        } else {
            None
        };
        self.expect(&TokenKind::Import)?;
        self.expect(&TokenKind::Func)?;
        let (name, pos) = self.expect_name("function name")?;
        let params = self.parse_params()?;
        let return_type = self.parse_return_type()?;
        self.expect(&TokenKind::Semicolon)?;

        let link_name = match library {
            Some(library) => format!("{}.{}", library, name),
            None => name.to_string(),
        };
        let index = self.ast.externals.len() as u32;
        let symbol = self.declare_callable(
            Symbol {
                name,
                ty: return_type,
                kind: SymbolKind::External,
                location: index as i32,
                params: params.into_iter().map(|p| p.ty).collect(),
            },
            &pos,
        )?;
        self.ast.externals.push(ExternalDecl { symbol, link_name });
        Ok(())
    }

    // ---- pass two: globals and bodies ----

    fn parse_globals(&mut self, marks: &[LexerMark]) {
        self.parent = self.ast.root();
        self.locals = None;
        for &mark in marks {
            self.seek(mark);
            match self.parse_let() {
                Ok(node) => self.ast.push_item(node),
                Err(err) => err.report(&mut self.ctx.diagnostics),
            }
        }
    }

    fn parse_function_body(&mut self, pending: PendingBody) {
        let (scope, return_type) = match &self.ast.node(pending.node).kind {
            NodeKind::Function(decl) => (decl.scope, decl.symbol.ty.clone()),
            _ => return,
        };

        self.seek(pending.body);
        self.parent = pending.node;
        self.locals = scope;
        self.frame.reset();
        self.return_type = return_type;

        let body = match self.parse_block() {
            Ok(body) => body,
            Err(err) => {
                err.report(&mut self.ctx.diagnostics);
                Vec::new()
            }
        };

        let frame_size = self.frame.frame_size();
        if let NodeKind::Function(decl) = &mut self.ast.node_mut(pending.node).kind {
            tracing::debug!(function = %decl.symbol.name, frame_size, "body parsed");
            decl.body = body;
            decl.frame_size = frame_size;
        }
        self.locals = None;
        self.parent = self.ast.root();
    }

    // ---- statements ----

    fn enter_block(&mut self) {
        if let Some(scope) = self.locals {
            self.ast.scope_mut(scope).enter_scope();
        }
        self.frame.enter_block();
    }

    fn leave_block(&mut self) {
        self.frame.leave_block();
        if let Some(scope) = self.locals {
            self.ast.scope_mut(scope).leave_scope();
        }
    }

    /// ```text
    /// { <stmt>* }
    /// ```
    ///
    /// Statements attach to `self.parent`. A failed statement is reported and skipped.
    fn parse_block(&mut self) -> ParseResult<Vec<NodeId>> {
        self.expect(&TokenKind::LBrace)?;
        self.enter_block();
        let mut body = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.current.is_eof() {
            match self.parse_statement() {
                Ok(Some(node)) => body.push(node),
                Ok(None) => {}
                Err(err) => {
                    err.report(&mut self.ctx.diagnostics);
                    self.synchronize();
                }
            }
        }
        self.leave_block();
        self.expect(&TokenKind::RBrace)?;
        Ok(body)
    }

    /// Parses a block whose statements attach to `node`.
    fn parse_child_block(&mut self, node: NodeId) -> ParseResult<Vec<NodeId>> {
        let saved = std::mem::replace(&mut self.parent, node);
        let body = self.parse_block();
        self.parent = saved;
        body
    }

    fn parse_statement(&mut self) -> ParseResult<Option<NodeId>> {
        let node = match self.current.kind {
            TokenKind::Let => self.parse_let()?,
            TokenKind::Return => self.parse_return()?,
            TokenKind::If => self.parse_if()?,
            TokenKind::While => self.parse_while()?,
            TokenKind::For => self.parse_for()?,
            TokenKind::Semicolon => {
                self.advance();
                return Ok(None);
            }
            _ => self.parse_assign()?,
        };
        Ok(Some(node))
    }

    /// Allocates storage for a variable in the innermost scope: a frame slot inside a
    /// function, an absolute address at module level.
    fn declare_variable(&mut self, name: Rc<str>, ty: DataType, pos: &Position) -> ParseResult<Rc<Symbol>> {
        let size = self.types.size_of(&ty);
        match self.locals {
            Some(scope) => {
                if self.ast.scope(scope).lookup_innermost(&name).is_some() {
                    return Err(ParseError::semantic(
                        pos,
                        format!("'{}' is already defined in this scope", name),
                    ));
                }
                let offset = self.frame.allocate(size);
                Ok(self.ast.scope_mut(scope).insert(Symbol::variable(
                    name,
                    ty,
                    SymbolKind::Local,
                    offset as i32,
                )))
            }
            None => {
                let root = self.ast.root_scope();
                if self.ast.scope(root).lookup(&name).is_some() {
                    return Err(ParseError::semantic(
                        pos,
                        format!("'{}' is already defined", name),
                    ));
                }
                let address = GLOBAL_BASE + self.ast.globals_size;
                self.ast.globals_size += size;
                Ok(self.ast.scope_mut(root).insert(Symbol::variable(
                    name,
                    ty,
                    SymbolKind::Global,
                    address as i32,
                )))
            }
        }
    }

    /// ```text
    /// let <name> (: <type>)? (= <expr>)? ;
    /// ```
    ///
    /// With both a type and an initializer the types must be equal. Without a type
    /// (or with `auto`) the initializer's type is used.
    fn parse_let(&mut self) -> ParseResult<NodeId> {
        let start = self.expect(&TokenKind::Let)?.pos;
        let (name, pos) = self.expect_name("variable name")?;
        let declared = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let mut init = if self.eat(&TokenKind::Assign) {
            let mut expr = self.parse_expression()?;
            self.resolver().resolve(&mut expr)?;
            Some(expr)
        } else {
            None
        };

        let ty = match (declared, init.as_mut()) {
            (None | Some(DataType::Auto), Some(expr)) => expr.ty.clone(),
            (None | Some(DataType::Auto), None) => {
                return Err(ParseError::semantic(
                    &pos,
                    format!("cannot infer the type of '{}' without an initializer", name),
                ));
            }
            (Some(ty), Some(expr)) => {
                if ty != expr.ty {
                    return Err(ParseError::semantic(
                        &expr.pos,
                        format!(
                            "type mismatch: '{}' is declared '{}' but initialized with '{}'",
                            name,
                            self.display(&ty),
                            self.display(&expr.ty)
                        ),
                    ));
                }
                ty
            }
            (Some(ty), None) => {
                if ty.is_reference() {
                    return Err(ParseError::semantic(
                        &pos,
                        format!("reference '{}' must be initialized", name),
                    ));
                }
                ty
            }
        };
        if ty.is_null() {
            return Err(ParseError::semantic(
                &pos,
                format!("variable '{}' cannot have type 'null'", name),
            ));
        }
        self.expect(&TokenKind::Semicolon)?;

        let symbol = self.declare_variable(name, ty, &pos)?;
        Ok(self.ast.add(NodeKind::Let { symbol, init }, Some(self.parent), start))
    }

    /// ```text
    /// return <expr>? ;
    /// ```
    fn parse_return(&mut self) -> ParseResult<NodeId> {
        let start = self.advance().pos; // consume 'return'
        let expected = self.return_type.clone();
        let value = if self.check(&TokenKind::Semicolon) {
            if !expected.is_null() {
                return Err(ParseError::semantic(
                    &start,
                    format!(
                        "missing return value in a function returning '{}'",
                        self.display(&expected)
                    ),
                ));
            }
            None
        } else {
            let mut expr = self.parse_expression()?;
            self.resolver().resolve(&mut expr)?;
            if expr.ty != expected {
                return Err(ParseError::semantic(
                    &expr.pos,
                    format!(
                        "return type mismatch: expected '{}', found '{}'",
                        self.display(&expected),
                        self.display(&expr.ty)
                    ),
                ));
            }
            Some(expr)
        };
        self.expect(&TokenKind::Semicolon)?;
        Ok(self.ast.add(NodeKind::Return { value }, Some(self.parent), start))
    }

    /// ```text
    /// if <expr> { ... }
    /// ```
    fn parse_if(&mut self) -> ParseResult<NodeId> {
        let start = self.advance().pos; // consume 'if'
        let mut cond = self.parse_expression()?;
        self.resolver()
            .expect_value(&mut cond, &DataType::bool(), "condition")?;
        let node = self.ast.add(
            NodeKind::If {
                cond,
                body: Vec::new(),
            },
            Some(self.parent),
            start,
        );
        let block = self.parse_child_block(node)?;
        if let NodeKind::If { body, .. } = &mut self.ast.node_mut(node).kind {
            *body = block;
        }
        Ok(node)
    }

    /// ```text
    /// while <expr> { ... }
    /// ```
    fn parse_while(&mut self) -> ParseResult<NodeId> {
        let start = self.advance().pos; // consume 'while'
        let mut cond = self.parse_expression()?;
        self.resolver()
            .expect_value(&mut cond, &DataType::bool(), "condition")?;
        let node = self.ast.add(
            NodeKind::While {
                cond,
                body: Vec::new(),
            },
            Some(self.parent),
            start,
        );
        let block = self.parse_child_block(node)?;
        if let NodeKind::While { body, .. } = &mut self.ast.node_mut(node).kind {
            *body = block;
        }
        Ok(node)
    }

    /// ```text
    /// for <name> = <expr> to <expr> { ... }
    /// ```
    ///
    /// The loop variable is an `int` scoped to the loop. Both bounds are converted to
    /// `int` and resolved before the variable is declared.
    fn parse_for(&mut self) -> ParseResult<NodeId> {
        let start = self.advance().pos; // consume 'for'
        let (name, pos) = self.expect_name("loop variable")?;
        self.expect(&TokenKind::Assign)?;
        let mut from = self.parse_expression()?;
        self.expect(&TokenKind::To)?;
        let mut to = self.parse_expression()?;
        {
            let mut resolver = self.resolver();
            resolver.resolve(&mut from)?;
            resolver.coerce(&mut from, &DataType::int())?;
            resolver.resolve(&mut to)?;
            resolver.coerce(&mut to, &DataType::int())?;
        }

        self.enter_block();
        let result = self.parse_for_body(name, &pos, from, to, start);
        self.leave_block();
        result
    }

    fn parse_for_body(
        &mut self,
        name: Rc<str>,
        pos: &Position,
        from: Expr,
        to: Expr,
        start: Position,
    ) -> ParseResult<NodeId> {
        let var = self.declare_variable(name, DataType::int(), pos)?;
        let node = self.ast.add(
            NodeKind::For {
                var,
                from,
                to,
                body: Vec::new(),
            },
            Some(self.parent),
            start,
        );
        let block = self.parse_child_block(node)?;
        if let NodeKind::For { body, .. } = &mut self.ast.node_mut(node).kind {
            *body = block;
        }
        Ok(node)
    }

    /// ```text
    /// <expr> (= <expr>)? ;
    /// ```
    ///
    /// Without `= value` the expression is evaluated and its value discarded.
    fn parse_assign(&mut self) -> ParseResult<NodeId> {
        let start = self.current.pos.clone();
        let mut target = self.parse_expression()?;
        let value = if self.eat(&TokenKind::Assign) {
            self.resolver().resolve_target(&mut target)?;
            let mut value = self.parse_expression()?;
            let expected = target.ty.value_type().clone();
            let mut resolver = self.resolver();
            resolver.resolve(&mut value)?;
            resolver.coerce(&mut value, &expected)?;
            Some(value)
        } else {
            self.resolver().resolve(&mut target)?;
            None
        };
        self.expect(&TokenKind::Semicolon)?;
        Ok(self.ast.add(NodeKind::Assign { target, value }, Some(self.parent), start))
    }

    // ---- types ----

    /// ```text
    /// <Name> | null | auto | ref <type> | array[<const expr>] <type> | typeof(<expr>)
    /// ```
    fn parse_type(&mut self) -> ParseResult<DataType> {
        let pos = self.current.pos.clone();
        match &self.current.kind {
            TokenKind::Auto => {
                self.advance();
                Ok(DataType::Auto)
            }
            TokenKind::Ref => {
                self.advance();
                let inner = self.parse_type()?;
                match inner {
                    DataType::Reference(_) => Err(ParseError::semantic(
                        &pos,
                        "a reference to a reference is not allowed",
                    )),
                    DataType::Null | DataType::Auto => Err(ParseError::semantic(
                        &pos,
                        format!("cannot reference '{}'", self.display(&inner)),
                    )),
                    inner => Ok(DataType::reference(inner)),
                }
            }
            TokenKind::Array => {
                self.advance();
                self.expect(&TokenKind::LBracket)?;
                let size = self.parse_expression()?;
                self.expect(&TokenKind::RBracket)?;
                let element = self.parse_type()?;
                if matches!(element, DataType::Null | DataType::Auto) {
                    return Err(ParseError::semantic(
                        &pos,
                        format!("array element cannot be '{}'", self.display(&element)),
                    ));
                }
                let count = match size.const_int() {
                    Some(n) if n < 0 => {
                        return Err(ParseError::semantic(&size.pos, "array size must not be negative"));
                    }
                    Some(n) => u32::try_from(n).map_err(|_| {
                        ParseError::semantic(&size.pos, "array size must be a constant integer")
                    })?,
                    None => {
                        return Err(ParseError::semantic(
                            &size.pos,
                            "array size must be a constant integer",
                        ));
                    }
                };
                Ok(DataType::array(element, count))
            }
            TokenKind::Typeof => {
                self.advance();
                self.expect(&TokenKind::LParen)?;
                let mut expr = self.parse_expression()?;
                self.resolver().resolve(&mut expr)?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr.ty)
            }
            TokenKind::Name(name) => {
                let name = name.clone();
                if name == "null" {
                    self.advance();
                    return Ok(DataType::Null);
                }
                match self.ast.lookup_construct(self.parent, &name) {
                    Some(id) => {
                        self.advance();
                        Ok(DataType::Named(id))
                    }
                    None => Err(ParseError::semantic(
                        &pos,
                        format!("unknown type '{}'", name),
                    )),
                }
            }
            _ => Err(self.unexpected("a type")),
        }
    }
}

/// The user class a type embeds by value, if any. References break embedding.
fn embedded_class(ty: &DataType) -> Option<ConstructId> {
    match ty {
        DataType::Named(id) if id.0 as usize >= Primitive::ALL.len() => Some(*id),
        DataType::Array { element, .. } => embedded_class(element),
        _ => None,
    }
}

/// Convenience entry point: parses the context's source.
pub fn parse_module(ctx: &mut CompileContext) -> ParsedModule {
    Parser::new(ctx).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::expr::{CastKind, ExprKind};

    fn parse(source: &str) -> (ParsedModule, CompileContext) {
        let mut ctx = CompileContext::new("test.cn", source);
        let module = parse_module(&mut ctx);
        (module, ctx)
    }

    fn assert_ok(source: &str) -> ParsedModule {
        let (module, ctx) = parse(source);
        assert!(
            !ctx.diagnostics.has_errors(),
            "unexpected errors:\n{}",
            ctx.render_diagnostics()
        );
        module
    }

    fn assert_error(source: &str, expected: &str) {
        let (_, ctx) = parse(source);
        let rendered = ctx.render_diagnostics();
        assert!(
            ctx.diagnostics.errors().any(|d| d.message.contains(expected)),
            "expected an error containing {:?}, got:\n{}",
            expected,
            rendered
        );
    }

    fn warnings(source: &str) -> Vec<String> {
        let (_, ctx) = parse(source);
        assert!(!ctx.diagnostics.has_errors(), "{}", ctx.render_diagnostics());
        ctx.diagnostics
            .warnings()
            .map(|d| d.message.clone())
            .collect()
    }

    #[test]
    fn test_function_registration() {
        let module = assert_ok("func add(a: int, b: char) -> int { return a + b; }");
        let decl = module.ast.function(0).unwrap();
        assert_eq!(&*decl.symbol.name, "add");
        assert_eq!(decl.arg_size, 5);
        assert_eq!(decl.symbol.params, vec![DataType::int(), DataType::char()]);
        assert_eq!(decl.body.len(), 1);
    }

    #[test]
    fn test_forward_reference() {
        assert_ok(
            "func main() -> int { return later(2); }\n\
             func later(x: int) -> int { return x * 2; }",
        );
    }

    #[test]
    fn test_let_explicit_cast_warns_only() {
        let found = warnings("func main() { let x: int = 1.5 as int; }");
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("possible loss of data"));
    }

    #[test]
    fn test_let_type_mismatch() {
        assert_error("func main() { let x: int = [1, 2, 3]; }", "type mismatch");
        assert_error("func main() { let x: float = 1; }", "type mismatch");
    }

    #[test]
    fn test_let_requires_type_or_initializer() {
        assert_error("func main() { let x; }", "cannot infer the type");
    }

    #[test]
    fn test_let_infers_from_initializer() {
        let module = assert_ok("func main() { let x = 2.5; let y: auto = 'c'; }");
        let decl = module.ast.function(0).unwrap();
        let types: Vec<DataType> = decl
            .body
            .iter()
            .filter_map(|id| match &module.ast.node(*id).kind {
                NodeKind::Let { symbol, .. } => Some(symbol.ty.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(types, vec![DataType::float(), DataType::char()]);
    }

    #[test]
    fn test_array_size_must_be_constant() {
        assert_error(
            "func main() { let n = 3; let a: array[n] int; }",
            "array size must be a constant integer",
        );
        assert_ok("func main() { let a: array[3] int; let b: array[2 * 4] char; }");
        assert_ok("func main() { let a: array[typesize(float)] char; }");
    }

    #[test]
    fn test_constant_index_out_of_range() {
        assert_error(
            "func main() -> int { let a = [1, 2, 3]; let b = 7; a[3] = 99; return b; }",
            "index 3 out of range for array[3]",
        );
        assert_error(
            "func main() -> int { let b = 7; let a = [1, 2, 3]; a[0 - 1] = 99; return b; }",
            "index -1 out of range for array[3]",
        );
        assert_error(
            "func main() -> int { let a: array[2] int; return a[-(1 + 1)]; }",
            "index -2 out of range for array[2]",
        );
        assert_error(
            "func f(r: ref array[4] char) -> char { return r[2 * 2]; }",
            "index 4 out of range for array[4]",
        );
        assert_ok("func main() -> int { let a = [1, 2, 3]; let i = 5; a[2] = a[0]; return a[i]; }");
    }

    #[test]
    fn test_block_scoping() {
        assert_error(
            "func main() -> int { if true { let x = 1; } return x; }",
            "undefined symbol 'x'",
        );
        assert_ok("func main() { if true { let x = 1; } let x = 2.0; }");
        assert_error(
            "func main() { let x = 1; let x = 2; }",
            "'x' is already defined in this scope",
        );
    }

    #[test]
    fn test_block_slots_are_reused() {
        let module = assert_ok(
            "func main() { let a = 1; if true { let b = 2; } if true { let c = 3; } }",
        );
        assert_eq!(module.ast.function(0).unwrap().frame_size, 8);
    }

    #[test]
    fn test_overload_exact_match_preferred() {
        let module = assert_ok(
            "func f(x: int) -> int { return 1; }\n\
             func f(x: float) -> int { return 2; }\n\
             func main() -> int { return f(1.5); }",
        );
        let main = module.ast.function(2).unwrap();
        let NodeKind::Return { value: Some(expr) } = &module.ast.node(main.body[0]).kind else {
            panic!("expected a return");
        };
        let ExprKind::Call { symbol, args, .. } = &expr.kind else {
            panic!("expected a call");
        };
        assert_eq!(symbol.as_ref().unwrap().params, vec![DataType::float()]);
        assert!(matches!(args[0].kind, ExprKind::Literal(_)));
    }

    #[test]
    fn test_overload_ambiguous_call_is_an_error() {
        assert_error(
            "func f(x: int) -> int { return 1; }\n\
             func f(x: float) -> int { return 2; }\n\
             func main() -> int { return f('c'); }",
            "ambiguous call to `f(char)`",
        );
    }

    #[test]
    fn test_overload_single_implicit_candidate() {
        let module = assert_ok(
            "func g(x: float) -> float { return x; }\n\
             func main() -> float { return g(3); }",
        );
        let main = module.ast.function(1).unwrap();
        let NodeKind::Return { value: Some(expr) } = &module.ast.node(main.body[0]).kind else {
            panic!("expected a return");
        };
        let ExprKind::Call { args, .. } = &expr.kind else {
            panic!("expected a call");
        };
        assert!(matches!(
            args[0].kind,
            ExprKind::Cast {
                kind: CastKind::Primitive { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_no_matching_overload() {
        assert_error(
            "class P { x: int; }\n\
             func f(x: int) { }\n\
             func main() { let p: P; f(p); }",
            "could not find a function that matches `f(P)`",
        );
    }

    #[test]
    fn test_duplicate_function() {
        assert_error(
            "func f(x: int) { }\nfunc f(y: int) { }",
            "function already defined",
        );
    }

    #[test]
    fn test_binary_operand_errors() {
        assert_error(
            "func main() { let b = true + 1; }",
            "invalid operand types 'bool' and 'int' for '+'",
        );
        assert_error(
            "func main() { let a: array[2] int; let b = a * 2; }",
            "invalid operand types 'array[2] int' and 'int' for '*'",
        );
    }

    #[test]
    fn test_condition_must_be_bool() {
        assert_error("func main() { if 1 { } }", "condition must be 'bool'");
        assert_ok("func main() { let i = 0; while i < 3 { i = i + 1; } }");
    }

    #[test]
    fn test_return_type_must_match() {
        assert_error("func f() -> int { return 1.0; }", "return type mismatch");
        assert_error("func f() -> int { return; }", "missing return value");
        assert_ok("func f() { return; }");
    }

    #[test]
    fn test_class_layout_and_member_access() {
        let module = assert_ok(
            "class Outer { tag: char; inner: Inner; }\n\
             class Inner { a: int; b: float; }\n\
             func main() -> float { let o: Outer; o.inner.b = 2.0; return o.inner.b; }",
        );
        let outer = module
            .ast
            .lookup_construct(module.ast.root(), "Outer")
            .unwrap();
        assert_eq!(module.types.size_of(&DataType::Named(outer)), 9);
    }

    #[test]
    fn test_type_loop_detected() {
        assert_error("class A { b: B; }\nclass B { a: A; }", "type loop detected");
        assert_error("class Node { next: Node; }", "type loop detected");
        assert_ok("class Node { value: int; next: ref Node; }");
    }

    #[test]
    fn test_assignment_target_must_be_lvalue() {
        assert_error(
            "func f() -> int { return 1; }\nfunc main() { f() = 2; }",
            "expression is not assignable",
        );
        assert_error("func main() { 1 + 2 = 3; }", "expression is not assignable");
    }

    #[test]
    fn test_function_name_is_not_a_value() {
        assert_error(
            "func f() { }\nfunc main() { let x = f; }",
            "'f' is a function",
        );
    }

    #[test]
    fn test_globals_and_externals() {
        let module = assert_ok(
            "let counter: int = 5;\n\
             from io import func write(v: int);\n\
             import func flush();\n\
             func main() { write(counter); flush(); }",
        );
        assert_eq!(module.ast.globals_size, 4);
        let names: Vec<&str> = module
            .ast
            .externals
            .iter()
            .map(|e| e.link_name.as_str())
            .collect();
        assert_eq!(names, vec!["io.write", "flush"]);
    }

    #[test]
    fn test_syntax_error_recovery() {
        let (_, ctx) = parse(
            "func main() { let x = ; let y = 2; y = ; }\nfunc other() -> int { return 1 }",
        );
        assert_eq!(ctx.diagnostics.error_count(), 3, "{}", ctx.render_diagnostics());
    }

    #[test]
    fn test_lexical_errors_reported_once() {
        let (_, ctx) = parse("func main() { let x = 1 $ 2; }");
        let lexical = ctx
            .diagnostics
            .errors()
            .filter(|d| d.kind == crate::diagnostics::DiagnosticKind::Lexical)
            .count();
        assert_eq!(lexical, 1);
    }

    #[test]
    fn test_reference_variables() {
        assert_ok(
            "func main() -> int { let x = 1; let r: ref int = ref x; r = 5; return x + r; }",
        );
        assert_error("func main() { let r: ref int; }", "must be initialized");
        assert_error("func main() { let r = ref 5; }", "temporary value");
    }

    #[test]
    fn test_typeof_and_typename() {
        assert_ok("func main() { let x = 1.0; let y: typeof(x) = 2.0; let n = typename(ref int); }");
    }
}
