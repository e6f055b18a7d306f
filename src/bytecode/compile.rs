//! Code generation: walks a resolved module and emits linked bytecode.
//!
//! Expressions compile in one of two modes. Value mode pushes the expression's value;
//! an expression of type `ref T` pushes the referent's value. Address mode pushes the
//! address of the referent instead, and is used wherever the destination is itself a
//! reference: initializing a `ref` variable, passing a `ref` argument and returning
//! from a function that returns a reference.

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::debug::{DebugInfo, FunctionInfo};
use crate::bytecode::emit::CodeBuffer;
use crate::bytecode::format::Program;
use crate::bytecode::link::link;
use crate::bytecode::op::{Access, Instr, arith_entry, arith_opcode, cast_entry, cast_opcode};
use crate::frontend::parser::ParsedModule;
use crate::lang::expr::{BinaryOp, CastKind, Expr, ExprKind, Literal};
use crate::lang::node::{Ast, FunctionDecl, NodeId, NodeKind};
use crate::lang::symbol::{FrameAllocator, Symbol, SymbolKind};
use crate::lang::types::{DataType, Primitive, REFERENCE_SIZE, TypeTable};

/// A linked program with the debug info describing it.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub program: Program,
    pub debug: DebugInfo,
}

/// Generates code for every function plus the start routine, then links.
///
/// `entry` names the parameterless function the start routine calls once globals are
/// initialized.
pub fn generate(module: &ParsedModule, file: &str, entry: &str) -> Result<Compiled, CompileError> {
    Generator::new(&module.ast, &module.types).run(file, entry)
}

struct Generator<'a> {
    ast: &'a Ast,
    types: &'a TypeTable,
    buf: CodeBuffer,
    /// Temporaries live above the parser's frame slots and are never reused.
    temps: FrameAllocator,
    arg_size: u32,
    return_type: DataType,
    functions: Vec<FunctionInfo>,
}

impl<'a> Generator<'a> {
    fn new(ast: &'a Ast, types: &'a TypeTable) -> Self {
        Generator {
            ast,
            types,
            buf: CodeBuffer::new(),
            temps: FrameAllocator::new(),
            arg_size: 0,
            return_type: DataType::Null,
            functions: Vec::new(),
        }
    }

    fn run(mut self, file: &str, entry: &str) -> Result<Compiled, CompileError> {
        let ast = self.ast;
        let entry = self.find_entry(entry)?;

        for external in &ast.externals {
            self.buf
                .add_external(external.symbol.location as u32, external.link_name.clone());
        }
        for index in 0..ast.functions.len() as u32 {
            if let Some(decl) = ast.function(index) {
                self.buf.declare_function(index, decl.symbol.name.to_string());
            }
        }

        for (index, node) in ast.functions.iter().enumerate() {
            if let Some(decl) = ast.function(index as u32) {
                self.function(*node, decl)?;
            }
        }
        let start = self.start_routine(entry)?;

        let lines = self.buf.lines().to_vec();
        let program = link(self.buf, start)?;
        tracing::debug!(
            functions = self.functions.len(),
            bytes = program.code.len(),
            "code generated"
        );
        Ok(Compiled {
            program,
            debug: DebugInfo {
                file: file.to_string(),
                functions: self.functions,
                lines,
            },
        })
    }

    fn find_entry(&self, name: &str) -> Result<&'a FunctionDecl, CompileError> {
        let ast = self.ast;
        let candidates: Vec<&FunctionDecl> = (0..ast.functions.len() as u32)
            .filter_map(|index| ast.function(index))
            .filter(|decl| &*decl.symbol.name == name)
            .collect();

        if let Some(entry) = candidates.iter().find(|decl| decl.params.is_empty()) {
            return Ok(*entry);
        }
        match candidates.first() {
            Some(decl) => Err(CompileError::InvalidEntry {
                name: name.to_string(),
                signature: self.signature(decl),
            }),
            None => Err(CompileError::MissingEntry(name.to_string())),
        }
    }

    fn signature(&self, decl: &FunctionDecl) -> String {
        let params: Vec<String> = decl
            .params
            .iter()
            .map(|p| self.types.display(&p.ty))
            .collect();
        let mut signature = format!("{}({})", decl.symbol.name, params.join(", "));
        if !decl.symbol.ty.is_null() {
            signature.push_str(" -> ");
            signature.push_str(&self.types.display(&decl.symbol.ty));
        }
        signature
    }

    // ---- functions ----

    fn function(&mut self, node: NodeId, decl: &FunctionDecl) -> Result<(), CompileError> {
        let start = self.buf.offset();
        self.buf.begin_function(decl.index);
        self.buf.mark_line(self.ast.node(node).pos.line);
        self.temps = FrameAllocator::starting_at(decl.frame_size);
        self.arg_size = decl.arg_size;
        self.return_type = decl.symbol.ty.clone();

        let frame = self.buf.emit_create_frame();
        self.block(&decl.body)?;

        // falling off the end returns a zeroed value
        let ret = self.types.size_of(&decl.symbol.ty);
        if ret > 0 {
            self.buf.emit(Instr::PushZero(ret));
        }
        self.buf.emit(Instr::Return {
            ret,
            args: decl.arg_size,
        });

        let frame_size = self.temps.frame_size();
        self.buf.patch_u32(frame, frame_size);
        tracing::debug!(function = %decl.symbol.name, start, frame_size, "function generated");
        self.functions.push(FunctionInfo {
            name: decl.symbol.name.to_string(),
            signature: self.signature(decl),
            start,
            end: self.buf.offset(),
        });
        Ok(())
    }

    /// `CreateFrame(globals) ; <global initializers> ; Call entry ; Return(ret, 0)`
    ///
    /// The routine's frame is the globals region, so globals are ordinary frame slots of
    /// the outermost frame.
    fn start_routine(&mut self, entry: &FunctionDecl) -> Result<u32, CompileError> {
        let ast = self.ast;
        let start = self.buf.offset();
        self.temps = FrameAllocator::starting_at(ast.globals_size);
        self.arg_size = 0;
        self.return_type = DataType::Null;

        // line 0: generated code with no statement of its own
        self.buf.mark_line(0);
        let frame = self.buf.emit_create_frame();
        for item in ast.items() {
            if let NodeKind::Let { .. } = ast.node(*item).kind {
                self.statement(*item)?;
            }
        }
        self.buf.emit_call(entry.index);
        self.buf.emit(Instr::Return {
            ret: self.types.size_of(&entry.symbol.ty),
            args: 0,
        });
        self.buf.patch_u32(frame, self.temps.frame_size());

        self.functions.push(FunctionInfo {
            name: "<start>".to_string(),
            signature: format!("<start> calls {}", self.signature(entry)),
            start,
            end: self.buf.offset(),
        });
        Ok(start)
    }

    // ---- statements ----

    fn block(&mut self, body: &[NodeId]) -> Result<(), CompileError> {
        for stmt in body {
            self.statement(*stmt)?;
        }
        Ok(())
    }

    fn statement(&mut self, id: NodeId) -> Result<(), CompileError> {
        let ast = self.ast;
        let node = ast.node(id);
        self.buf.mark_line(node.pos.line);

        match &node.kind {
            NodeKind::Let { symbol, init } => {
                let slot = self.symbol_slot(symbol)?;
                let size = self.types.size_of(&symbol.ty);
                match init {
                    Some(init) if symbol.ty.is_reference() => self.address(init)?,
                    Some(init) => self.value(init)?,
                    // slots are reused between blocks, so clear explicitly
                    None if size > 0 => self.buf.emit(Instr::PushZero(size)),
                    None => {}
                }
                self.store(slot, size);
            }

            NodeKind::Assign { target, value } => {
                let size = self.types.value_size(&target.ty);
                match value {
                    Some(value) => {
                        self.value(value)?;
                        match self.storage_slot(target) {
                            Some(slot) if !target.ty.is_reference() => self.store(slot, size),
                            _ => {
                                self.address(target)?;
                                self.store(Access::Indirect, size);
                            }
                        }
                    }
                    None => {
                        self.value(target)?;
                        if size > 0 {
                            self.buf.emit(Instr::Pop(size));
                        }
                    }
                }
            }

            NodeKind::Return { value } => {
                let ret = self.types.size_of(&self.return_type);
                match value {
                    Some(value) if self.return_type.is_reference() => self.address(value)?,
                    Some(value) => self.value(value)?,
                    None => {}
                }
                self.buf.emit(Instr::Return {
                    ret,
                    args: self.arg_size,
                });
            }

            NodeKind::If { cond, body } => {
                let end = self.buf.create_label("if_end");
                self.value(cond)?;
                self.buf.emit_jump_if_false(end);
                self.block(body)?;
                self.buf.place_label(end);
            }

            NodeKind::While { cond, body } => {
                let top = self.buf.create_label("while_top");
                let end = self.buf.create_label("while_end");
                self.buf.place_label(top);
                self.value(cond)?;
                self.buf.emit_jump_if_false(end);
                self.block(body)?;
                self.buf.emit_jump(top);
                self.buf.place_label(end);
            }

            NodeKind::For {
                var,
                from,
                to,
                body,
            } => {
                // the bound is evaluated once, into a temporary
                let var = self.symbol_slot(var)?;
                let bound = Access::Local(self.temps.allocate(4) as i32);
                self.value(from)?;
                self.store(var, 4);
                self.value(to)?;
                self.store(bound, 4);

                let top = self.buf.create_label("for_top");
                let end = self.buf.create_label("for_end");
                self.buf.place_label(top);
                self.buf.emit(Instr::Load(var, 4));
                self.buf.emit(Instr::Load(bound, 4));
                self.arith(BinaryOp::Lt, Primitive::Int, Primitive::Int)?;
                self.buf.emit_jump_if_false(end);
                self.block(body)?;

                self.buf.emit(Instr::Load(var, 4));
                self.buf.emit(Instr::PushConst4(1));
                self.arith(BinaryOp::Add, Primitive::Int, Primitive::Int)?;
                self.store(var, 4);
                self.buf.emit_jump(top);
                self.buf.place_label(end);
            }

            NodeKind::Module { .. } | NodeKind::Function(_) | NodeKind::Class { .. } => {}
        }
        Ok(())
    }

    fn store(&mut self, slot: Access, size: u32) {
        if size > 0 {
            self.buf.emit(Instr::Store(slot, size));
        }
    }

    fn load(&mut self, slot: Access, size: u32) {
        if size > 0 {
            self.buf.emit(Instr::Load(slot, size));
        }
    }

    // ---- storage ----

    fn symbol_slot(&self, symbol: &Symbol) -> Result<Access, CompileError> {
        match symbol.kind {
            SymbolKind::Local | SymbolKind::Argument => Ok(Access::Local(symbol.location)),
            SymbolKind::Global => Ok(Access::Global(symbol.location as u32)),
            SymbolKind::Function | SymbolKind::External => Err(CompileError::NoOpcode(format!(
                "storage of function '{}'",
                symbol.name
            ))),
        }
    }

    /// Compile-time location of the bytes holding `expr`'s own value. For a
    /// reference-typed expression that is the slot holding the pointer.
    fn storage_slot(&self, expr: &Expr) -> Option<Access> {
        match &expr.kind {
            ExprKind::Name {
                symbol: Some(symbol),
                ..
            } => self.symbol_slot(symbol).ok(),
            ExprKind::Index { base, index } if !base.ty.is_reference() => {
                let base = self.storage_slot(base)?;
                let scale = i64::from(self.types.size_of(&expr.ty));
                offset_slot(base, index.const_int()?.checked_mul(scale)?)
            }
            ExprKind::Member { base, offset, .. } if !base.ty.is_reference() => {
                offset_slot(self.storage_slot(base)?, i64::from(*offset))
            }
            _ => None,
        }
    }

    /// Pushes the address of the storage holding `expr`'s own value.
    fn storage_address(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match self.storage_slot(expr) {
            Some(Access::Local(offset)) => {
                self.buf.emit(Instr::PushAddrLocal(offset));
                return Ok(());
            }
            Some(Access::Global(address)) => {
                self.buf.emit(Instr::PushAddrGlobal(address));
                return Ok(());
            }
            _ => {}
        }

        match &expr.kind {
            ExprKind::Index { base, index } => {
                self.address(base)?;
                self.value(index)?;
                self.buf
                    .emit(Instr::AddrIndex(self.types.size_of(&expr.ty)));
            }
            ExprKind::Member { base, offset, .. } => {
                self.address(base)?;
                if *offset != 0 {
                    self.buf.emit(Instr::AddrAdd(*offset));
                }
            }
            _ => self.materialize(expr)?,
        }
        Ok(())
    }

    /// Address mode: pushes the address of the value `expr` denotes.
    fn address(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Name { .. } | ExprKind::Index { .. } | ExprKind::Member { .. } => {
                if expr.ty.is_reference() {
                    match self.storage_slot(expr) {
                        Some(slot) => self.load(slot, REFERENCE_SIZE),
                        None => {
                            self.storage_address(expr)?;
                            self.load(Access::Indirect, REFERENCE_SIZE);
                        }
                    }
                    Ok(())
                } else {
                    self.storage_address(expr)
                }
            }
            ExprKind::Call { .. } if expr.ty.is_reference() => self.call(expr),
            ExprKind::Cast {
                inner,
                kind: CastKind::Identity | CastKind::Deref | CastKind::Decay | CastKind::Pending,
                ..
            } => self.address(inner),
            ExprKind::RefOf(inner) => self.address(inner),
            _ => self.materialize(expr),
        }
    }

    /// Evaluates `expr` into a fresh temporary and pushes the temporary's address.
    fn materialize(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let size = self.types.value_size(&expr.ty);
        let slot = self.temps.allocate(size) as i32;
        self.value(expr)?;
        self.store(Access::Local(slot), size);
        self.buf.emit(Instr::PushAddrLocal(slot));
        Ok(())
    }

    // ---- values ----

    /// Value mode: pushes the value of `expr`, reading through references.
    fn value(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let size = self.types.value_size(&expr.ty);
        if expr.ty.is_reference() {
            self.address(expr)?;
            if size > 0 {
                self.buf.emit(Instr::Load(Access::Indirect, size));
            } else {
                self.buf.emit(Instr::Pop(REFERENCE_SIZE));
            }
            return Ok(());
        }

        match &expr.kind {
            ExprKind::Literal(literal) => self.literal(literal),
            ExprKind::Name { .. } | ExprKind::Index { .. } | ExprKind::Member { .. } => {
                match self.storage_slot(expr) {
                    Some(slot) => self.load(slot, size),
                    None => {
                        self.storage_address(expr)?;
                        self.load(Access::Indirect, size);
                    }
                }
            }
            ExprKind::Call { .. } => self.call(expr)?,
            ExprKind::Binary { op, left, right } => {
                self.value(left)?;
                self.value(right)?;
                let (Some(l), Some(r)) = (
                    left.ty.value_type().primitive(),
                    right.ty.value_type().primitive(),
                ) else {
                    return Err(CompileError::NoOpcode(format!(
                        "'{}' on '{}' and '{}'",
                        op,
                        self.types.display(&left.ty),
                        self.types.display(&right.ty)
                    )));
                };
                self.arith(*op, l, r)?;
            }
            ExprKind::Cast { inner, kind, .. } => match kind {
                CastKind::Primitive { from, to } => {
                    self.value(inner)?;
                    self.cast(*from, *to)?;
                }
                CastKind::Decay => self.address(inner)?,
                CastKind::Identity | CastKind::Deref | CastKind::Pending => self.value(inner)?,
            },
            ExprKind::RefOf(inner) => self.address(inner)?,
            ExprKind::Copy(inner) => self.value(inner)?,
            ExprKind::ArrayLiteral(elements) => {
                for element in elements {
                    self.value(element)?;
                }
            }
        }
        Ok(())
    }

    fn literal(&mut self, literal: &Literal) {
        let instr = match literal {
            Literal::Int(v) => Instr::PushConst4(*v as u32),
            Literal::Float(v) => Instr::PushConst4(v.to_bits()),
            Literal::Char(c) => Instr::PushConst1(*c),
            Literal::Bool(b) => Instr::PushConst1(u8::from(*b)),
            Literal::Str(bytes) => {
                let mut data = bytes.to_vec();
                data.push(0);
                self.buf.emit(Instr::PushBytes(&data));
                return;
            }
        };
        self.buf.emit(instr);
    }

    fn call(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let ExprKind::Call {
            name,
            args,
            symbol: Some(callee),
        } = &expr.kind
        else {
            return Err(CompileError::NoOpcode(format!(
                "unresolved call at {}",
                expr.pos
            )));
        };

        for (arg, param) in args.iter().zip(&callee.params) {
            if param.is_reference() {
                self.address(arg)?;
            } else {
                self.value(arg)?;
            }
        }
        match callee.kind {
            SymbolKind::Function => self.buf.emit_call(callee.location as u32),
            SymbolKind::External => self.buf.emit(Instr::CallExternal(callee.location as u32)),
            _ => {
                return Err(CompileError::NoOpcode(format!("call to variable '{}'", name)));
            }
        }
        Ok(())
    }

    fn arith(&mut self, op: BinaryOp, left: Primitive, right: Primitive) -> Result<(), CompileError> {
        let entry = arith_opcode(op, left, right)
            .and_then(arith_entry)
            .ok_or_else(|| CompileError::NoOpcode(format!("'{}' on '{}' and '{}'", op, left, right)))?;
        self.buf.emit(Instr::Arith(entry));
        Ok(())
    }

    fn cast(&mut self, from: Primitive, to: Primitive) -> Result<(), CompileError> {
        if from == to {
            return Ok(());
        }
        let entry = cast_opcode(from, to)
            .and_then(cast_entry)
            .ok_or_else(|| CompileError::NoOpcode(format!("cast from '{}' to '{}'", from, to)))?;
        self.buf.emit(Instr::Cast(entry));
        Ok(())
    }
}

fn offset_slot(slot: Access, by: i64) -> Option<Access> {
    match slot {
        Access::Local(offset) => i32::try_from(i64::from(offset) + by).ok().map(Access::Local),
        Access::Global(address) => u32::try_from(i64::from(address) + by)
            .ok()
            .map(Access::Global),
        Access::Indirect => None,
    }
}
