use std::collections::HashMap;

use crate::bytecode::debug::DebugInfo;
use crate::bytecode::format::Program;
use crate::bytecode::op::{Access, ArithEntry, CastEntry, Instr};
use crate::lang::expr::BinaryOp;
use crate::lang::types::Primitive;
use crate::runtime::native::{Native, NativeCall, NativeRegistry};
use crate::runtime::runtime_error::{RuntimeError, VmError};
use crate::runtime::stack::Stack;

/// Bytes between a frame's arguments and its base: return address, then saved base.
const LINK_SIZE: u32 = 8;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub stack_size: u32,
    pub max_call_depth: usize,
    pub max_steps: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_size: 64 * 1024,
            max_call_depth: 1000,
            max_steps: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Loading,
    Running,
    Halted,
    Faulted,
}

/// A link-table slot: the name the program asked for and the native bound to it.
struct Binding {
    name: String,
    native: Option<Native>,
}

/// Scalar popped for arithmetic or conversion.
#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i32),
    Float(f32),
    Char(u8),
}

pub struct Vm<'p> {
    program: &'p Program,
    debug: Option<&'p DebugInfo>,
    bindings: HashMap<u32, Binding>,
    stack: Stack,
    bp: u32,
    pc: u32,
    depth: usize,
    steps: u64,
    /// Start offsets of the active functions, outermost first.
    calls: Vec<u32>,
    config: VmConfig,
    state: VmState,
}

impl<'p> Vm<'p> {
    /// Loads `program`, binding each link-table name against `natives`. Names with no
    /// native only fail if the program actually calls them.
    pub fn new(program: &'p Program, natives: &NativeRegistry, config: VmConfig) -> Self {
        let mut bindings = HashMap::new();
        for entry in &program.externals {
            let native = natives.get(&entry.name).cloned();
            if native.is_none() {
                tracing::warn!(name = %entry.name, index = entry.index, "unresolved external");
            }
            bindings.insert(
                entry.index,
                Binding {
                    name: entry.name.clone(),
                    native,
                },
            );
        }
        tracing::debug!(
            externals = program.externals.len(),
            code = program.code.len(),
            "program loaded"
        );

        Vm {
            program,
            debug: None,
            bindings,
            stack: Stack::new(config.stack_size),
            bp: 0,
            pc: program.entry,
            depth: 0,
            steps: 0,
            calls: vec![program.entry],
            config,
            state: VmState::Loading,
        }
    }

    pub fn with_debug_info(mut self, debug: &'p DebugInfo) -> Self {
        self.debug = Some(debug);
        self
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Current call depth; 0 while the start routine runs.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Runs until the start routine returns, yielding the bytes it returned.
    pub fn run(&mut self) -> Result<Vec<u8>, RuntimeError> {
        self.state = VmState::Running;
        loop {
            let pc = self.pc;
            match self.step() {
                Ok(Some(result)) => {
                    self.state = VmState::Halted;
                    tracing::debug!(steps = self.steps, "halted");
                    return Ok(result);
                }
                Ok(None) => {}
                Err(error) => {
                    self.state = VmState::Faulted;
                    return Err(self.fault(error, pc));
                }
            }
        }
    }

    fn fault(&self, error: VmError, pc: u32) -> RuntimeError {
        let call_stack = self
            .calls
            .iter()
            .map(|start| {
                self.debug
                    .and_then(|debug| debug.function_starting_at(*start))
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| format!("@{:04}", start))
            })
            .collect();
        RuntimeError {
            error,
            pc,
            location: self.debug.and_then(|debug| debug.describe(pc)),
            call_stack,
        }
    }

    fn check_limits(&mut self) -> Result<(), VmError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(VmError::StepLimitExceeded(max));
            }
        }
        Ok(())
    }

    /// Executes one instruction. `Some` carries the result once the machine halts.
    fn step(&mut self) -> Result<Option<Vec<u8>>, VmError> {
        self.check_limits()?;

        let program = self.program;
        if self.pc as usize >= program.code.len() {
            return Err(VmError::PcOutOfBounds(self.pc));
        }
        let (instr, len) = Instr::decode(&program.code, self.pc as usize)?;
        tracing::trace!(pc = self.pc, sp = self.stack.sp(), bp = self.bp, "{}", instr);
        self.pc += len as u32;

        match instr {
            // Frames and calls
            Instr::CreateFrame(size) => {
                self.stack.push(self.bp)?;
                self.bp = self.stack.sp();
                self.stack.push_zero(size)?;
            }
            Instr::Call(target) => {
                if self.depth >= self.config.max_call_depth {
                    return Err(VmError::CallDepthExceeded(self.config.max_call_depth));
                }
                self.stack.push(self.pc)?;
                self.depth += 1;
                self.calls.push(target);
                self.pc = target;
            }
            Instr::CallExternal(index) => self.call_external(index)?,
            Instr::Return { ret, args } => {
                if self.depth == 0 {
                    return Ok(Some(self.stack.top(ret)?.to_vec()));
                }
                self.leave(ret, args)?;
            }

            // Control flow
            Instr::Jump(target) => self.pc = target,
            Instr::JumpIfFalse(target) => {
                if !self.stack.pop::<bool>()? {
                    self.pc = target;
                }
            }

            // Constants
            Instr::PushConst1(byte) => self.stack.push(byte)?,
            Instr::PushConst4(word) => self.stack.push(word)?,
            Instr::PushBytes(bytes) => self.stack.push_bytes(bytes)?,
            Instr::PushZero(n) => self.stack.push_zero(n)?,
            Instr::Pop(n) => self.stack.drop_bytes(n)?,

            // Addresses
            Instr::PushAddrLocal(offset) => {
                let address = self.local(offset, 0)?;
                self.stack.push(address)?;
            }
            Instr::PushAddrGlobal(address) => self.stack.push(address)?,
            Instr::AddrAdd(offset) => {
                let base: u32 = self.stack.pop()?;
                let address = to_address(i64::from(base) + i64::from(offset), 0)?;
                self.stack.push(address)?;
            }
            Instr::AddrIndex(element) => {
                let index: i32 = self.stack.pop()?;
                let base: u32 = self.stack.pop()?;
                let address = i64::from(base) + i64::from(index) * i64::from(element);
                self.stack.push(to_address(address, element)?)?;
            }

            // Memory
            Instr::Load(access, n) => {
                let address = match access {
                    Access::Local(offset) => self.local(offset, n)?,
                    Access::Global(address) => address,
                    Access::Indirect => self.stack.pop()?,
                };
                self.stack.push_from(address, n)?;
            }
            Instr::Store(access, n) => {
                let address = match access {
                    Access::Local(offset) => self.local(offset, n)?,
                    Access::Global(address) => address,
                    Access::Indirect => self.stack.pop()?,
                };
                self.stack.pop_to(address, n)?;
            }

            Instr::Arith(entry) => self.arith(entry)?,
            Instr::Cast(entry) => self.cast(entry)?,
        }
        Ok(None)
    }

    fn local(&self, offset: i32, len: u32) -> Result<u32, VmError> {
        to_address(i64::from(self.bp) + i64::from(offset), len)
    }

    /// Tears down the current frame, leaving the `ret` result bytes where the
    /// caller pushed its arguments.
    fn leave(&mut self, ret: u32, args: u32) -> Result<(), VmError> {
        let saved_bp: u32 = self.stack.read_value(self.local(-4, 4)?)?;
        let return_pc: u32 = self.stack.read_value(self.local(-(LINK_SIZE as i32), 4)?)?;
        let args_start = to_address(
            i64::from(self.bp) - i64::from(LINK_SIZE) - i64::from(args),
            args,
        )?;

        self.stack.collapse_to(args_start, ret)?;
        self.bp = saved_bp;
        self.pc = return_pc;
        self.depth -= 1;
        self.calls.pop();
        Ok(())
    }

    fn call_external(&mut self, index: u32) -> Result<(), VmError> {
        let native = match self.bindings.get(&index) {
            Some(Binding {
                native: Some(native),
                ..
            }) => native.clone(),
            Some(Binding { name, native: None }) => {
                return Err(VmError::UnresolvedExternal(name.clone()));
            }
            None => return Err(VmError::UnresolvedExternal(format!("#{}", index))),
        };

        let arg_size = native.signature.arg_size();
        let sp = self.stack.sp();
        if arg_size > sp {
            return Err(VmError::StackUnderflow {
                requested: arg_size,
                available: sp,
            });
        }

        let result = {
            let mut call = NativeCall::new(&native, &self.stack, sp - arg_size);
            (native.entry)(&mut call)?;
            call.finish()?
        };
        self.stack.drop_bytes(arg_size)?;
        self.stack.push_bytes(&result)?;
        Ok(())
    }

    fn pop_number(&mut self, kind: Primitive) -> Result<Number, VmError> {
        Ok(match kind {
            Primitive::Int => Number::Int(self.stack.pop()?),
            Primitive::Float => Number::Float(self.stack.pop()?),
            Primitive::Char => Number::Char(self.stack.pop()?),
            Primitive::Bool => Number::Char(u8::from(self.stack.pop::<bool>()?)),
        })
    }

    fn arith(&mut self, entry: &ArithEntry) -> Result<(), VmError> {
        let right = self.pop_number(entry.right)?;
        let left = self.pop_number(entry.left)?;

        match entry.operand_kind() {
            Primitive::Float => {
                let (a, b) = (left.float(), right.float());
                match entry.op {
                    BinaryOp::Add => self.stack.push(a + b),
                    BinaryOp::Sub => self.stack.push(a - b),
                    BinaryOp::Mul => self.stack.push(a * b),
                    BinaryOp::Div => self.stack.push(a / b),
                    op => self.stack.push(compare(op, a, b)),
                }
            }
            Primitive::Char => {
                let (a, b) = (left.char(), right.char());
                match entry.op {
                    BinaryOp::Add => self.stack.push(a.wrapping_add(b)),
                    BinaryOp::Sub => self.stack.push(a.wrapping_sub(b)),
                    BinaryOp::Mul => self.stack.push(a.wrapping_mul(b)),
                    BinaryOp::Div => {
                        let q = a.checked_div(b).ok_or(VmError::DivisionByZero)?;
                        self.stack.push(q)
                    }
                    op => self.stack.push(compare(op, a, b)),
                }
            }
            _ => {
                let (a, b) = (left.int(), right.int());
                match entry.op {
                    BinaryOp::Add => self.stack.push(a.wrapping_add(b)),
                    BinaryOp::Sub => self.stack.push(a.wrapping_sub(b)),
                    BinaryOp::Mul => self.stack.push(a.wrapping_mul(b)),
                    BinaryOp::Div => {
                        if b == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        self.stack.push(a.wrapping_div(b))
                    }
                    op => self.stack.push(compare(op, a, b)),
                }
            }
        }
    }

    fn cast(&mut self, entry: &CastEntry) -> Result<(), VmError> {
        let value = self.pop_number(entry.from)?;
        match entry.to {
            Primitive::Int => self.stack.push(value.int()),
            Primitive::Float => self.stack.push(value.float()),
            Primitive::Char => self.stack.push(value.char()),
            Primitive::Bool => self.stack.push(value.truthy()),
        }
    }
}

impl Number {
    fn int(self) -> i32 {
        match self {
            Number::Int(i) => i,
            Number::Float(f) => f as i32,
            Number::Char(c) => i32::from(c),
        }
    }

    fn float(self) -> f32 {
        match self {
            Number::Int(i) => i as f32,
            Number::Float(f) => f,
            Number::Char(c) => f32::from(c),
        }
    }

    /// Truncates to the low byte.
    fn char(self) -> u8 {
        match self {
            Number::Int(i) => i as u8,
            Number::Float(f) => f as u8,
            Number::Char(c) => c,
        }
    }

    fn truthy(self) -> bool {
        match self {
            Number::Int(i) => i != 0,
            Number::Float(f) => f != 0.0,
            Number::Char(c) => c != 0,
        }
    }
}

fn compare<T: PartialOrd>(op: BinaryOp, a: T, b: T) -> bool {
    match op {
        BinaryOp::Gt => a > b,
        BinaryOp::Lt => a < b,
        BinaryOp::Ge => a >= b,
        BinaryOp::Le => a <= b,
        _ => a == b,
    }
}

fn to_address(address: i64, len: u32) -> Result<u32, VmError> {
    u32::try_from(address).map_err(|_| VmError::InvalidAddress { address, len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::emit::LinkEntry;
    use crate::bytecode::op::{arith_entry, arith_opcode, cast_entry, cast_opcode};
    use crate::runtime::native::{NativeSignature, ValueKind};

    fn assemble(instrs: &[Instr]) -> Vec<u8> {
        let mut code = Vec::new();
        for instr in instrs {
            instr.encode(&mut code);
        }
        code
    }

    fn program(instrs: &[Instr]) -> Program {
        Program {
            externals: Vec::new(),
            code: assemble(instrs),
            entry: 0,
        }
    }

    fn arith(op: BinaryOp, l: Primitive, r: Primitive) -> Instr<'static> {
        Instr::Arith(arith_opcode(op, l, r).and_then(arith_entry).unwrap())
    }

    fn cast(from: Primitive, to: Primitive) -> Instr<'static> {
        Instr::Cast(cast_opcode(from, to).and_then(cast_entry).unwrap())
    }

    fn run(instrs: &[Instr]) -> Result<Vec<u8>, RuntimeError> {
        let program = program(instrs);
        Vm::new(&program, &NativeRegistry::new(), VmConfig::default()).run()
    }

    fn run_int(instrs: &[Instr]) -> i32 {
        let bytes = run(instrs).unwrap();
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn error(instrs: &[Instr]) -> VmError {
        run(instrs).unwrap_err().error
    }

    #[test]
    fn test_arithmetic_with_promotion() {
        let result = run_int(&[
            Instr::CreateFrame(0),
            Instr::PushConst4(2),
            Instr::PushConst1(b'a'),
            arith(BinaryOp::Add, Primitive::Int, Primitive::Char),
            Instr::PushConst4(3),
            arith(BinaryOp::Mul, Primitive::Int, Primitive::Int),
            Instr::Return { ret: 4, args: 0 },
        ]);
        assert_eq!(result, (2 + 97) * 3);
    }

    #[test]
    fn test_float_division_and_cast() {
        let result = run_int(&[
            Instr::CreateFrame(0),
            Instr::PushConst4(7.0f32.to_bits()),
            Instr::PushConst4(2),
            arith(BinaryOp::Div, Primitive::Float, Primitive::Int),
            cast(Primitive::Float, Primitive::Int),
            Instr::Return { ret: 4, args: 0 },
        ]);
        assert_eq!(result, 3);
    }

    #[test]
    fn test_comparison_pushes_bool() {
        let bytes = run(&[
            Instr::CreateFrame(0),
            Instr::PushConst1(b'z'),
            Instr::PushConst4(100),
            arith(BinaryOp::Gt, Primitive::Char, Primitive::Int),
            Instr::Return { ret: 1, args: 0 },
        ])
        .unwrap();
        assert_eq!(bytes, vec![1]);
    }

    #[test]
    fn test_division_by_zero_faults() {
        let err = error(&[
            Instr::CreateFrame(0),
            Instr::PushConst4(1),
            Instr::PushConst4(0),
            arith(BinaryOp::Div, Primitive::Int, Primitive::Int),
            Instr::Return { ret: 4, args: 0 },
        ]);
        assert_eq!(err, VmError::DivisionByZero);
    }

    #[test]
    fn test_int_min_divided_by_minus_one_wraps() {
        let result = run_int(&[
            Instr::CreateFrame(0),
            Instr::PushConst4(i32::MIN as u32),
            Instr::PushConst4(-1i32 as u32),
            arith(BinaryOp::Div, Primitive::Int, Primitive::Int),
            Instr::Return { ret: 4, args: 0 },
        ]);
        assert_eq!(result, i32::MIN);
    }

    #[test]
    fn test_locals_and_indirect_access() {
        // local[0] = 5; store 9 through &local[4]; return local[0] + local[4]
        let result = run_int(&[
            Instr::CreateFrame(8),
            Instr::PushConst4(5),
            Instr::Store(Access::Local(0), 4),
            Instr::PushConst4(9),
            Instr::PushAddrLocal(0),
            Instr::AddrAdd(4),
            Instr::Store(Access::Indirect, 4),
            Instr::Load(Access::Local(0), 4),
            Instr::Load(Access::Local(4), 4),
            arith(BinaryOp::Add, Primitive::Int, Primitive::Int),
            Instr::Return { ret: 4, args: 0 },
        ]);
        assert_eq!(result, 14);
    }

    #[test]
    fn test_address_index() {
        // Frame base is 4, so the element at index 2 of 4-byte elements is at 12.
        let result = run_int(&[
            Instr::CreateFrame(12),
            Instr::PushAddrLocal(0),
            Instr::PushConst4(2),
            Instr::AddrIndex(4),
            Instr::Return { ret: 4, args: 0 },
        ]);
        assert_eq!(result, 12);
    }

    #[test]
    fn test_call_and_return_restore_frame() {
        // <start>: frame; push 20; call double; return 4
        // double(x): frame; x + x; return(4, 4)
        let start = assemble(&[
            Instr::CreateFrame(0),
            Instr::PushConst4(20),
            Instr::Call(0),
            Instr::Return { ret: 4, args: 0 },
        ]);
        let double_at = start.len() as u32;
        let mut code = assemble(&[
            Instr::CreateFrame(0),
            Instr::PushConst4(20),
            Instr::Call(double_at),
            Instr::Return { ret: 4, args: 0 },
        ]);
        code.extend(assemble(&[
            Instr::CreateFrame(0),
            Instr::Load(Access::Local(-12), 4),
            Instr::Load(Access::Local(-12), 4),
            arith(BinaryOp::Add, Primitive::Int, Primitive::Int),
            Instr::Return { ret: 4, args: 4 },
        ]));
        let program = Program {
            externals: Vec::new(),
            code,
            entry: 0,
        };

        let mut vm = Vm::new(&program, &NativeRegistry::new(), VmConfig::default());
        let result = vm.run().unwrap();
        assert_eq!(result, 40i32.to_le_bytes().to_vec());
        assert_eq!(vm.depth(), 0);
        assert_eq!(vm.state(), VmState::Halted);
    }

    #[test]
    fn test_runaway_recursion_hits_depth_limit() {
        let program = program(&[Instr::CreateFrame(0), Instr::Call(0)]);
        let config = VmConfig {
            max_call_depth: 10,
            ..VmConfig::default()
        };
        let mut vm = Vm::new(&program, &NativeRegistry::new(), config);
        let err = vm.run().unwrap_err();
        assert_eq!(err.error, VmError::CallDepthExceeded(10));
        assert_eq!(err.call_stack.len(), 11);
        assert_eq!(vm.state(), VmState::Faulted);
    }

    #[test]
    fn test_stack_overflow_faults() {
        let program = program(&[Instr::CreateFrame(0), Instr::PushZero(64), Instr::Jump(0)]);
        let config = VmConfig {
            stack_size: 256,
            ..VmConfig::default()
        };
        let err = Vm::new(&program, &NativeRegistry::new(), config)
            .run()
            .unwrap_err();
        assert!(matches!(err.error, VmError::StackOverflow { .. }));
    }

    #[test]
    fn test_step_limit() {
        let program = program(&[Instr::Jump(0)]);
        let config = VmConfig {
            max_steps: Some(100),
            ..VmConfig::default()
        };
        let err = Vm::new(&program, &NativeRegistry::new(), config)
            .run()
            .unwrap_err();
        assert_eq!(err.error, VmError::StepLimitExceeded(100));
        assert_eq!(err.pc, 0);
    }

    #[test]
    fn test_unknown_opcode_and_running_off_the_end() {
        let program = Program {
            externals: Vec::new(),
            code: vec![0xFF],
            entry: 0,
        };
        let err = Vm::new(&program, &NativeRegistry::new(), VmConfig::default())
            .run()
            .unwrap_err();
        assert_eq!(err.error, VmError::UnknownOpcode(0xFF));

        assert_eq!(error(&[Instr::PushZero(4)]), VmError::PcOutOfBounds(5));
    }

    #[test]
    fn test_negative_local_address_is_invalid() {
        let err = error(&[Instr::Load(Access::Local(-8), 4)]);
        assert_eq!(err, VmError::InvalidAddress { address: -8, len: 4 });
    }

    fn with_externals(instrs: &[Instr], names: &[&str]) -> Program {
        let mut program = program(instrs);
        program.externals = names
            .iter()
            .enumerate()
            .map(|(i, name)| LinkEntry {
                index: i as u32,
                name: name.to_string(),
            })
            .collect();
        program
    }

    #[test]
    fn test_native_call_through_registry() {
        let mut natives = NativeRegistry::new();
        natives.register(
            "square",
            NativeSignature::new(vec![ValueKind::Int], Some(ValueKind::Int)),
            |call| {
                let v = call.int(0)?;
                call.return_int(v * v)
            },
        );
        let program = with_externals(
            &[
                Instr::CreateFrame(0),
                Instr::PushConst4(9),
                Instr::CallExternal(0),
                Instr::Return { ret: 4, args: 0 },
            ],
            &["square"],
        );

        let mut vm = Vm::new(&program, &natives, VmConfig::default());
        assert_eq!(vm.run().unwrap(), 81i32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_unbound_external_faults_only_when_called() {
        let idle = with_externals(
            &[
                Instr::CreateFrame(0),
                Instr::PushConst4(1),
                Instr::Return { ret: 4, args: 0 },
            ],
            &["missing"],
        );
        assert!(Vm::new(&idle, &NativeRegistry::new(), VmConfig::default())
            .run()
            .is_ok());

        let calling = with_externals(
            &[Instr::CreateFrame(0), Instr::CallExternal(0)],
            &["missing"],
        );
        let err = Vm::new(&calling, &NativeRegistry::new(), VmConfig::default())
            .run()
            .unwrap_err();
        assert_eq!(err.error, VmError::UnresolvedExternal("missing".to_string()));
    }

    #[test]
    fn test_fault_location_from_debug_info() {
        use crate::bytecode::debug::FunctionInfo;
        use crate::bytecode::emit::LineEntry;

        let program = program(&[
            Instr::CreateFrame(0),
            Instr::PushConst4(1),
            Instr::PushConst4(0),
            arith(BinaryOp::Div, Primitive::Int, Primitive::Int),
        ]);
        let debug = DebugInfo {
            file: "div.cn".to_string(),
            functions: vec![FunctionInfo {
                name: "<start>".to_string(),
                signature: "<start>".to_string(),
                start: 0,
                end: program.code.len() as u32,
            }],
            lines: vec![LineEntry { offset: 5, line: 7 }],
        };
        let err = Vm::new(&program, &NativeRegistry::new(), VmConfig::default())
            .with_debug_info(&debug)
            .run()
            .unwrap_err();
        assert_eq!(err.location.as_deref(), Some("<start> at div.cn:7"));
        assert_eq!(err.call_stack, vec!["<start>".to_string()]);
    }
}
