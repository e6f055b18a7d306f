use std::fmt;
use std::sync::LazyLock;

use thiserror::Error;

use crate::lang::expr::BinaryOp;
use crate::lang::types::Primitive;

// =============================================================================
// OPCODES - one byte each, operands follow little-endian
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // frames and control flow
    CreateFrame = 0x01,  // u32 size
    Call = 0x02,         // u32 code offset
    CallExternal = 0x03, // u32 link index
    Return = 0x04,       // u32 result size, u32 argument size
    Jump = 0x05,         // u32 code offset
    JumpIfFalse = 0x06,  // u32 code offset; pops a bool

    // constants and raw stack
    PushConst1 = 0x10, // u8
    PushConst4 = 0x11, // u32
    PushBytes = 0x12,  // u32 length, then the bytes
    PushZero = 0x13,   // u32 count
    Pop = 0x14,        // u32 count

    // addresses
    PushAddrLocal = 0x18,  // i32 frame offset
    PushAddrGlobal = 0x19, // u32 address
    AddrAdd = 0x1A,        // u32 offset; pops an address
    AddrIndex = 0x1B,      // u32 scale; pops an int index, then an address

    // loads push, stores pop
    Load1Local = 0x20,   // i32
    LoadXLocal = 0x21,   // i32, u32 size
    Load1Global = 0x22,  // u32
    LoadXGlobal = 0x23,  // u32, u32 size
    Load1Ind = 0x24,     // pops an address
    LoadXInd = 0x25,     // u32 size; pops an address
    Store1Local = 0x28,  // i32
    StoreXLocal = 0x29,  // i32, u32 size
    Store1Global = 0x2A, // u32
    StoreXGlobal = 0x2B, // u32, u32 size
    Store1Ind = 0x2C,    // pops an address, then the value
    StoreXInd = 0x2D,    // u32 size; pops an address, then the value
}

/// First arithmetic opcode; 81 entries follow, one per `(operator, left, right)`.
pub const ARITH_BASE: u8 = 0x40;
/// First cast opcode; 16 slots follow, indexed by `from * 4 + to`.
pub const CAST_BASE: u8 = 0xA0;

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        let op = match byte {
            0x01 => CreateFrame,
            0x02 => Call,
            0x03 => CallExternal,
            0x04 => Return,
            0x05 => Jump,
            0x06 => JumpIfFalse,
            0x10 => PushConst1,
            0x11 => PushConst4,
            0x12 => PushBytes,
            0x13 => PushZero,
            0x14 => Pop,
            0x18 => PushAddrLocal,
            0x19 => PushAddrGlobal,
            0x1A => AddrAdd,
            0x1B => AddrIndex,
            0x20 => Load1Local,
            0x21 => LoadXLocal,
            0x22 => Load1Global,
            0x23 => LoadXGlobal,
            0x24 => Load1Ind,
            0x25 => LoadXInd,
            0x28 => Store1Local,
            0x29 => StoreXLocal,
            0x2A => Store1Global,
            0x2B => StoreXGlobal,
            0x2C => Store1Ind,
            0x2D => StoreXInd,
            _ => return None,
        };
        Some(op)
    }
}

// =============================================================================
// DISPATCH TABLES
// =============================================================================

/// One type-specialized arithmetic or comparison instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithEntry {
    pub opcode: u8,
    pub op: BinaryOp,
    pub left: Primitive,
    pub right: Primitive,
}

impl ArithEntry {
    /// Kind both operands are promoted to before the operation.
    pub fn operand_kind(&self) -> Primitive {
        BinaryOp::operand_kind(self.left, self.right).unwrap_or(Primitive::Int)
    }

    pub fn result_kind(&self) -> Primitive {
        self.op
            .result_kind(self.left, self.right)
            .unwrap_or(Primitive::Int)
    }

    pub fn mnemonic(&self) -> String {
        format!("{}.{}.{}", self.op.mnemonic(), self.left, self.right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastEntry {
    pub opcode: u8,
    pub from: Primitive,
    pub to: Primitive,
}

fn numeric_index(kind: Primitive) -> Option<usize> {
    Primitive::NUMERIC.iter().position(|k| *k == kind)
}

static ARITH_TABLE: LazyLock<Vec<ArithEntry>> = LazyLock::new(|| {
    let mut table = Vec::with_capacity(BinaryOp::ALL.len() * 9);
    for op in BinaryOp::ALL {
        for left in Primitive::NUMERIC {
            for right in Primitive::NUMERIC {
                table.push(ArithEntry {
                    opcode: ARITH_BASE + table.len() as u8,
                    op,
                    left,
                    right,
                });
            }
        }
    }
    table
});

static CAST_TABLE: LazyLock<[Option<CastEntry>; 16]> = LazyLock::new(|| {
    let mut table = [None; 16];
    for from in Primitive::ALL {
        for to in Primitive::ALL {
            if from == to {
                continue;
            }
            let slot = from.index() * 4 + to.index();
            table[slot] = Some(CastEntry {
                opcode: CAST_BASE + slot as u8,
                from,
                to,
            });
        }
    }
    table
});

/// Opcode for `left op right`, or `None` when either side is not numeric.
pub fn arith_opcode(op: BinaryOp, left: Primitive, right: Primitive) -> Option<u8> {
    let slot = op.index() * 9 + numeric_index(left)? * 3 + numeric_index(right)?;
    ARITH_TABLE.get(slot).map(|entry| entry.opcode)
}

pub fn arith_entry(opcode: u8) -> Option<&'static ArithEntry> {
    ARITH_TABLE.get(opcode.checked_sub(ARITH_BASE)? as usize)
}

/// Opcode converting `from` to `to`; identity conversions have none.
pub fn cast_opcode(from: Primitive, to: Primitive) -> Option<u8> {
    CAST_TABLE[from.index() * 4 + to.index()].map(|entry| entry.opcode)
}

pub fn cast_entry(opcode: u8) -> Option<&'static CastEntry> {
    CAST_TABLE
        .get(opcode.checked_sub(CAST_BASE)? as usize)?
        .as_ref()
}

// =============================================================================
// INSTRUCTIONS
// =============================================================================

/// Where a load reads from or a store writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Local(i32),
    Global(u32),
    /// Through an address popped from the stack.
    Indirect,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Local(offset) => write!(f, "local[{}]", offset),
            Access::Global(address) => write!(f, "global[{}]", address),
            Access::Indirect => write!(f, "[addr]"),
        }
    }
}

/// A decoded instruction. `PushBytes` borrows its payload from the code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instr<'a> {
    CreateFrame(u32),
    Call(u32),
    CallExternal(u32),
    Return { ret: u32, args: u32 },
    Jump(u32),
    JumpIfFalse(u32),
    PushConst1(u8),
    PushConst4(u32),
    PushBytes(&'a [u8]),
    PushZero(u32),
    Pop(u32),
    PushAddrLocal(i32),
    PushAddrGlobal(u32),
    AddrAdd(u32),
    AddrIndex(u32),
    Load(Access, u32),
    Store(Access, u32),
    Arith(&'static ArithEntry),
    Cast(&'static CastEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{opcode:02x} at {at}")]
    UnknownOpcode { opcode: u8, at: usize },
    #[error("instruction at {at} runs past the end of the code")]
    Truncated { at: usize },
}

struct Reader<'a> {
    code: &'a [u8],
    start: usize,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.code.len());
        let Some(end) = end else {
            return Err(DecodeError::Truncated { at: self.start });
        };
        let slice = &self.code[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }
}

impl<'a> Instr<'a> {
    /// Decodes the instruction at `pc`, returning it with its encoded length.
    pub fn decode(code: &'a [u8], pc: usize) -> Result<(Instr<'a>, usize), DecodeError> {
        let mut r = Reader {
            code,
            start: pc,
            pos: pc,
        };
        let byte = r.u8()?;

        if let Some(entry) = arith_entry(byte) {
            return Ok((Instr::Arith(entry), 1));
        }
        if let Some(entry) = cast_entry(byte) {
            return Ok((Instr::Cast(entry), 1));
        }
        let Some(opcode) = Opcode::from_byte(byte) else {
            return Err(DecodeError::UnknownOpcode {
                opcode: byte,
                at: pc,
            });
        };

        use Opcode::*;
        let instr = match opcode {
            CreateFrame => Instr::CreateFrame(r.u32()?),
            Call => Instr::Call(r.u32()?),
            CallExternal => Instr::CallExternal(r.u32()?),
            Return => Instr::Return {
                ret: r.u32()?,
                args: r.u32()?,
            },
            Jump => Instr::Jump(r.u32()?),
            JumpIfFalse => Instr::JumpIfFalse(r.u32()?),
            PushConst1 => Instr::PushConst1(r.u8()?),
            PushConst4 => Instr::PushConst4(r.u32()?),
            PushBytes => {
                let len = r.u32()? as usize;
                Instr::PushBytes(r.bytes(len)?)
            }
            PushZero => Instr::PushZero(r.u32()?),
            Pop => Instr::Pop(r.u32()?),
            PushAddrLocal => Instr::PushAddrLocal(r.i32()?),
            PushAddrGlobal => Instr::PushAddrGlobal(r.u32()?),
            AddrAdd => Instr::AddrAdd(r.u32()?),
            AddrIndex => Instr::AddrIndex(r.u32()?),
            Load1Local => Instr::Load(Access::Local(r.i32()?), 1),
            LoadXLocal => Instr::Load(Access::Local(r.i32()?), r.u32()?),
            Load1Global => Instr::Load(Access::Global(r.u32()?), 1),
            LoadXGlobal => Instr::Load(Access::Global(r.u32()?), r.u32()?),
            Load1Ind => Instr::Load(Access::Indirect, 1),
            LoadXInd => Instr::Load(Access::Indirect, r.u32()?),
            Store1Local => Instr::Store(Access::Local(r.i32()?), 1),
            StoreXLocal => Instr::Store(Access::Local(r.i32()?), r.u32()?),
            Store1Global => Instr::Store(Access::Global(r.u32()?), 1),
            StoreXGlobal => Instr::Store(Access::Global(r.u32()?), r.u32()?),
            Store1Ind => Instr::Store(Access::Indirect, 1),
            StoreXInd => Instr::Store(Access::Indirect, r.u32()?),
        };
        Ok((instr, r.pos - pc))
    }

    /// Appends the encoded instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        fn op(out: &mut Vec<u8>, opcode: Opcode) {
            out.push(opcode as u8);
        }
        fn u32(out: &mut Vec<u8>, v: u32) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        fn i32(out: &mut Vec<u8>, v: i32) {
            out.extend_from_slice(&v.to_le_bytes());
        }

        match *self {
            Instr::CreateFrame(n) => {
                op(out, Opcode::CreateFrame);
                u32(out, n);
            }
            Instr::Call(target) => {
                op(out, Opcode::Call);
                u32(out, target);
            }
            Instr::CallExternal(index) => {
                op(out, Opcode::CallExternal);
                u32(out, index);
            }
            Instr::Return { ret, args } => {
                op(out, Opcode::Return);
                u32(out, ret);
                u32(out, args);
            }
            Instr::Jump(target) => {
                op(out, Opcode::Jump);
                u32(out, target);
            }
            Instr::JumpIfFalse(target) => {
                op(out, Opcode::JumpIfFalse);
                u32(out, target);
            }
            Instr::PushConst1(v) => {
                op(out, Opcode::PushConst1);
                out.push(v);
            }
            Instr::PushConst4(v) => {
                op(out, Opcode::PushConst4);
                u32(out, v);
            }
            Instr::PushBytes(bytes) => {
                op(out, Opcode::PushBytes);
                u32(out, bytes.len() as u32);
                out.extend_from_slice(bytes);
            }
            Instr::PushZero(n) => {
                op(out, Opcode::PushZero);
                u32(out, n);
            }
            Instr::Pop(n) => {
                op(out, Opcode::Pop);
                u32(out, n);
            }
            Instr::PushAddrLocal(offset) => {
                op(out, Opcode::PushAddrLocal);
                i32(out, offset);
            }
            Instr::PushAddrGlobal(address) => {
                op(out, Opcode::PushAddrGlobal);
                u32(out, address);
            }
            Instr::AddrAdd(offset) => {
                op(out, Opcode::AddrAdd);
                u32(out, offset);
            }
            Instr::AddrIndex(scale) => {
                op(out, Opcode::AddrIndex);
                u32(out, scale);
            }
            Instr::Load(access, n) => {
                let (one, many) = match access {
                    Access::Local(_) => (Opcode::Load1Local, Opcode::LoadXLocal),
                    Access::Global(_) => (Opcode::Load1Global, Opcode::LoadXGlobal),
                    Access::Indirect => (Opcode::Load1Ind, Opcode::LoadXInd),
                };
                encode_access(out, access, n, one, many);
            }
            Instr::Store(access, n) => {
                let (one, many) = match access {
                    Access::Local(_) => (Opcode::Store1Local, Opcode::StoreXLocal),
                    Access::Global(_) => (Opcode::Store1Global, Opcode::StoreXGlobal),
                    Access::Indirect => (Opcode::Store1Ind, Opcode::StoreXInd),
                };
                encode_access(out, access, n, one, many);
            }
            Instr::Arith(entry) => out.push(entry.opcode),
            Instr::Cast(entry) => out.push(entry.opcode),
        }
    }
}

fn encode_access(out: &mut Vec<u8>, access: Access, n: u32, one: Opcode, many: Opcode) {
    out.push(if n == 1 { one as u8 } else { many as u8 });
    match access {
        Access::Local(offset) => out.extend_from_slice(&offset.to_le_bytes()),
        Access::Global(address) => out.extend_from_slice(&address.to_le_bytes()),
        Access::Indirect => {}
    }
    if n != 1 {
        out.extend_from_slice(&n.to_le_bytes());
    }
}

impl Instr<'_> {
    pub fn mnemonic(&self) -> String {
        let name = match self {
            Instr::CreateFrame(_) => "CREATE_FRAME",
            Instr::Call(_) => "CALL",
            Instr::CallExternal(_) => "CALL_EXT",
            Instr::Return { .. } => "RETURN",
            Instr::Jump(_) => "JUMP",
            Instr::JumpIfFalse(_) => "JUMP_FALSE",
            Instr::PushConst1(_) => "PUSH1",
            Instr::PushConst4(_) => "PUSH4",
            Instr::PushBytes(_) => "PUSH_BYTES",
            Instr::PushZero(_) => "PUSH_ZERO",
            Instr::Pop(_) => "POP",
            Instr::PushAddrLocal(_) | Instr::PushAddrGlobal(_) => "ADDR",
            Instr::AddrAdd(_) => "ADDR_ADD",
            Instr::AddrIndex(_) => "ADDR_INDEX",
            Instr::Load(_, 1) => "LOAD1",
            Instr::Load(..) => "LOADX",
            Instr::Store(_, 1) => "STORE1",
            Instr::Store(..) => "STOREX",
            Instr::Arith(entry) => return entry.mnemonic().to_uppercase(),
            Instr::Cast(entry) => return format!("CAST.{}.{}", entry.from, entry.to).to_uppercase(),
        };
        name.to_string()
    }

    /// Code offset this instruction may transfer control to.
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Instr::Jump(target) | Instr::JumpIfFalse(target) => Some(*target),
            _ => None,
        }
    }
}

impl fmt::Display for Instr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = self.mnemonic();
        match self {
            Instr::CreateFrame(n) | Instr::PushZero(n) | Instr::Pop(n) | Instr::AddrAdd(n) => {
                write!(f, "{:<12}{}", mnemonic, n)
            }
            Instr::Call(target) | Instr::Jump(target) | Instr::JumpIfFalse(target) => {
                write!(f, "{:<12}@{:04}", mnemonic, target)
            }
            Instr::CallExternal(index) => write!(f, "{:<12}#{}", mnemonic, index),
            Instr::Return { ret, args } => write!(f, "{:<12}ret={} args={}", mnemonic, ret, args),
            Instr::PushConst1(v) => write!(f, "{:<12}{}", mnemonic, v),
            Instr::PushConst4(v) => {
                write!(f, "{:<12}{} ; {:?}", mnemonic, *v as i32, f32::from_bits(*v))
            }
            Instr::PushBytes(bytes) => {
                write!(f, "{:<12}{:?}", mnemonic, String::from_utf8_lossy(bytes))
            }
            Instr::PushAddrLocal(offset) => write!(f, "{:<12}local[{}]", mnemonic, offset),
            Instr::PushAddrGlobal(address) => write!(f, "{:<12}global[{}]", mnemonic, address),
            Instr::AddrIndex(scale) => write!(f, "{:<12}*{}", mnemonic, scale),
            Instr::Load(access, 1) | Instr::Store(access, 1) => {
                write!(f, "{:<12}{}", mnemonic, access)
            }
            Instr::Load(access, n) | Instr::Store(access, n) => {
                write!(f, "{:<12}{} {}", mnemonic, access, n)
            }
            Instr::Arith(_) | Instr::Cast(_) => f.write_str(&mnemonic),
        }
    }
}
