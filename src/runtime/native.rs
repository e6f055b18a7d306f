//! Host functions callable from compiled code through the link table.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::runtime::runtime_error::VmError;
use crate::runtime::stack::{Stack, StackValue};

/// Kind of one native argument or result as it sits on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Char,
    Bool,
    /// A stack address, passed for `ref` parameters.
    Address,
}

impl ValueKind {
    pub fn size(self) -> u32 {
        match self {
            ValueKind::Int | ValueKind::Float | ValueKind::Address => 4,
            ValueKind::Char | ValueKind::Bool => 1,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Char => "char",
            ValueKind::Bool => "bool",
            ValueKind::Address => "address",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSignature {
    pub params: Vec<ValueKind>,
    pub ret: Option<ValueKind>,
}

impl NativeSignature {
    pub fn new(params: Vec<ValueKind>, ret: Option<ValueKind>) -> Self {
        NativeSignature { params, ret }
    }

    /// Bytes of arguments the caller pushes.
    pub fn arg_size(&self) -> u32 {
        self.params.iter().map(|k| k.size()).sum()
    }

    pub fn ret_size(&self) -> u32 {
        self.ret.map(ValueKind::size).unwrap_or(0)
    }
}

pub type NativeFn = Rc<dyn Fn(&mut NativeCall<'_>) -> Result<(), VmError>>;

#[derive(Clone)]
pub struct Native {
    pub name: String,
    pub signature: NativeSignature,
    pub entry: NativeFn,
}

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Native")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Natives by the exact name the loader binds link-table entries against.
#[derive(Debug, Clone, Default)]
pub struct NativeRegistry {
    natives: HashMap<String, Native>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<String>, signature: NativeSignature, entry: F)
    where
        F: Fn(&mut NativeCall<'_>) -> Result<(), VmError> + 'static,
    {
        let name = name.into();
        self.natives.insert(
            name.clone(),
            Native {
                name,
                signature,
                entry: Rc::new(entry),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Native> {
        self.natives.get(name)
    }

    pub fn len(&self) -> usize {
        self.natives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.natives.is_empty()
    }
}

/// One invocation of a native: typed access to its arguments and to stack memory,
/// and a slot for its result.
pub struct NativeCall<'a> {
    native: &'a Native,
    stack: &'a Stack,
    /// Address of the first argument byte.
    args: u32,
    result: Option<(ValueKind, [u8; 4])>,
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(native: &'a Native, stack: &'a Stack, args: u32) -> Self {
        NativeCall {
            native,
            stack,
            args,
            result: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.native.name
    }

    fn contract(&self, reason: String) -> VmError {
        VmError::NativeContract {
            name: self.native.name.clone(),
            reason,
        }
    }

    /// Fails with `reason` attributed to this native.
    pub fn fail(&self, reason: impl fmt::Display) -> VmError {
        VmError::Native {
            name: self.native.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn arg<T: StackValue>(&self, index: usize, kind: ValueKind) -> Result<T, VmError> {
        let params = &self.native.signature.params;
        match params.get(index) {
            Some(found) if *found == kind => {}
            Some(found) => {
                return Err(self.contract(format!(
                    "argument {} is {}, read as {}",
                    index, found, kind
                )));
            }
            None => {
                return Err(self.contract(format!(
                    "argument {} requested but only {} declared",
                    index,
                    params.len()
                )));
            }
        }
        let offset: u32 = params[..index].iter().map(|k| k.size()).sum();
        self.stack.read_value(self.args + offset)
    }

    pub fn int(&self, index: usize) -> Result<i32, VmError> {
        self.arg(index, ValueKind::Int)
    }

    pub fn float(&self, index: usize) -> Result<f32, VmError> {
        self.arg(index, ValueKind::Float)
    }

    pub fn char(&self, index: usize) -> Result<u8, VmError> {
        self.arg(index, ValueKind::Char)
    }

    pub fn bool(&self, index: usize) -> Result<bool, VmError> {
        self.arg(index, ValueKind::Bool)
    }

    pub fn address(&self, index: usize) -> Result<u32, VmError> {
        self.arg(index, ValueKind::Address)
    }

    /// `n` bytes of stack memory starting at `address`.
    pub fn memory(&self, address: u32, n: u32) -> Result<&[u8], VmError> {
        self.stack.read(address, n)
    }

    /// Bytes from `address` up to (not including) the next NUL.
    pub fn c_string(&self, address: u32) -> Result<Vec<u8>, VmError> {
        let mut out = Vec::new();
        let mut at = address;
        loop {
            let byte: u8 = self.stack.read_value(at)?;
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
            at = at.checked_add(1).ok_or(VmError::InvalidAddress {
                address: i64::from(at) + 1,
                len: 1,
            })?;
        }
    }

    fn set_result(&mut self, kind: ValueKind, bytes: [u8; 4]) -> Result<(), VmError> {
        match self.native.signature.ret {
            Some(ret) if ret == kind => {
                self.result = Some((kind, bytes));
                Ok(())
            }
            Some(ret) => Err(self.contract(format!("returned {} but declares {}", kind, ret))),
            None => Err(self.contract(format!("returned {} but declares no result", kind))),
        }
    }

    pub fn return_int(&mut self, value: i32) -> Result<(), VmError> {
        self.set_result(ValueKind::Int, value.to_le_bytes())
    }

    pub fn return_float(&mut self, value: f32) -> Result<(), VmError> {
        self.set_result(ValueKind::Float, value.to_le_bytes())
    }

    pub fn return_char(&mut self, value: u8) -> Result<(), VmError> {
        self.set_result(ValueKind::Char, [value, 0, 0, 0])
    }

    pub fn return_bool(&mut self, value: bool) -> Result<(), VmError> {
        self.set_result(ValueKind::Bool, [u8::from(value), 0, 0, 0])
    }

    pub fn return_address(&mut self, value: u32) -> Result<(), VmError> {
        self.set_result(ValueKind::Address, value.to_le_bytes())
    }

    /// The result bytes to push, checked against the declared result.
    pub(crate) fn finish(self) -> Result<Vec<u8>, VmError> {
        match (self.native.signature.ret, self.result) {
            (None, None) => Ok(Vec::new()),
            (Some(_), Some((kind, bytes))) => Ok(bytes[..kind.size() as usize].to_vec()),
            (Some(ret), None) => Err(self.contract(format!("returned nothing but declares {}", ret))),
            (None, Some(_)) => Err(self.contract("returned a value but declares none".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NativeRegistry {
        let mut natives = NativeRegistry::new();
        natives.register(
            "add",
            NativeSignature::new(vec![ValueKind::Int, ValueKind::Char], Some(ValueKind::Int)),
            |call| {
                let sum = call.int(0)? + i32::from(call.char(1)?);
                call.return_int(sum)
            },
        );
        natives.register("bad", NativeSignature::new(vec![ValueKind::Int], None), |call| {
            call.float(0).map(|_| ())
        });
        natives
    }

    fn stack_with_args() -> Stack {
        let mut stack = Stack::new(16);
        stack.push(40i32).unwrap();
        stack.push(2u8).unwrap();
        stack
    }

    #[test]
    fn test_signature_sizes() {
        let sig = NativeSignature::new(vec![ValueKind::Address, ValueKind::Bool], Some(ValueKind::Float));
        assert_eq!(sig.arg_size(), 5);
        assert_eq!(sig.ret_size(), 4);
        assert_eq!(NativeSignature::new(Vec::new(), None).ret_size(), 0);
    }

    #[test]
    fn test_typed_arguments_and_result() {
        let natives = registry();
        let add = natives.get("add").unwrap();
        let stack = stack_with_args();
        let mut call = NativeCall::new(add, &stack, 0);
        (add.entry)(&mut call).unwrap();
        assert_eq!(call.finish().unwrap(), 42i32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_reading_wrong_kind_breaks_contract() {
        let natives = registry();
        let bad = natives.get("bad").unwrap();
        let stack = stack_with_args();
        let mut call = NativeCall::new(bad, &stack, 0);
        let err = (bad.entry)(&mut call).unwrap_err();
        assert_eq!(
            err,
            VmError::NativeContract {
                name: "bad".to_string(),
                reason: "argument 0 is int, read as float".to_string()
            }
        );
    }

    #[test]
    fn test_missing_result_breaks_contract() {
        let natives = registry();
        let add = natives.get("add").unwrap();
        let stack = stack_with_args();
        let call = NativeCall::new(add, &stack, 0);
        assert!(matches!(call.finish(), Err(VmError::NativeContract { .. })));
    }

    #[test]
    fn test_c_string() {
        let natives = registry();
        let mut stack = Stack::new(16);
        stack.push_bytes(b"hey\0").unwrap();
        let call = NativeCall::new(natives.get("add").unwrap(), &stack, 0);
        assert_eq!(call.c_string(0).unwrap(), b"hey".to_vec());
        assert!(call.c_string(4).is_err());
    }

    #[test]
    fn test_lookup_is_exact() {
        let natives = registry();
        assert!(natives.get("add").is_some());
        assert!(natives.get("math.add").is_none());
        assert_eq!(natives.len(), 2);
    }
}
