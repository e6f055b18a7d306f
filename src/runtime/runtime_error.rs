use thiserror::Error;

use crate::bytecode::op::DecodeError;

/// Why the machine stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("instruction runs past the end of the code")]
    Truncated,
    #[error("program counter {0} is outside the code")]
    PcOutOfBounds(u32),
    #[error("stack overflow: {requested} bytes requested with {available} of {capacity} free")]
    StackOverflow {
        requested: u32,
        available: u32,
        capacity: u32,
    },
    #[error("stack underflow: {requested} bytes requested but only {available} on the stack")]
    StackUnderflow { requested: u32, available: u32 },
    #[error("invalid address {address} for {len} bytes")]
    InvalidAddress { address: i64, len: u32 },
    #[error("division by zero")]
    DivisionByZero,
    #[error("call to unresolved external '{0}'")]
    UnresolvedExternal(String),
    #[error("native '{name}' broke its contract: {reason}")]
    NativeContract { name: String, reason: String },
    #[error("native '{name}' failed: {reason}")]
    Native { name: String, reason: String },
    #[error("call depth limit exceeded ({0})")]
    CallDepthExceeded(usize),
    #[error("execution step limit exceeded ({0})")]
    StepLimitExceeded(u64),
}

impl From<DecodeError> for VmError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownOpcode { opcode, .. } => VmError::UnknownOpcode(opcode),
            DecodeError::Truncated { .. } => VmError::Truncated,
        }
    }
}

/// A fault with the place it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub error: VmError,
    pub pc: u32,
    /// `function at file:line`, when debug info was attached.
    pub location: Option<String>,
    /// Outermost call first.
    pub call_stack: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {} (pc {:04}", self.error, self.pc)?;
        if let Some(location) = &self.location {
            write!(f, ", {}", location)?;
        }
        write!(f, ")")?;

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().rev().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lists_innermost_call_first() {
        let err = RuntimeError {
            error: VmError::DivisionByZero,
            pc: 42,
            location: Some("div at calc.cn:3".to_string()),
            call_stack: vec!["<start>".to_string(), "main".to_string(), "div".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "runtime error: division by zero (pc 0042, div at calc.cn:3)\n  \
             call stack:\n    0: div\n    1: main\n    2: <start>"
        );
    }

    #[test]
    fn test_decode_errors_convert() {
        let err: VmError = DecodeError::UnknownOpcode { opcode: 0xEE, at: 3 }.into();
        assert_eq!(err, VmError::UnknownOpcode(0xEE));
        assert_eq!(err.to_string(), "unknown opcode 0xee");
    }
}
