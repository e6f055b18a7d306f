use serde::{Deserialize, Serialize};

use crate::bytecode::emit::LineEntry;

/// Code range of one compiled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    /// Rendered signature, e.g. `fact(int) -> int`.
    pub signature: String,
    pub start: u32,
    pub end: u32,
}

/// Source metadata for a linked program, written next to the binary as `<out>.dbg`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub file: String,
    pub functions: Vec<FunctionInfo>,
    /// Sorted by offset.
    pub lines: Vec<LineEntry>,
}

impl DebugInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DebugInfo, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    pub fn function_at(&self, pc: u32) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.start <= pc && pc < f.end)
    }

    pub fn function_starting_at(&self, pc: u32) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.start == pc)
    }

    /// Source line of the statement that emitted the code at `pc`. Line 0 marks
    /// generated code.
    pub fn line_at(&self, pc: u32) -> Option<u32> {
        let next = self.lines.partition_point(|entry| entry.offset <= pc);
        next.checked_sub(1)
            .map(|i| self.lines[i].line)
            .filter(|line| *line > 0)
    }

    /// `name at file:line` for a fault location, as precise as the info allows.
    pub fn describe(&self, pc: u32) -> Option<String> {
        let function = self.function_at(pc)?;
        Some(match self.line_at(pc) {
            Some(line) => format!("{} at {}:{}", function.name, self.file, line),
            None => format!("{} in {}", function.name, self.file),
        })
    }
}
