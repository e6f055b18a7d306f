pub mod compile;
pub mod compile_error;
pub mod debug;
pub mod disasm;
pub mod emit;
pub mod format;
pub mod link;
pub mod op;

pub use compile::{Compiled, generate};
pub use format::Program;
