//! # Cinder
//!
//! A toolchain for a small statically typed language: a two-pass front end producing a
//! typed tree, a code generator and linker producing byte-addressed stack bytecode, and
//! the virtual machine that runs it.

pub mod bytecode;
pub mod diagnostics;
pub mod driver;
pub mod frontend;
pub mod lang;
pub mod runtime;

pub use bytecode::{Compiled, Program};
pub use driver::{Build, DriverError, RunOutcome, compile_file, compile_source, run_program};
pub use runtime::native::{NativeCall, NativeRegistry, NativeSignature, ValueKind};
pub use runtime::vm::{Vm, VmConfig, VmState};
