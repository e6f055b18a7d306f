//! Glue between the phases: source in, linked program and results out.
//!
//! Everything the command line does goes through here so the end-to-end tests can
//! exercise the same paths without spawning a process.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::bytecode::compile::{Compiled, generate};
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::debug::DebugInfo;
use crate::bytecode::format::{FormatError, Program};
use crate::bytecode::op::DecodeError;
use crate::diagnostics::CompileContext;
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::parse_module;
use crate::frontend::token_dumper::TokenDumper;
use crate::runtime::native::{NativeRegistry, ValueKind};
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm::{Vm, VmConfig};

/// Extension of source files; anything else is loaded as a compiled artifact.
pub const SOURCE_EXTENSION: &str = "cn";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Source diagnostics, already rendered.
    #[error("{rendered}\n{errors} error(s) in {file}")]
    Rejected {
        file: String,
        rendered: String,
        errors: usize,
    },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("malformed program: {0}")]
    Format(#[from] FormatError),

    #[error("malformed debug info: {0}")]
    Debug(#[from] postcard::Error),

    #[error("cannot disassemble: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// A successful compile and the warnings it produced.
#[derive(Debug, Clone)]
pub struct Build {
    pub compiled: Compiled,
    /// Rendered warnings, empty when there were none.
    pub warnings: String,
}

/// The start routine's result, with the kind it was returned as when known.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub bytes: Vec<u8>,
    pub kind: Option<ValueKind>,
}

impl RunOutcome {
    /// The result as `i32`, if the entry returned `int`.
    pub fn as_int(&self) -> Option<i32> {
        match (self.kind, self.bytes.as_slice()) {
            (Some(ValueKind::Int), [a, b, c, d]) => Some(i32::from_le_bytes([*a, *b, *c, *d])),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.bytes.as_slice();
        if let Ok(word) = <[u8; 4]>::try_from(bytes) {
            match self.kind {
                Some(ValueKind::Int) => return write!(f, "{}", i32::from_le_bytes(word)),
                Some(ValueKind::Float) => return write!(f, "{}", f32::from_le_bytes(word)),
                Some(ValueKind::Address) => return write!(f, "@{}", u32::from_le_bytes(word)),
                _ => {}
            }
        }
        match (self.kind, bytes) {
            (_, []) => Ok(()),
            (Some(ValueKind::Char), [c]) => write!(f, "{}", char::from(*c)),
            (Some(ValueKind::Bool), [b]) => write!(f, "{}", *b != 0),
            _ => {
                let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
                write!(f, "[{}]", hex.join(" "))
            }
        }
    }
}

/// Compiles `source`, reporting diagnostics against `file`.
pub fn compile_source(file: &str, source: &str, entry: &str) -> Result<Build, DriverError> {
    let mut ctx = CompileContext::new(file, source);
    let module = parse_module(&mut ctx);

    if ctx.diagnostics.has_errors() {
        return Err(DriverError::Rejected {
            file: file.to_string(),
            rendered: ctx.render_diagnostics(),
            errors: ctx.diagnostics.error_count(),
        });
    }
    tracing::debug!(file, functions = module.ast.functions.len(), "parsed");

    let compiled = generate(&module, file, entry)?;
    tracing::debug!(file, bytes = compiled.program.code.len(), "linked");

    Ok(Build {
        compiled,
        warnings: ctx.render_diagnostics(),
    })
}

pub fn compile_file(path: &Path, entry: &str) -> Result<Build, DriverError> {
    let source = read_source(path)?;
    compile_source(&path.display().to_string(), &source, entry)
}

pub fn read_source(path: &Path) -> Result<String, DriverError> {
    fs::read_to_string(path).map_err(|source| DriverError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub fn is_source(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SOURCE_EXTENSION)
}

/// Runs a program to completion and types its result from the debug info.
pub fn run_program(
    program: &Program,
    debug: Option<&DebugInfo>,
    natives: &NativeRegistry,
    config: VmConfig,
) -> Result<RunOutcome, DriverError> {
    let mut vm = Vm::new(program, natives, config);
    if let Some(debug) = debug {
        vm = vm.with_debug_info(debug);
    }
    let bytes = vm.run()?;
    Ok(RunOutcome {
        bytes,
        kind: debug.and_then(result_kind),
    })
}

/// Kind of the entry's result, read from the start routine's signature.
pub fn result_kind(debug: &DebugInfo) -> Option<ValueKind> {
    let start = debug.functions.iter().find(|f| f.name == "<start>")?;
    let (_, ret) = start.signature.rsplit_once(" -> ")?;
    match ret {
        "int" => Some(ValueKind::Int),
        "float" => Some(ValueKind::Float),
        "char" => Some(ValueKind::Char),
        "bool" => Some(ValueKind::Bool),
        _ if ret.starts_with("ref ") => Some(ValueKind::Address),
        _ => None,
    }
}

/// `<out>.dbg`
pub fn debug_path(out: &Path) -> PathBuf {
    let mut name = out.as_os_str().to_owned();
    name.push(".dbg");
    PathBuf::from(name)
}

/// Writes the linked binary to `out` and its debug info next to it.
pub fn write_artifact(compiled: &Compiled, out: &Path) -> Result<(), DriverError> {
    let write = |path: &Path, bytes: &[u8]| {
        fs::write(path, bytes).map_err(|source| DriverError::Write {
            path: path.to_path_buf(),
            source,
        })
    };
    write(out, &compiled.program.to_artifact())?;
    write(&debug_path(out), &compiled.debug.to_bytes()?)?;
    tracing::debug!(out = %out.display(), "artifact written");
    Ok(())
}

/// Loads a binary written by [`write_artifact`]. A missing sidecar is not an error.
pub fn read_artifact(path: &Path) -> Result<(Program, Option<DebugInfo>), DriverError> {
    let read = |path: &Path| {
        fs::read(path).map_err(|source| DriverError::Read {
            path: path.to_path_buf(),
            source,
        })
    };
    let program = Program::from_artifact(&read(path)?)?;

    let sidecar = debug_path(path);
    let debug = if sidecar.exists() {
        Some(DebugInfo::from_bytes(&read(&sidecar)?)?)
    } else {
        tracing::debug!(path = %sidecar.display(), "no debug info");
        None
    };
    Ok((program, debug))
}

/// Token listing for `cinder tokens`, followed by any lexical errors.
pub fn dump_tokens(file: &str, source: &str, color: bool) -> String {
    let mut ctx = CompileContext::new(file, source);
    let tokens = Lexer::new(source, ctx.file.clone()).tokenize(&mut ctx.diagnostics);

    let mut dumper = TokenDumper::new().pretty();
    if !color {
        dumper = dumper.no_color();
    }
    let mut out = dumper.dump(&tokens);
    out.push_str(&ctx.render_diagnostics());
    out
}
