use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use crate::bytecode::debug::DebugInfo;
use crate::bytecode::format::Program;
use crate::bytecode::op::{DecodeError, Instr};

/// Renders a linked program as text, one boxed section per function when debug
/// info is available and a single section otherwise.
pub fn disassemble(program: &Program, debug: Option<&DebugInfo>) -> Result<String, DecodeError> {
    let instrs = decode_all(&program.code)?;
    let jump_targets: BTreeSet<u32> = instrs.iter().filter_map(|(_, i)| i.jump_target()).collect();
    let externals: HashMap<u32, &str> = program
        .externals
        .iter()
        .map(|entry| (entry.index, entry.name.as_str()))
        .collect();

    let mut out = String::new();
    writeln!(out, "=== BYTECODE PROGRAM ===\n").ok();
    writeln!(out, "entry @{:04}", program.entry).ok();
    for entry in &program.externals {
        writeln!(out, "extern #{} {}", entry.index, entry.name).ok();
    }
    writeln!(out).ok();

    let sections = sections(program, debug);
    for (title, start, end) in &sections {
        let body: Vec<_> = instrs
            .iter()
            .filter(|(pc, _)| start <= pc && pc < end)
            .collect();

        writeln!(out, "════════════════════════════════════════").ok();
        writeln!(out, " {}", title).ok();
        writeln!(out, " {} instructions", body.len()).ok();
        writeln!(out, "════════════════════════════════════════").ok();

        for (pc, instr) in body {
            let target = jump_targets.contains(pc);
            if target {
                writeln!(out, "      ┌──────────────────────────────────").ok();
            }
            let marker = if target { "► " } else { "  " };
            write!(out, "{:04} {}{}", pc, marker, instr).ok();

            let line = debug.and_then(|d| d.line_at(*pc));
            let note = match instr {
                Instr::Call(callee) => debug
                    .and_then(|d| d.function_starting_at(*callee))
                    .map(|f| f.name.clone()),
                Instr::CallExternal(index) => externals.get(index).map(|name| name.to_string()),
                _ => None,
            };
            match (note, line) {
                (Some(note), Some(line)) => write!(out, "    ; {} (line {})", note, line).ok(),
                (Some(note), None) => write!(out, "    ; {}", note).ok(),
                (None, Some(line)) => write!(out, "    ; line {}", line).ok(),
                (None, None) => None,
            };
            writeln!(out).ok();
        }
        writeln!(out).ok();
    }
    Ok(out)
}

fn decode_all(code: &[u8]) -> Result<Vec<(u32, Instr<'_>)>, DecodeError> {
    let mut instrs = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let (instr, len) = Instr::decode(code, pc)?;
        instrs.push((pc as u32, instr));
        pc += len;
    }
    Ok(instrs)
}

/// `(title, start, end)` ranges covering the code.
fn sections(program: &Program, debug: Option<&DebugInfo>) -> Vec<(String, u32, u32)> {
    let end = program.code.len() as u32;
    match debug {
        Some(debug) if !debug.functions.is_empty() => {
            let mut functions: Vec<_> = debug.functions.iter().collect();
            functions.sort_by_key(|f| f.start);
            functions
                .into_iter()
                .map(|f| (f.signature.clone(), f.start, f.end))
                .collect()
        }
        _ => vec![("code".to_string(), 0, end)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::debug::FunctionInfo;
    use crate::bytecode::emit::{LineEntry, LinkEntry};
    use crate::bytecode::op::Access;

    fn program() -> Program {
        let mut code = Vec::new();
        for instr in [
            Instr::CreateFrame(0),
            Instr::PushConst4(1),
            Instr::JumpIfFalse(20),
            Instr::CallExternal(3),
            Instr::Load(Access::Local(-12), 4),
            Instr::Return { ret: 4, args: 4 },
        ] {
            instr.encode(&mut code);
        }
        Program {
            externals: vec![LinkEntry {
                index: 3,
                name: "newline".to_string(),
            }],
            code,
            entry: 0,
        }
    }

    #[test]
    fn test_plain_listing() {
        let text = disassemble(&program(), None).unwrap();
        assert!(text.contains("extern #3 newline"));
        assert!(text.contains(" code\n 6 instructions"));
        assert!(text.contains("0010   JUMP_FALSE  @0020"));
        assert!(text.contains("0015   CALL_EXT    #3    ; newline"));
        assert!(text.contains("┌──"));
        assert!(text.contains("0020 ► LOADX       local[-12] 4"));
    }

    #[test]
    fn test_sections_from_debug_info() {
        let program = program();
        let debug = DebugInfo {
            file: "t.cn".to_string(),
            functions: vec![FunctionInfo {
                name: "f".to_string(),
                signature: "f(int) -> int".to_string(),
                start: 0,
                end: program.code.len() as u32,
            }],
            lines: vec![LineEntry { offset: 5, line: 2 }],
        };
        let text = disassemble(&program, Some(&debug)).unwrap();
        assert!(text.contains(" f(int) -> int\n"));
        assert!(text.contains("0005   PUSH4       1 ; "));
        assert!(text.contains("    ; line 2\n"));
    }

    #[test]
    fn test_bad_code_is_reported() {
        let program = Program {
            externals: Vec::new(),
            code: vec![0xFF],
            entry: 0,
        };
        assert!(disassemble(&program, None).is_err());
    }
}
