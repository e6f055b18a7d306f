use std::cell::RefCell;
use std::rc::Rc;

use cinder::bytecode::compile_error::CompileError;
use cinder::driver::{self, DriverError, RunOutcome};
use cinder::runtime::prelude;
use cinder::runtime::runtime_error::{RuntimeError, VmError};
use cinder::{NativeRegistry, NativeSignature, ValueKind, Vm, VmConfig, VmState};

fn run_with(source: &str, natives: &NativeRegistry, config: VmConfig) -> Result<RunOutcome, DriverError> {
    let build = driver::compile_source("test.cn", source, "main")?;
    let compiled = &build.compiled;
    driver::run_program(&compiled.program, Some(&compiled.debug), natives, config)
}

fn run(source: &str) -> RunOutcome {
    match run_with(source, &NativeRegistry::new(), VmConfig::default()) {
        Ok(outcome) => outcome,
        Err(e) => panic!("run failed:\n{}", e),
    }
}

fn run_int(source: &str) -> i32 {
    let outcome = run(source);
    outcome
        .as_int()
        .unwrap_or_else(|| panic!("expected an int result, got {:?}", outcome))
}

fn runtime_error(source: &str, config: VmConfig) -> RuntimeError {
    match run_with(source, &NativeRegistry::new(), config) {
        Err(DriverError::Runtime(e)) => e,
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

fn rejected(source: &str) -> String {
    match driver::compile_source("test.cn", source, "main") {
        Err(DriverError::Rejected { rendered, .. }) => rendered,
        other => panic!("expected diagnostics, got {:?}", other.map(|b| b.warnings)),
    }
}

// ---- programs ----

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(run_int("func main() -> int { return 2 + 3 * 4; }"), 14);
}

#[test]
fn test_recursive_factorial_unwinds() {
    let source = "func fact(n: int) -> int {\n\
                    if n < 2 { return 1; }\n\
                    return n * fact(n - 1);\n\
                  }\n\
                  func main() -> int { return fact(5); }";
    let build = driver::compile_source("fact.cn", source, "main").unwrap();
    let program = &build.compiled.program;

    let mut vm = Vm::new(program, &NativeRegistry::new(), VmConfig::default());
    let result = vm.run().unwrap();
    assert_eq!(result, 120i32.to_le_bytes().to_vec());
    assert_eq!(vm.depth(), 0);
    assert_eq!(vm.state(), VmState::Halted);
}

#[test]
fn test_mixed_arithmetic_types() {
    let outcome = run("func main() -> float { let c = 'a'; return c * 1.5; }");
    assert_eq!(outcome.kind, Some(ValueKind::Float));
    assert_eq!(outcome.to_string(), "145.5");

    let outcome = run("func main() -> bool { return 'z' > 100; }");
    assert_eq!(outcome.to_string(), "true");
}

#[test]
fn test_loops() {
    assert_eq!(
        run_int("func main() -> int { let s = 0; let i = 1; while i <= 10 { s = s + i; i = i + 1; } return s; }"),
        55
    );
    // upper bound is exclusive
    assert_eq!(
        run_int("func main() -> int { let s = 0; for i = 0 to 4 { s = s + i; } return s; }"),
        6
    );
}

#[test]
fn test_arrays() {
    assert_eq!(
        run_int(
            "func main() -> int {\n\
               let a: array[4] int;\n\
               for i = 0 to 4 { a[i] = i * i; }\n\
               return a[3] + a[2];\n\
             }"
        ),
        13
    );
    assert_eq!(
        run_int("func main() -> int { let a = [5, 6, 7]; let i = 1; return a[i] * a[2]; }"),
        42
    );
}

#[test]
fn test_constant_index_stays_inside_the_array() {
    let rendered = rejected("func main() -> int { let a = [1, 2, 3]; let b = 7; a[3] = 99; return b; }");
    assert!(rendered.contains("index 3 out of range for array[3]"));
    let rendered = rejected("func main() -> int { let b = 7; let a = [1, 2, 3]; a[0 - 1] = 99; return b; }");
    assert!(rendered.contains("index -1 out of range for array[3]"));

    assert_eq!(
        run_int("func main() -> int { let a = [1, 2, 3]; let b = 7; a[2] = 99; return b + a[2]; }"),
        106
    );
}

#[test]
fn test_most_negative_int_literal() {
    assert_eq!(run_int("func main() -> int { return -2147483648; }"), i32::MIN);
    assert_eq!(run_int("func main() -> int { return -2147483648 + 1; }"), -2147483647);
}

#[test]
fn test_classes_and_references() {
    assert_eq!(
        run_int(
            "class P { x: int; y: int; }\n\
             func main() -> int { let p: P; p.x = 3; p.y = 4; return p.x * p.y; }"
        ),
        12
    );
    assert_eq!(
        run_int(
            "func bump(r: ref int) { r = r + 1; }\n\
             func main() -> int { let x = 1; bump(ref x); bump(ref x); return x; }"
        ),
        3
    );
}

#[test]
fn test_globals_are_initialized_before_entry() {
    assert_eq!(
        run_int(
            "let counter: int = 5;\n\
             func bump() { counter = counter + 1; }\n\
             func main() -> int { bump(); bump(); return counter; }"
        ),
        7
    );
}

// ---- resolution ----

#[test]
fn test_forward_references() {
    assert_eq!(
        run_int(
            "func main() -> int { return later(21); }\n\
             func later(x: int) -> int { return x * 2; }"
        ),
        42
    );
}

#[test]
fn test_block_scoping() {
    let rendered = rejected("func main() -> int { if true { let x = 1; } return x; }");
    assert!(rendered.contains("undefined symbol 'x'"), "{}", rendered);

    assert_eq!(
        run_int("func main() -> int { if true { let x = 1; } let x = 2; return x; }"),
        2
    );
}

#[test]
fn test_overload_selection() {
    assert_eq!(
        run_int(
            "func f(x: int) -> int { return 1; }\n\
             func f(x: float) -> int { return 2; }\n\
             func main() -> int { return f(1.5) * 10 + f(1); }"
        ),
        21
    );

    let rendered = rejected(
        "func f(x: int) -> int { return 1; }\n\
         func f(x: float) -> int { return 2; }\n\
         func main() -> int { return f('c'); }",
    );
    assert!(rendered.contains("ambiguous call"), "{}", rendered);
}

#[test]
fn test_narrowing_cast_warns_but_runs() {
    let build = driver::compile_source(
        "test.cn",
        "func main() -> int { let x: int = 1.5 as int; return x; }",
        "main",
    )
    .unwrap();
    assert!(build.warnings.contains("possible loss of data"), "{}", build.warnings);
    assert_eq!(run_int("func main() -> int { let x: int = 1.5 as int; return x; }"), 1);
}

#[test]
fn test_semantic_errors_block_codegen() {
    assert!(rejected("class A { b: B; }\nclass B { a: A; }\nfunc main() { }").contains("type loop detected"));
    assert!(rejected("func main() { let x: int = [1, 2, 3]; }").contains("type mismatch"));
    assert!(
        rejected("func main() { let n = 3; let a: array[n] int; }")
            .contains("array size must be a constant integer")
    );
}

#[test]
fn test_entry_must_exist() {
    let err = driver::compile_source("test.cn", "func start() { }", "main").unwrap_err();
    assert!(matches!(
        err,
        DriverError::Compile(CompileError::MissingEntry(ref name)) if name == "main"
    ));
}

// ---- runtime faults ----

#[test]
fn test_fault_reports_location_and_call_stack() {
    let source = "func div(a: int, b: int) -> int {\n\
                    return a / b;\n\
                  }\n\
                  func main() -> int { return div(1, 0); }";
    let err = runtime_error(source, VmConfig::default());
    assert_eq!(err.error, VmError::DivisionByZero);
    assert_eq!(err.location.as_deref(), Some("div at test.cn:2"));
    assert_eq!(err.call_stack, vec!["<start>", "main", "div"]);
}

#[test]
fn test_unbounded_recursion() {
    let source = "func down(n: int) -> int { return down(n + 1); }\n\
                  func main() -> int { return down(0); }";

    let small_stack = VmConfig {
        stack_size: 1024,
        max_call_depth: 100_000,
        ..VmConfig::default()
    };
    let err = runtime_error(source, small_stack);
    assert!(matches!(err.error, VmError::StackOverflow { capacity: 1024, .. }), "{}", err);

    let err = runtime_error(source, VmConfig::default());
    assert_eq!(err.error, VmError::CallDepthExceeded(1000));
}

#[test]
fn test_step_limit() {
    let config = VmConfig {
        max_steps: Some(1000),
        ..VmConfig::default()
    };
    let err = runtime_error("func main() { while true { } }", config);
    assert_eq!(err.error, VmError::StepLimitExceeded(1000));
}

#[test]
fn test_unbound_external_faults_when_called() {
    let err = runtime_error(
        "import func mystery();\n\
         func main() -> int { mystery(); return 0; }",
        VmConfig::default(),
    );
    assert_eq!(err.error, VmError::UnresolvedExternal("mystery".to_string()));
}

// ---- natives ----

#[test]
fn test_prelude_output() {
    let out = Rc::new(RefCell::new(Vec::new()));
    let mut natives = NativeRegistry::new();
    prelude::register(&mut natives, out.clone());

    let source = "import func print_int(v: int);\n\
                  import func print_str(s: ref char);\n\
                  import func print_bool(b: bool);\n\
                  import func newline();\n\
                  func main() {\n\
                    print_int(6 * 7); newline();\n\
                    print_str(\"hi\"); newline();\n\
                    print_bool(1 < 2);\n\
                  }";
    let outcome = run_with(source, &natives, VmConfig::default()).unwrap();
    assert!(outcome.bytes.is_empty());
    assert_eq!(String::from_utf8_lossy(&out.borrow()), "42\nhi\ntrue");
}

#[test]
fn test_library_native() {
    let mut natives = NativeRegistry::new();
    natives.register(
        "math.square",
        NativeSignature::new(vec![ValueKind::Int], Some(ValueKind::Int)),
        |call| {
            let v = call.int(0)?;
            call.return_int(v * v)
        },
    );
    let outcome = run_with(
        "from math import func square(x: int) -> int;\n\
         func main() -> int { return square(9) + 1; }",
        &natives,
        VmConfig::default(),
    )
    .unwrap();
    assert_eq!(outcome.as_int(), Some(82));
}

// ---- artifacts ----

#[test]
fn test_artifact_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("calc.cn");
    std::fs::write(&source_path, "func main() -> int { return 2 + 3 * 4; }").unwrap();

    let build = driver::compile_file(&source_path, "main").unwrap();
    let out = dir.path().join("calc.bin");
    driver::write_artifact(&build.compiled, &out).unwrap();
    assert!(driver::debug_path(&out).exists());

    let (program, debug) = driver::read_artifact(&out).unwrap();
    assert_eq!(program, build.compiled.program);
    assert_eq!(debug.as_ref(), Some(&build.compiled.debug));

    let outcome =
        driver::run_program(&program, debug.as_ref(), &NativeRegistry::new(), VmConfig::default()).unwrap();
    assert_eq!(outcome.to_string(), "14");
}

#[test]
fn test_artifact_without_debug_info() {
    let dir = tempfile::tempdir().unwrap();
    let build = driver::compile_source("t.cn", "func main() -> int { return 3; }", "main").unwrap();
    let out = dir.path().join("t.bin");
    driver::write_artifact(&build.compiled, &out).unwrap();
    std::fs::remove_file(driver::debug_path(&out)).unwrap();

    let (program, debug) = driver::read_artifact(&out).unwrap();
    assert!(debug.is_none());
    let outcome =
        driver::run_program(&program, None, &NativeRegistry::new(), VmConfig::default()).unwrap();
    assert_eq!(outcome.bytes, 3i32.to_le_bytes().to_vec());
    assert_eq!(outcome.kind, None);
}

#[test]
fn test_truncated_artifact_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("bad.bin");
    std::fs::write(&out, [1, 0]).unwrap();
    assert!(matches!(driver::read_artifact(&out), Err(DriverError::Format(_))));
}

#[test]
fn test_missing_source_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = driver::compile_file(&dir.path().join("nope.cn"), "main").unwrap_err();
    assert!(matches!(err, DriverError::Read { .. }));
}

#[test]
fn test_disassembly_names_functions() {
    let build = driver::compile_source(
        "t.cn",
        "func twice(x: int) -> int { return x * 2; }\nfunc main() -> int { return twice(4); }",
        "main",
    )
    .unwrap();
    let text = cinder::bytecode::disasm::disassemble(&build.compiled.program, Some(&build.compiled.debug))
        .unwrap();
    assert!(text.contains(" twice(int) -> int\n"));
    assert!(text.contains(" <start> calls main() -> int\n"));
    assert!(text.contains("MUL.INT.INT"));
    assert!(text.contains("; twice"));
}
