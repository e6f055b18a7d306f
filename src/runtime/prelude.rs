//! Natives every program can import without a library prefix.
//!
//! ```text
//! import func print_int(v: int);
//! import func print_float(v: float);
//! import func print_char(c: char);
//! import func print_bool(b: bool);
//! import func print_str(s: ref char);
//! import func newline();
//! ```

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::runtime::native::{NativeCall, NativeRegistry, NativeSignature, ValueKind};
use crate::runtime::runtime_error::VmError;

/// Registers the prelude, writing to `out`.
pub fn register<W: Write + 'static>(natives: &mut NativeRegistry, out: Rc<RefCell<W>>) {
    let sink = out.clone();
    natives.register(
        "print_int",
        NativeSignature::new(vec![ValueKind::Int], None),
        move |call| {
            let v = call.int(0)?;
            emit(call, &sink, v.to_string().as_bytes())
        },
    );

    let sink = out.clone();
    natives.register(
        "print_float",
        NativeSignature::new(vec![ValueKind::Float], None),
        move |call| {
            let v = call.float(0)?;
            emit(call, &sink, v.to_string().as_bytes())
        },
    );

    let sink = out.clone();
    natives.register(
        "print_char",
        NativeSignature::new(vec![ValueKind::Char], None),
        move |call| {
            let c = call.char(0)?;
            emit(call, &sink, &[c])
        },
    );

    let sink = out.clone();
    natives.register(
        "print_bool",
        NativeSignature::new(vec![ValueKind::Bool], None),
        move |call| {
            let text = if call.bool(0)? { "true" } else { "false" };
            emit(call, &sink, text.as_bytes())
        },
    );

    let sink = out.clone();
    natives.register(
        "print_str",
        NativeSignature::new(vec![ValueKind::Address], None),
        move |call| {
            let text = call.c_string(call.address(0)?)?;
            emit(call, &sink, &text)
        },
    );

    natives.register("newline", NativeSignature::new(Vec::new(), None), move |call| {
        emit(call, &out, b"\n")
    });
}

/// A registry holding the prelude, writing to standard output.
pub fn stdout_registry() -> NativeRegistry {
    let mut natives = NativeRegistry::new();
    register(&mut natives, Rc::new(RefCell::new(std::io::stdout())));
    natives
}

fn emit<W: Write>(call: &NativeCall<'_>, sink: &RefCell<W>, bytes: &[u8]) -> Result<(), VmError> {
    let mut out = sink.borrow_mut();
    out.write_all(bytes)
        .and_then(|_| out.flush())
        .map_err(|err| call.fail(err))
}
