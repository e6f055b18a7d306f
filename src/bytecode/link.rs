use thiserror::Error;

use crate::bytecode::emit::CodeBuffer;
use crate::bytecode::format::Program;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("unresolved label '{0}'")]
    UnresolvedLabel(String),
    #[error("unresolved call to '{0}'")]
    UnresolvedCall(String),
}

/// Patches every label and call placeholder and produces the final program.
///
/// `entry` is the code offset execution starts at.
pub fn link(buffer: CodeBuffer, entry: u32) -> Result<Program, LinkError> {
    let CodeBuffer {
        mut code,
        labels,
        label_refs,
        functions,
        call_refs,
        externals,
        ..
    } = buffer;

    let mut patch = |at: usize, value: u32| {
        if let Some(slot) = code.get_mut(at..at + 4) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    };

    for (at, label) in label_refs {
        let slot = labels.get(label.index());
        let Some(offset) = slot.and_then(|l| l.offset) else {
            let name = match slot {
                Some(l) => l.name.clone(),
                None => format!("#{}", label.index()),
            };
            return Err(LinkError::UnresolvedLabel(name));
        };
        patch(at, offset);
    }

    for (at, index) in call_refs {
        let slot = functions.get(index as usize);
        let Some(start) = slot.and_then(|f| f.start) else {
            let name = match slot {
                Some(f) if !f.name.is_empty() => f.name.clone(),
                _ => format!("#{}", index),
            };
            return Err(LinkError::UnresolvedCall(name));
        };
        patch(at, start);
    }

    tracing::debug!(
        code = code.len(),
        externals = externals.len(),
        entry,
        "linked"
    );
    Ok(Program {
        externals,
        code,
        entry,
    })
}
