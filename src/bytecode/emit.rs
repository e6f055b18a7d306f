use crate::bytecode::op::Instr;

/// A jump destination. Created first, referenced any number of times, placed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

impl Label {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// An entry of the link table: the index code calls through and the name the loader
/// binds to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub index: u32,
    pub name: String,
}

/// Maps a code offset to the source line that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct LabelSlot {
    pub(crate) name: String,
    pub(crate) offset: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct FunctionSlot {
    pub(crate) name: String,
    pub(crate) start: Option<u32>,
}

/// Append-only code plus everything that still has to be patched by the linker.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    pub(crate) code: Vec<u8>,
    pub(crate) labels: Vec<LabelSlot>,
    /// (operand offset, label) pairs awaiting the label's address.
    pub(crate) label_refs: Vec<(usize, Label)>,
    pub(crate) functions: Vec<FunctionSlot>,
    /// (operand offset, function index) pairs awaiting the function's start.
    pub(crate) call_refs: Vec<(usize, u32)>,
    pub(crate) externals: Vec<LinkEntry>,
    lines: Vec<LineEntry>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset the next instruction will be written at.
    pub fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn emit(&mut self, instr: Instr<'_>) {
        instr.encode(&mut self.code);
    }

    pub fn create_label(&mut self, name: impl Into<String>) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelSlot {
            name: name.into(),
            offset: None,
        });
        label
    }

    /// Binds `label` to the current offset.
    pub fn place_label(&mut self, label: Label) {
        let offset = self.offset();
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            slot.offset = Some(offset);
        }
    }

    /// `Jump` to a label; the target is filled in at link time.
    pub fn emit_jump(&mut self, label: Label) {
        self.emit(Instr::Jump(0));
        self.refer_label(label);
    }

    pub fn emit_jump_if_false(&mut self, label: Label) {
        self.emit(Instr::JumpIfFalse(0));
        self.refer_label(label);
    }

    fn refer_label(&mut self, label: Label) {
        let at = self.code.len() - 4;
        self.label_refs.push((at, label));
    }

    /// Makes function `index` known under `name` so calls to it can be linked.
    pub fn declare_function(&mut self, index: u32, name: impl Into<String>) {
        let index = index as usize;
        if self.functions.len() <= index {
            self.functions.resize(
                index + 1,
                FunctionSlot {
                    name: String::new(),
                    start: None,
                },
            );
        }
        self.functions[index].name = name.into();
    }

    /// Records that function `index` starts at the current offset.
    pub fn begin_function(&mut self, index: u32) {
        let offset = self.offset();
        if let Some(slot) = self.functions.get_mut(index as usize) {
            slot.start = Some(offset);
        }
    }

    /// `Call` to a function whose start is only known at link time.
    pub fn emit_call(&mut self, function: u32) {
        self.emit(Instr::Call(0));
        let at = self.code.len() - 4;
        self.call_refs.push((at, function));
    }

    pub fn add_external(&mut self, index: u32, name: impl Into<String>) {
        self.externals.push(LinkEntry {
            index,
            name: name.into(),
        });
    }

    /// Emits `CreateFrame` with a zero size and returns the operand offset to patch.
    pub fn emit_create_frame(&mut self) -> usize {
        self.emit(Instr::CreateFrame(0));
        self.code.len() - 4
    }

    pub fn patch_u32(&mut self, at: usize, value: u32) {
        if let Some(slot) = self.code.get_mut(at..at + 4) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Attributes code emitted from here on to `line`.
    pub fn mark_line(&mut self, line: u32) {
        let offset = self.offset();
        match self.lines.last_mut() {
            Some(last) if last.offset == offset => last.line = line,
            Some(last) if last.line == line => {}
            _ => self.lines.push(LineEntry { offset, line }),
        }
    }

    pub fn lines(&self) -> &[LineEntry] {
        &self.lines
    }
}
