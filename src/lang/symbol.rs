use std::rc::Rc;

use crate::lang::types::{ConstructId, DataType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Frame-relative, positive offset.
    Local,
    /// Frame-relative, negative offset.
    Argument,
    /// Absolute address in the globals region.
    Global,
    /// Location is the function index until link time.
    Function,
    /// Location is the link-table index.
    External,
}

/// A named, typed, located entity.
///
/// For functions and externals `ty` is the return type and `params` the
/// parameter types in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: Rc<str>,
    pub ty: DataType,
    pub kind: SymbolKind,
    pub location: i32,
    pub params: Vec<DataType>,
}

impl Symbol {
    pub fn variable(name: Rc<str>, ty: DataType, kind: SymbolKind, location: i32) -> Self {
        Symbol {
            name,
            ty,
            kind,
            location,
            params: Vec::new(),
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.kind, SymbolKind::Function | SymbolKind::External)
    }

    pub fn is_storage(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::Local | SymbolKind::Argument | SymbolKind::Global
        )
    }
}

/// Position in a table that leaving a scope truncates back to.
#[derive(Debug, Clone, Copy)]
struct ScopeMarker {
    symbols: usize,
    constructs: usize,
}

/// Ordered, append-only symbol storage with nested scope markers.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: Vec<Rc<Symbol>>,
    constructs: Vec<(Rc<str>, ConstructId)>,
    markers: Vec<ScopeMarker>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_scope(&mut self) {
        self.markers.push(ScopeMarker {
            symbols: self.symbols.len(),
            constructs: self.constructs.len(),
        });
    }

    pub fn leave_scope(&mut self) {
        if let Some(marker) = self.markers.pop() {
            self.symbols.truncate(marker.symbols);
            self.constructs.truncate(marker.constructs);
        }
    }

    pub fn depth(&self) -> usize {
        self.markers.len()
    }

    pub fn insert(&mut self, symbol: Symbol) -> Rc<Symbol> {
        let symbol = Rc::new(symbol);
        self.symbols.push(symbol.clone());
        symbol
    }

    pub fn insert_construct(&mut self, name: Rc<str>, id: ConstructId) {
        self.constructs.push((name, id));
    }

    fn innermost_start(&self) -> usize {
        self.markers.last().map(|m| m.symbols).unwrap_or(0)
    }

    /// Finds a symbol declared in the innermost scope only.
    pub fn lookup_innermost(&self, name: &str) -> Option<&Rc<Symbol>> {
        self.symbols[self.innermost_start()..]
            .iter()
            .rev()
            .find(|s| &*s.name == name)
    }

    /// Finds the most recently declared visible symbol with this name.
    pub fn lookup(&self, name: &str) -> Option<&Rc<Symbol>> {
        self.symbols.iter().rev().find(|s| &*s.name == name)
    }

    /// Every visible callable with this name, in declaration order.
    pub fn overloads<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Rc<Symbol>> + 'a {
        self.symbols
            .iter()
            .filter(move |s| s.is_callable() && &*s.name == name)
    }

    pub fn lookup_construct(&self, name: &str) -> Option<ConstructId> {
        self.constructs
            .iter()
            .rev()
            .find(|(n, _)| &**n == name)
            .map(|(_, id)| *id)
    }

    pub fn symbols(&self) -> &[Rc<Symbol>] {
        &self.symbols
    }
}

/// Bytes between a function's arguments and its frame base: the return address
/// pushed by `Call` and the base pointer saved by `CreateFrame`.
pub const FRAME_LINK_SIZE: u32 = 8;

/// Address of the first global. The start routine's frame base sits just above the
/// base pointer it saved at address 0.
pub const GLOBAL_BASE: u32 = 4;

/// Offset of a parameter from the frame base, given the bytes of arguments pushed
/// before it and the total argument size.
pub fn argument_offset(arg_size: u32, prefix: u32) -> i32 {
    prefix as i32 - arg_size as i32 - FRAME_LINK_SIZE as i32
}

/// Per-function bump allocator for frame slots.
#[derive(Debug, Default, Clone)]
pub struct FrameAllocator {
    next: u32,
    high_water: u32,
    saved: Vec<u32>,
}

impl FrameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts allocation above an existing frame (used for generator temporaries).
    pub fn starting_at(offset: u32) -> Self {
        FrameAllocator {
            next: offset,
            high_water: offset,
            saved: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn allocate(&mut self, size: u32) -> u32 {
        let offset = self.next;
        self.next += size;
        self.high_water = self.high_water.max(self.next);
        offset
    }

    pub fn enter_block(&mut self) {
        self.saved.push(self.next);
    }

    /// Releases everything allocated since the matching `enter_block`.
    pub fn leave_block(&mut self) {
        if let Some(next) = self.saved.pop() {
            self.next = next;
        }
    }

    pub fn frame_size(&self) -> u32 {
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str, location: i32) -> Symbol {
        Symbol::variable(Rc::from(name), DataType::int(), SymbolKind::Local, location)
    }

    fn function(name: &str, params: Vec<DataType>) -> Symbol {
        Symbol {
            name: Rc::from(name),
            ty: DataType::int(),
            kind: SymbolKind::Function,
            location: 0,
            params,
        }
    }

    #[test]
    fn test_leave_scope_truncates() {
        let mut table = SymbolTable::new();
        table.insert(local("a", 0));
        table.enter_scope();
        table.insert(local("b", 4));
        assert!(table.lookup("b").is_some());
        table.leave_scope();
        assert!(table.lookup("b").is_none());
        assert!(table.lookup("a").is_some());
    }

    #[test]
    fn test_shadowing_finds_newest() {
        let mut table = SymbolTable::new();
        table.insert(local("a", 0));
        table.enter_scope();
        table.insert(local("a", 8));
        assert_eq!(table.lookup("a").map(|s| s.location), Some(8));
        assert!(table.lookup_innermost("a").is_some());
        table.leave_scope();
        assert_eq!(table.lookup("a").map(|s| s.location), Some(0));
    }

    #[test]
    fn test_lookup_innermost_ignores_outer() {
        let mut table = SymbolTable::new();
        table.insert(local("a", 0));
        table.enter_scope();
        assert!(table.lookup_innermost("a").is_none());
    }

    #[test]
    fn test_overloads_in_order() {
        let mut table = SymbolTable::new();
        table.insert(function("f", vec![DataType::int()]));
        table.insert(local("f_not", 0));
        table.insert(function("f", vec![DataType::float()]));
        let params: Vec<_> = table.overloads("f").map(|s| s.params.clone()).collect();
        assert_eq!(params, vec![vec![DataType::int()], vec![DataType::float()]]);
    }

    #[test]
    fn test_constructs_are_scoped() {
        let mut table = SymbolTable::new();
        table.enter_scope();
        table.insert_construct(Rc::from("Point"), ConstructId(7));
        assert_eq!(table.lookup_construct("Point"), Some(ConstructId(7)));
        table.leave_scope();
        assert_eq!(table.lookup_construct("Point"), None);
    }

    #[test]
    fn test_frame_allocator_reuses_block_slots() {
        let mut frame = FrameAllocator::new();
        assert_eq!(frame.allocate(4), 0);
        frame.enter_block();
        assert_eq!(frame.allocate(8), 4);
        frame.leave_block();
        assert_eq!(frame.allocate(1), 4);
        assert_eq!(frame.frame_size(), 12);

        frame.reset();
        assert_eq!(frame.frame_size(), 0);
        assert_eq!(frame.allocate(2), 0);
    }

    #[test]
    fn test_argument_offsets_sit_below_link() {
        // f(a: int, b: char): a at -13, b at -9, link bytes at -8..0
        assert_eq!(argument_offset(5, 0), -13);
        assert_eq!(argument_offset(5, 4), -9);
        assert_eq!(argument_offset(0, 0), -8);
    }

    #[test]
    fn test_frame_allocator_starting_at() {
        let mut frame = FrameAllocator::starting_at(16);
        assert_eq!(frame.allocate(4), 16);
        assert_eq!(frame.frame_size(), 20);
    }
}
