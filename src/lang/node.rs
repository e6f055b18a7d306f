use std::rc::Rc;

use crate::frontend::token::Position;
use crate::lang::expr::Expr;
use crate::lang::symbol::{Symbol, SymbolTable};
use crate::lang::types::{ConstructId, DataType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Rc<str>,
    pub ty: DataType,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub symbol: Rc<Symbol>,
    /// Position in `Ast::functions`; also the symbol's location until link time.
    pub index: u32,
    pub params: Vec<Param>,
    pub body: Vec<NodeId>,
    pub scope: Option<ScopeId>,
    /// Frame bytes reserved for locals, known once the body is parsed.
    pub frame_size: u32,
    /// Bytes of arguments the caller pushes.
    pub arg_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalDecl {
    pub symbol: Rc<Symbol>,
    /// Name the loader binds against, `lib.name` when declared with `from lib`.
    pub link_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Module {
        items: Vec<NodeId>,
        scope: ScopeId,
    },
    Function(FunctionDecl),
    Class {
        construct: ConstructId,
    },
    Let {
        symbol: Rc<Symbol>,
        init: Option<Expr>,
    },
    /// `target = value;`, or `target;` to evaluate and discard.
    Assign {
        target: Expr,
        value: Option<Expr>,
    },
    Return {
        value: Option<Expr>,
    },
    If {
        cond: Expr,
        body: Vec<NodeId>,
    },
    For {
        var: Rc<Symbol>,
        from: Expr,
        to: Expr,
        body: Vec<NodeId>,
    },
    While {
        cond: Expr,
        body: Vec<NodeId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    /// Lexical parent; a lookup key, not ownership.
    pub parent: Option<NodeId>,
    pub pos: Position,
}

/// Arena holding one module's syntax tree and the symbol tables of its scoped nodes.
#[derive(Debug, Clone)]
pub struct Ast {
    nodes: Vec<Node>,
    scopes: Vec<SymbolTable>,
    pub functions: Vec<NodeId>,
    pub externals: Vec<ExternalDecl>,
    /// Bytes reserved for module-level `let`s.
    pub globals_size: u32,
}

impl Ast {
    /// Creates the arena with its root module node.
    pub fn new(pos: Position) -> Self {
        let mut ast = Ast {
            nodes: Vec::new(),
            scopes: Vec::new(),
            functions: Vec::new(),
            externals: Vec::new(),
            globals_size: 0,
        };
        let scope = ast.add_scope();
        ast.add(
            NodeKind::Module {
                items: Vec::new(),
                scope,
            },
            None,
            pos,
        );
        ast
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn root_scope(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn add(&mut self, kind: NodeKind, parent: Option<NodeId>, pos: Position) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { kind, parent, pos });
        id
    }

    pub fn add_scope(&mut self) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(SymbolTable::new());
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn scope(&self, id: ScopeId) -> &SymbolTable {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut SymbolTable {
        &mut self.scopes[id.0 as usize]
    }

    pub fn push_item(&mut self, item: NodeId) {
        let root = self.root();
        if let NodeKind::Module { items, .. } = &mut self.node_mut(root).kind {
            items.push(item);
        }
    }

    pub fn items(&self) -> &[NodeId] {
        match &self.node(self.root()).kind {
            NodeKind::Module { items, .. } => items,
            _ => &[],
        }
    }

    pub fn function(&self, index: u32) -> Option<&FunctionDecl> {
        let id = *self.functions.get(index as usize)?;
        match &self.node(id).kind {
            NodeKind::Function(decl) => Some(decl),
            _ => None,
        }
    }

    pub fn function_mut(&mut self, index: u32) -> Option<&mut FunctionDecl> {
        let id = *self.functions.get(index as usize)?;
        match &mut self.node_mut(id).kind {
            NodeKind::Function(decl) => Some(decl),
            _ => None,
        }
    }

    /// Scopes visible from `from`, innermost first, found by walking parent links.
    pub fn scope_chain(&self, from: NodeId) -> impl Iterator<Item = ScopeId> + '_ {
        let mut next = Some(from);
        std::iter::from_fn(move || {
            while let Some(id) = next {
                let node = self.node(id);
                next = node.parent;
                let scope = match &node.kind {
                    NodeKind::Module { scope, .. } => Some(*scope),
                    NodeKind::Function(decl) => decl.scope,
                    _ => None,
                };
                if scope.is_some() {
                    return scope;
                }
            }
            None
        })
    }

    /// The innermost scope visible from `from`.
    pub fn innermost_scope(&self, from: NodeId) -> ScopeId {
        self.scope_chain(from)
            .next()
            .unwrap_or_else(|| self.root_scope())
    }

    pub fn lookup(&self, from: NodeId, name: &str) -> Option<Rc<Symbol>> {
        self.scope_chain(from)
            .find_map(|scope| self.scope(scope).lookup(name).cloned())
    }

    pub fn lookup_construct(&self, from: NodeId, name: &str) -> Option<ConstructId> {
        self.scope_chain(from)
            .find_map(|scope| self.scope(scope).lookup_construct(name))
    }

    /// Every callable named `name` visible from `from`, inner scopes first.
    pub fn overloads(&self, from: NodeId, name: &str) -> Vec<Rc<Symbol>> {
        self.scope_chain(from)
            .flat_map(|scope| self.scope(scope).overloads(name).cloned().collect::<Vec<_>>())
            .collect()
    }
}
