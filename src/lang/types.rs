use std::fmt;
use std::rc::Rc;

/// Size of a reference (an absolute stack address) in bytes.
pub const REFERENCE_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Primitive {
    Int,
    Float,
    Char,
    Bool,
}

impl Primitive {
    pub const ALL: [Primitive; 4] = [
        Primitive::Int,
        Primitive::Float,
        Primitive::Char,
        Primitive::Bool,
    ];

    /// Kinds that take part in arithmetic and comparison.
    pub const NUMERIC: [Primitive; 3] = [Primitive::Int, Primitive::Float, Primitive::Char];

    pub fn size(self) -> u32 {
        match self {
            Primitive::Int | Primitive::Float => 4,
            Primitive::Char | Primitive::Bool => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Int => "int",
            Primitive::Float => "float",
            Primitive::Char => "char",
            Primitive::Bool => "bool",
        }
    }

    /// Conversion rank; converting to a lower rank may lose data.
    pub fn rank(self) -> u8 {
        match self {
            Primitive::Bool => 0,
            Primitive::Char => 1,
            Primitive::Int => 2,
            Primitive::Float => 3,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    fn construct_id(self) -> ConstructId {
        ConstructId(self as u32)
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index of a construct in the [`TypeTable`]. Ids `0..4` are the primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstructId(pub u32);

/// A type at a use site: a construct plus reference/array modifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Absent value (`null`), the type of functions that return nothing.
    Null,
    /// Not yet known; replaced by the initializer's type.
    Auto,
    Named(ConstructId),
    Reference(Box<DataType>),
    Array { element: Box<DataType>, count: u32 },
}

impl DataType {
    pub fn int() -> Self {
        DataType::Named(Primitive::Int.construct_id())
    }

    pub fn float() -> Self {
        DataType::Named(Primitive::Float.construct_id())
    }

    pub fn char() -> Self {
        DataType::Named(Primitive::Char.construct_id())
    }

    pub fn bool() -> Self {
        DataType::Named(Primitive::Bool.construct_id())
    }

    pub fn primitive_type(p: Primitive) -> Self {
        DataType::Named(p.construct_id())
    }

    pub fn reference(inner: DataType) -> Self {
        DataType::Reference(Box::new(inner))
    }

    pub fn array(element: DataType, count: u32) -> Self {
        DataType::Array {
            element: Box::new(element),
            count,
        }
    }

    /// The primitive kind, if this is a bare primitive.
    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            DataType::Named(ConstructId(id)) => Primitive::ALL.get(*id as usize).copied(),
            _ => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, DataType::Reference(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DataType::Null)
    }

    /// The type a value of this type produces when read: references yield their referent.
    pub fn value_type(&self) -> &DataType {
        match self {
            DataType::Reference(inner) => inner,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: Rc<str>,
    pub ty: DataType,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstructKind {
    Primitive(Primitive),
    /// A user class. `size` is `None` until its layout is computed.
    User {
        attributes: Vec<Attribute>,
        size: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Construct {
    pub name: Rc<str>,
    pub kind: ConstructKind,
}

impl Construct {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        match &self.kind {
            ConstructKind::User { attributes, .. } => {
                attributes.iter().find(|a| &*a.name == name)
            }
            ConstructKind::Primitive(_) => None,
        }
    }
}

/// Owns every construct created during one compile.
#[derive(Debug, Clone)]
pub struct TypeTable {
    constructs: Vec<Construct>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    pub fn new() -> Self {
        let constructs = Primitive::ALL
            .iter()
            .map(|p| Construct {
                name: Rc::from(p.name()),
                kind: ConstructKind::Primitive(*p),
            })
            .collect();
        TypeTable { constructs }
    }

    pub fn primitives(&self) -> impl Iterator<Item = (ConstructId, &Construct)> {
        self.constructs
            .iter()
            .take(Primitive::ALL.len())
            .enumerate()
            .map(|(i, c)| (ConstructId(i as u32), c))
    }

    /// Creates an unsized user construct.
    pub fn declare_class(&mut self, name: Rc<str>) -> ConstructId {
        let id = ConstructId(self.constructs.len() as u32);
        self.constructs.push(Construct {
            name,
            kind: ConstructKind::User {
                attributes: Vec::new(),
                size: None,
            },
        });
        id
    }

    /// Finishes a user construct; attribute offsets are assigned in declaration order.
    pub fn define_class(&mut self, id: ConstructId, fields: Vec<(Rc<str>, DataType)>) -> u32 {
        let mut offset = 0;
        let mut attributes = Vec::with_capacity(fields.len());
        for (name, ty) in fields {
            let size = self.size_of(&ty);
            attributes.push(Attribute { name, ty, offset });
            offset += size;
        }
        if let Some(construct) = self.constructs.get_mut(id.0 as usize) {
            construct.kind = ConstructKind::User {
                attributes,
                size: Some(offset),
            };
        }
        offset
    }

    pub fn get(&self, id: ConstructId) -> &Construct {
        &self.constructs[id.0 as usize]
    }

    /// True if the type's storage size is known.
    pub fn is_sized(&self, ty: &DataType) -> bool {
        match ty {
            DataType::Named(id) => match &self.get(*id).kind {
                ConstructKind::Primitive(_) => true,
                ConstructKind::User { size, .. } => size.is_some(),
            },
            DataType::Array { element, .. } => self.is_sized(element),
            DataType::Null | DataType::Reference(_) => true,
            DataType::Auto => false,
        }
    }

    /// Storage size in bytes. Unsized classes count as zero.
    pub fn size_of(&self, ty: &DataType) -> u32 {
        match ty {
            DataType::Null | DataType::Auto => 0,
            DataType::Reference(_) => REFERENCE_SIZE,
            DataType::Array { element, count } => self.size_of(element) * count,
            DataType::Named(id) => match &self.get(*id).kind {
                ConstructKind::Primitive(p) => p.size(),
                ConstructKind::User { size, .. } => size.unwrap_or(0),
            },
        }
    }

    /// Size of the bytes a value of this type occupies on the evaluation stack.
    pub fn value_size(&self, ty: &DataType) -> u32 {
        self.size_of(ty.value_type())
    }

    pub fn display(&self, ty: &DataType) -> String {
        match ty {
            DataType::Null => "null".to_string(),
            DataType::Auto => "auto".to_string(),
            DataType::Named(id) => self.get(*id).name.to_string(),
            DataType::Reference(inner) => format!("ref {}", self.display(inner)),
            DataType::Array { element, count } => {
                format!("array[{}] {}", count, self.display(element))
            }
        }
    }
}
