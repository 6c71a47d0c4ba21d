//! Global variable definitions.

use crate::module::SymbolId;

/// Stable handle for a global variable: its index in `Module::globals`.
///
/// Globals are only ever appended to a module, so a `GlobalId` computed by
/// an analysis stays valid while later passes add new globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

impl GlobalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Symbol linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    External,
    Internal,
    Private,
    Weak,
    WeakOdr,
    LinkOnce,
    LinkOnceOdr,
    Common,
    ExternWeak,
    AvailableExternally,
}

impl Linkage {
    /// Not visible outside the object file.
    pub fn is_local(self) -> bool {
        matches!(self, Linkage::Internal | Linkage::Private)
    }

    /// The definition in this module is the one the program will use.
    pub fn has_exact_definition(self) -> bool {
        !matches!(
            self,
            Linkage::AvailableExternally | Linkage::ExternWeak | Linkage::Common | Linkage::LinkOnce
        )
    }
}

/// Symbol visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Visibility {
    #[default]
    Default,
    Hidden,
    Protected,
}

/// One field of a structured initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstField {
    /// Little-endian integer of `bytes` bytes.
    Int { value: i64, bytes: u8 },
    /// Pointer-sized address of a symbol.
    Addr(SymbolId),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// `n` zero bytes.
    Zero(u64),
}

impl ConstField {
    pub fn size(&self) -> u64 {
        match self {
            ConstField::Int { bytes, .. } => *bytes as u64,
            ConstField::Addr(_) => 8,
            ConstField::Bytes(b) => b.len() as u64,
            ConstField::Zero(n) => *n,
        }
    }
}

/// Initial contents of a defined global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initializer {
    /// All zero.
    Zero,
    /// Raw bytes; the remainder of the global is zero.
    Bytes(Vec<u8>),
    /// Concatenated fields; the remainder of the global is zero.
    Fields(Vec<ConstField>),
}

impl Initializer {
    /// Bytes covered explicitly by the initializer.
    pub fn len(&self) -> u64 {
        match self {
            Initializer::Zero => 0,
            Initializer::Bytes(b) => b.len() as u64,
            Initializer::Fields(fields) => fields.iter().map(ConstField::size).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A global variable. A global without initializer is a declaration.
#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: SymbolId,
    /// Allocated size in bytes, including any trailing padding.
    pub size: u64,
    /// Trailing bytes that are not part of the source-level object.
    pub padding: u64,
    pub align: u32,
    pub linkage: Linkage,
    pub visibility: Visibility,
    pub constant: bool,
    pub thread_local: bool,
    /// The symbol value is pinned (e.g. referenced from an absolute
    /// expression), so size and placement must not change.
    pub fixed_address: bool,
    pub section: Option<String>,
    /// The linker may only discard this global together with `associated`.
    pub associated: Option<SymbolId>,
    pub init: Option<Initializer>,
}

impl GlobalVar {
    /// A zero-initialized, externally visible definition.
    pub fn new(name: SymbolId, size: u64, align: u32) -> Self {
        Self {
            name,
            size,
            padding: 0,
            align,
            linkage: Linkage::External,
            visibility: Visibility::Default,
            constant: false,
            thread_local: false,
            fixed_address: false,
            section: None,
            associated: None,
            init: Some(Initializer::Zero),
        }
    }

    /// A declaration of a global defined elsewhere.
    pub fn declaration(name: SymbolId, size: u64, align: u32) -> Self {
        Self {
            init: None,
            ..Self::new(name, size, align)
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.init.is_none()
    }

    /// Size of the source-level object, excluding trailing padding.
    pub fn object_size(&self) -> u64 {
        self.size - self.padding
    }
}
