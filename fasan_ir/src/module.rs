//! Module-level IR container with interned symbol table.
//!
//! `Module` is the top-level IR structure that owns all functions, global
//! variables, metadata, the static constructor/destructor lists, and a
//! shared symbol table.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::function::Function;
use crate::global::{GlobalId, GlobalVar};
use crate::metadata::{MdNode, MetadataRef};

/// Interned symbol identifier. Indexes into a module-level symbol table.
///
/// Used for function names, global names, and external references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

/// Interned symbol table mapping names to `SymbolId`s.
///
/// Avoids repeated String allocation and enables O(1) equality comparison.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    names: Vec<String>,
    lookup: HashMap<String, SymbolId>,
}

impl SymbolTable {
    /// Create an empty symbol table.
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Intern a symbol name, returning its `SymbolId`.
    ///
    /// If the name already exists, returns the existing id.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.lookup.get(name) {
            return id;
        }
        let id = SymbolId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), id);
        id
    }

    /// Look up a name without interning it.
    pub fn get(&self, name: &str) -> Option<SymbolId> {
        self.lookup.get(name).copied()
    }

    /// Resolve a `SymbolId` back to its name.
    pub fn resolve(&self, id: SymbolId) -> &str {
        &self.names[id.0 as usize]
    }

    /// Whether `id` was handed out by this table.
    pub fn contains(&self, id: SymbolId) -> bool {
        (id.0 as usize) < self.names.len()
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of a function in `Module::functions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An entry of the static constructor or destructor list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtorEntry {
    /// Lower priorities run first.
    pub priority: u32,
    pub function: SymbolId,
}

/// Priority used by frontends for ordinary static initializers.
pub const DEFAULT_CTOR_PRIORITY: u32 = 65535;

/// Top-level IR container.
pub struct Module {
    pub name: String,
    pub symbols: SymbolTable,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVar>,
    /// Metadata node arena.
    pub metadata: Vec<MdNode>,
    /// Named lists of metadata nodes.
    pub named_metadata: BTreeMap<String, Vec<MetadataRef>>,
    pub global_ctors: Vec<CtorEntry>,
    pub global_dtors: Vec<CtorEntry>,
    /// Symbols the linker must keep even when unreferenced.
    pub used: Vec<SymbolId>,
}

impl Module {
    /// Create a new empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: SymbolTable::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            metadata: Vec::new(),
            named_metadata: BTreeMap::new(),
            global_ctors: Vec::new(),
            global_dtors: Vec::new(),
            used: Vec::new(),
        }
    }

    /// Intern a symbol name in this module's symbol table.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    /// Resolve a symbol id to its name.
    pub fn resolve(&self, id: SymbolId) -> &str {
        self.symbols.resolve(id)
    }

    /// Add a function to the module.
    pub fn add_function(&mut self, func: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    /// Add a global variable to the module.
    pub fn add_global(&mut self, global: GlobalVar) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVar {
        &self.globals[id.index()]
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVar {
        &mut self.globals[id.index()]
    }

    pub fn global_ids(&self) -> impl Iterator<Item = GlobalId> {
        (0..self.globals.len() as u32).map(GlobalId)
    }

    /// Find the global named by `sym`.
    pub fn global_by_symbol(&self, sym: SymbolId) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == sym)
            .map(|i| GlobalId(i as u32))
    }

    /// Find the function named by `sym`.
    pub fn function_by_symbol(&self, sym: SymbolId) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == sym)
            .map(|i| FuncId(i as u32))
    }

    /// Find a function by name.
    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.symbols
            .get(name)
            .and_then(|sym| self.function_by_symbol(sym))
    }

    /// Find a global by name.
    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.symbols
            .get(name)
            .and_then(|sym| self.global_by_symbol(sym))
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    /// Add a metadata node to the arena.
    pub fn add_metadata(&mut self, node: MdNode) -> MetadataRef {
        let r = MetadataRef(self.metadata.len() as u32);
        self.metadata.push(node);
        r
    }

    pub fn metadata_node(&self, r: MetadataRef) -> Option<&MdNode> {
        self.metadata.get(r.index() as usize)
    }

    /// Append a node to a named metadata list, creating the list if needed.
    pub fn add_named_metadata(&mut self, name: &str, node: MetadataRef) {
        self.named_metadata
            .entry(name.to_string())
            .or_default()
            .push(node);
    }

    pub fn named_metadata(&self, name: &str) -> &[MetadataRef] {
        self.named_metadata
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Declare an external function unless a function with this name exists.
    pub fn declare_function(
        &mut self,
        name: &str,
        params: Vec<crate::types::Type>,
        ret_ty: Option<crate::types::Type>,
    ) -> SymbolId {
        let sym = self.intern(name);
        if self.function_by_symbol(sym).is_none() {
            self.functions.push(Function::new(sym, params, ret_ty));
        }
        sym
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("symbols", &self.symbols)
            .field(
                "functions",
                &format!("[{} functions]", self.functions.len()),
            )
            .field("globals", &format!("[{} globals]", self.globals.len()))
            .field("metadata", &format!("[{} nodes]", self.metadata.len()))
            .finish()
    }
}
