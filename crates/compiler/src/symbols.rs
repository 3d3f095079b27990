//! Interned names, scopes, and symbol tables.
//!
//! Identifiers are interned once and referred to by handle everywhere;
//! two equal names are the same handle. Scopes form a parent chain rooted
//! at the global scope (index 0) and stay alive for the whole compilation
//! so code generation can revisit them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::Initializer;
use crate::types::{StructRef, Type};

/// Handle into the [`NameTable`]. Comparison is handle equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u32);

#[derive(Debug, Default)]
pub struct NameTable {
    strings: Vec<String>,
    index: HashMap<String, Name>,
}

impl NameTable {
    pub fn new() -> NameTable {
        NameTable::default()
    }

    pub fn intern(&mut self, text: &str) -> Name {
        if let Some(&name) = self.index.get(text) {
            return name;
        }
        let name = Name(self.strings.len() as u32);
        self.strings.push(text.to_string());
        self.index.insert(text.to_string(), name);
        name
    }

    pub fn get(&self, name: Name) -> &str {
        &self.strings[name.0 as usize]
    }
}

/// Storage-class specifiers. Kept strictly separate from the VReg flag
/// space in `ir`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Storage {
    pub is_extern: bool,
    pub is_static: bool,
    pub is_typedef: bool,
}

#[derive(Debug)]
pub enum VarPlace {
    Global {
        init: Option<Initializer>,
        /// A function body has been seen for this symbol.
        func_defined: bool,
    },
    Local {
        /// `static` locals shadow a hidden global carrying the data.
        static_gvar: Option<Name>,
    },
}

#[derive(Debug)]
pub struct VarInfo {
    pub name: Name,
    pub ty: Type,
    pub storage: Storage,
    /// `&` was applied somewhere; the variable must live in memory.
    pub ref_taken: bool,
    /// Hidden string/float literal pool entry; read-only data.
    pub literal: bool,
    pub place: VarPlace,
}

impl VarInfo {
    pub fn global_init(&self) -> Option<&Initializer> {
        match &self.place {
            VarPlace::Global { init, .. } => init.as_ref(),
            VarPlace::Local { .. } => None,
        }
    }
}

/// Index of a scope within [`Session::scopes`]. Index 0 is the global
/// scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

pub const GLOBAL_SCOPE: ScopeId = ScopeId(0);

impl ScopeId {
    pub fn is_global(self) -> bool {
        self == GLOBAL_SCOPE
    }
}

#[derive(Debug, Default)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub vars: Vec<VarInfo>,
    pub typedefs: HashMap<Name, Type>,
    pub struct_tags: HashMap<Name, StructRef>,
    pub enum_consts: HashMap<Name, i64>,
}

/// Compilation-wide state: the interner, diagnostics, every scope, and
/// the hidden-label counter. One compilation per value; nothing hides in
/// process globals.
pub struct Session {
    pub names: Rc<RefCell<NameTable>>,
    pub diags: Rc<RefCell<crate::diag::Diagnostics>>,
    pub scopes: Vec<Scope>,
    label_count: u32,
}

impl Session {
    pub fn new(
        names: Rc<RefCell<NameTable>>,
        diags: Rc<RefCell<crate::diag::Diagnostics>>,
    ) -> Session {
        Session { names, diags, scopes: vec![Scope::default()], label_count: 0 }
    }

    pub fn name_str(&self, name: Name) -> String {
        self.names.borrow().get(name).to_string()
    }

    pub fn intern(&self, text: &str) -> Name {
        self.names.borrow_mut().intern(text)
    }

    /// Synthesize a fresh hidden label (`.L<n>`), interned like any name.
    pub fn alloc_label(&mut self) -> Name {
        let label = format!(".L{}", self.label_count);
        self.label_count += 1;
        self.intern(&label)
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    pub fn new_scope(&mut self, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope { parent: Some(parent), ..Scope::default() });
        id
    }

    pub fn var(&self, scope: ScopeId, index: usize) -> &VarInfo {
        &self.scope(scope).vars[index]
    }

    pub fn var_mut(&mut self, scope: ScopeId, index: usize) -> &mut VarInfo {
        &mut self.scope_mut(scope).vars[index]
    }

    /// Find `name` in exactly this scope.
    pub fn var_find(&self, scope: ScopeId, name: Name) -> Option<usize> {
        self.scope(scope).vars.iter().position(|v| v.name == name)
    }

    /// Find `name` walking the parent chain. Returns the defining scope.
    pub fn scope_find(&self, mut scope: ScopeId, name: Name) -> Option<(ScopeId, usize)> {
        loop {
            if let Some(index) = self.var_find(scope, name) {
                return Some((scope, index));
            }
            scope = self.scope(scope).parent?;
        }
    }

    pub fn add_var(
        &mut self,
        scope: ScopeId,
        name: Name,
        ty: Type,
        storage: Storage,
    ) -> usize {
        let place = if scope.is_global() {
            VarPlace::Global { init: None, func_defined: false }
        } else {
            VarPlace::Local { static_gvar: None }
        };
        let vars = &mut self.scope_mut(scope).vars;
        vars.push(VarInfo { name, ty, storage, ref_taken: false, literal: false, place });
        vars.len() - 1
    }

    pub fn find_typedef(&self, mut scope: ScopeId, name: Name) -> Option<(ScopeId, Type)> {
        loop {
            if let Some(ty) = self.scope(scope).typedefs.get(&name) {
                return Some((scope, ty.clone()));
            }
            scope = self.scope(scope).parent?;
        }
    }

    pub fn add_typedef(&mut self, scope: ScopeId, name: Name, ty: Type) {
        self.scope_mut(scope).typedefs.insert(name, ty);
    }

    pub fn find_struct_tag(&self, mut scope: ScopeId, name: Name) -> Option<StructRef> {
        loop {
            if let Some(sref) = self.scope(scope).struct_tags.get(&name) {
                return Some(sref.clone());
            }
            scope = self.scope(scope).parent?;
        }
    }

    pub fn add_struct_tag(&mut self, scope: ScopeId, name: Name, sref: StructRef) {
        self.scope_mut(scope).struct_tags.insert(name, sref);
    }

    pub fn find_enum_const(&self, mut scope: ScopeId, name: Name) -> Option<i64> {
        loop {
            if let Some(&value) = self.scope(scope).enum_consts.get(&name) {
                return Some(value);
            }
            scope = self.scope(scope).parent?;
        }
    }

    pub fn add_enum_const(&mut self, scope: ScopeId, name: Name, value: i64) {
        self.scope_mut(scope).enum_consts.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;

    fn session() -> Session {
        Session::new(
            Rc::new(RefCell::new(NameTable::new())),
            Rc::new(RefCell::new(Diagnostics::new())),
        )
    }

    #[test]
    fn test_interning_identity() {
        let mut table = NameTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        let c = table.intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.get(a), "foo");
    }

    #[test]
    fn test_scope_chain_lookup() {
        let mut session = session();
        let x = session.intern("x");
        let y = session.intern("y");
        session.add_var(GLOBAL_SCOPE, x, Type::INT, Storage::default());

        let inner = session.new_scope(GLOBAL_SCOPE);
        session.add_var(inner, y, Type::LONG, Storage::default());

        // y is only visible in the inner scope.
        assert!(session.scope_find(GLOBAL_SCOPE, y).is_none());
        let (scope, index) = session.scope_find(inner, y).unwrap();
        assert_eq!(scope, inner);
        assert_eq!(session.var(scope, index).ty, Type::LONG);

        // x is found by walking up.
        let (scope, _) = session.scope_find(inner, x).unwrap();
        assert!(scope.is_global());
    }

    #[test]
    fn test_shadowing() {
        let mut session = session();
        let x = session.intern("x");
        session.add_var(GLOBAL_SCOPE, x, Type::INT, Storage::default());
        let inner = session.new_scope(GLOBAL_SCOPE);
        session.add_var(inner, x, Type::CHAR, Storage::default());

        let (scope, index) = session.scope_find(inner, x).unwrap();
        assert_eq!(scope, inner);
        assert_eq!(session.var(scope, index).ty, Type::CHAR);
    }

    #[test]
    fn test_alloc_label_unique() {
        let mut session = session();
        let a = session.alloc_label();
        let b = session.alloc_label();
        assert_ne!(a, b);
        assert_eq!(session.name_str(a), ".L0");
        assert_eq!(session.name_str(b), ".L1");
    }

    #[test]
    fn test_typedef_scoping() {
        let mut session = session();
        let name = session.intern("T");
        session.add_typedef(GLOBAL_SCOPE, name, Type::LONG);
        let inner = session.new_scope(GLOBAL_SCOPE);
        let (scope, ty) = session.find_typedef(inner, name).unwrap();
        assert!(scope.is_global());
        assert_eq!(ty, Type::LONG);
    }
}
