//! Lowering: typed AST to basic-block IR.
//!
//! One `CodeGen` lowers one function. The `curbb` cursor names the block
//! new IR is appended to; joins (labels, loop headers, branch merges)
//! each get their own block. `return` always jumps to the single
//! `ret_bb`, which the emitter turns into the epilogue.

mod exprs;
mod statements;

use std::collections::HashMap;

use tracing::debug;

use crate::ast::{Declaration, Expr, ExprKind, Function, InitKind, Initializer};
use crate::config::TargetConfig;
use crate::diag::CompileError;
use crate::ir::{
    BB, BBId, Cond, FuncBackend, Ir, IrKind, PrecallInfo, RegAlloc, VRegFlags, VRegId, VRegType,
};
use crate::lexer::Token;
use crate::symbols::{GLOBAL_SCOPE, Name, ScopeId, Session, Storage, VarPlace};
use crate::types::Type;

type R<T> = Result<T, CompileError>;

/// One lowered function, paired with its declaration.
pub struct LoweredFunc {
    pub decl_index: usize,
    pub backend: FuncBackend,
}

/// Lower every function body in the translation unit.
pub fn lower(
    session: &mut Session,
    config: &TargetConfig,
    decls: &[Declaration],
) -> R<Vec<LoweredFunc>> {
    let mut out = Vec::new();
    for (decl_index, decl) in decls.iter().enumerate() {
        if let Declaration::Defun(func) = decl {
            debug!(func = %session.name_str(func.name), "lowering");
            let backend = CodeGen::new(session, config).lower_function(func)?;
            out.push(LoweredFunc { decl_index, backend });
        }
    }
    Ok(out)
}

/// Where a variable reference lands.
pub(super) enum VarAccess {
    /// Register-allocated local.
    Reg(VRegId),
    /// Memory-bound local; the id names its stack slot.
    Slot(VRegId),
    /// Global (or extern, or the shadow global of a static local).
    Global { label: Name, global: bool },
}

pub(super) struct CodeGen<'a> {
    pub session: &'a mut Session,
    pub config: &'a TargetConfig,

    pub ra: RegAlloc,
    bbs: Vec<BB>,
    order: Vec<BBId>,
    curbb: BBId,
    ret_bb: BBId,
    precalls: Vec<PrecallInfo>,

    pub(super) break_stack: Vec<BBId>,
    pub(super) continue_stack: Vec<BBId>,
    /// Per enclosing switch: one block per `case`/`default` entry.
    pub(super) case_bbs_stack: Vec<Vec<BBId>>,
    label_bbs: HashMap<Name, BBId>,
    local_map: HashMap<(ScopeId, usize), VRegId>,
}

impl<'a> CodeGen<'a> {
    pub fn new(session: &'a mut Session, config: &'a TargetConfig) -> CodeGen<'a> {
        CodeGen {
            session,
            config,
            ra: RegAlloc::new(),
            bbs: Vec::new(),
            order: Vec::new(),
            curbb: BBId(0),
            ret_bb: BBId(0),
            precalls: Vec::new(),
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            case_bbs_stack: Vec::new(),
            label_bbs: HashMap::new(),
            local_map: HashMap::new(),
        }
    }

    // ---- block management ----

    pub(super) fn new_bb(&mut self) -> BBId {
        let label = self.session.alloc_label();
        let id = BBId(self.bbs.len() as u32);
        self.bbs.push(BB { label, irs: Vec::new() });
        id
    }

    /// Switch the cursor; the block enters layout order here, so the
    /// previous block falls through into it.
    pub(super) fn set_curbb(&mut self, bb: BBId) {
        self.order.push(bb);
        self.curbb = bb;
    }

    pub(super) fn push_ir(&mut self, ir: Ir) {
        self.bbs[self.curbb.0 as usize].irs.push(ir);
    }

    /// Emit a jump and split: a block's only exits are at its bottom, so
    /// subsequent IR starts a fresh fallthrough block.
    pub(super) fn jmp(&mut self, cond: Cond, bb: BBId) {
        self.push_ir(Ir::new(IrKind::Jmp { bb, cond }, 0));
        let next = self.new_bb();
        self.set_curbb(next);
    }

    pub(super) fn ret_bb(&self) -> BBId {
        self.ret_bb
    }

    pub(super) fn label_bb(&mut self, name: Name) -> BBId {
        if let Some(&bb) = self.label_bbs.get(&name) {
            return bb;
        }
        let bb = self.new_bb();
        self.label_bbs.insert(name, bb);
        bb
    }

    pub(super) fn new_precall(&mut self, info: PrecallInfo) -> usize {
        self.precalls.push(info);
        self.precalls.len() - 1
    }

    // ---- function driver ----

    pub fn lower_function(mut self, func: &Function) -> R<FuncBackend> {
        let entry = self.new_bb();
        self.set_curbb(entry);
        self.ret_bb = self.new_bb();

        // Give every local its virtual register up front; blocks are
        // revisited here via the scopes the parser recorded.
        for &scope_id in &func.scopes {
            let var_count = self.session.scope(scope_id).vars.len();
            for index in 0..var_count {
                let var = self.session.var(scope_id, index);
                if var.storage.is_extern || var.storage.is_static || var.storage.is_typedef {
                    continue;
                }
                if matches!(var.place, VarPlace::Local { static_gvar: Some(_) }) {
                    continue;
                }
                let vtype = VRegType::of(&var.ty);
                // Body-level locals share the parameter scope; only the
                // leading entries are actual parameters.
                let is_param = scope_id == func.param_scope && index < func.params.len();
                let flags = VRegFlags {
                    ref_taken: var.ref_taken,
                    param: is_param,
                    ..VRegFlags::default()
                };
                let vreg = self.ra.new_vreg(vtype, flags);
                if is_param {
                    self.ra.vreg_mut(vreg).param_index = Some(index);
                }
                self.local_map.insert((scope_id, index), vreg);
            }
        }

        for stmt in &func.stmts {
            self.gen_stmt(stmt)?;
        }

        // Fall through into the single return block.
        let ret_bb = self.ret_bb;
        self.set_curbb(ret_bb);

        let mut backend = FuncBackend {
            ra: self.ra,
            bbs: self.bbs,
            order: self.order,
            ret_bb,
            precalls: self.precalls,
            frame_size: 0,
            used_callee_saved: Vec::new(),
        };
        backend.remove_unreachable_blocks();
        Ok(backend)
    }

    // ---- variables and hidden globals ----

    pub(super) fn resolve_var(&mut self, name: Name, scope: ScopeId) -> VarAccess {
        let Some((found_scope, index)) = self.session.scope_find(scope, name) else {
            // The parser recovered from an undeclared identifier; treat
            // it as an extern global so lowering can continue.
            return VarAccess::Global { label: name, global: true };
        };
        let var = self.session.var(found_scope, index);
        if found_scope.is_global() {
            return VarAccess::Global { label: name, global: !var.storage.is_static };
        }
        if var.storage.is_extern {
            return VarAccess::Global { label: name, global: true };
        }
        if let VarPlace::Local { static_gvar: Some(label) } = &var.place {
            return VarAccess::Global { label: *label, global: false };
        }
        let vreg = self.local_map[&(found_scope, index)];
        if self.ra.vreg(vreg).in_memory() {
            VarAccess::Slot(vreg)
        } else {
            VarAccess::Reg(vreg)
        }
    }

    /// Hidden static global holding a float literal; loads come from
    /// `.rodata` the same way string literals do.
    pub(super) fn flonum_literal_global(&mut self, value: f64, ty: &Type, token: &Token) -> Name {
        let label = self.session.alloc_label();
        let storage = Storage { is_static: true, ..Storage::default() };
        let index = self.session.add_var(GLOBAL_SCOPE, label, ty.clone(), storage);
        self.session.var_mut(GLOBAL_SCOPE, index).literal = true;
        let init = Initializer {
            kind: InitKind::Single(Expr::new(ExprKind::Flonum(value), ty.clone(), token.clone())),
            token: token.clone(),
        };
        if let VarPlace::Global { init: slot, .. } =
            &mut self.session.var_mut(GLOBAL_SCOPE, index).place
        {
            *slot = Some(init);
        }
        label
    }

    /// Hidden static global for a string literal reached during
    /// lowering (most are promoted during parse already).
    pub(super) fn string_literal_global(
        &mut self,
        bytes: std::rc::Rc<Vec<u8>>,
        token: &Token,
    ) -> Name {
        let label = self.session.alloc_label();
        let ty = Type::Array { elem: Box::new(Type::CHAR), len: bytes.len() as isize };
        let storage = Storage { is_static: true, ..Storage::default() };
        let index = self.session.add_var(GLOBAL_SCOPE, label, ty.clone(), storage);
        self.session.var_mut(GLOBAL_SCOPE, index).literal = true;
        let init = Initializer {
            kind: InitKind::Single(Expr::new(ExprKind::Str(bytes), ty, token.clone())),
            token: token.clone(),
        };
        if let VarPlace::Global { init: slot, .. } =
            &mut self.session.var_mut(GLOBAL_SCOPE, index).place
        {
            *slot = Some(init);
        }
        label
    }

    /// Constant 1 (or the element size for pointers) used by the
    /// increment/decrement family.
    pub(super) fn incdec_delta(&self, ty: &Type) -> i64 {
        match ty.pointee() {
            Some(p) => p.size().max(1) as i64,
            None => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::ir::IrKind;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::symbols::NameTable;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn lower_source(source: &str) -> (Session, Vec<Declaration>, Vec<LoweredFunc>) {
        let names = Rc::new(RefCell::new(NameTable::new()));
        let diags = Rc::new(RefCell::new(Diagnostics::new()));
        let mut lexer = Lexer::new(source, "test.c", names.clone(), diags.clone());
        let mut session = Session::new(names, diags.clone());
        let mut decls = Vec::new();
        Parser::new(&mut lexer, &mut session).parse(&mut decls).expect("parse");
        assert_eq!(diags.borrow().error_count(), 0, "parse errors");
        let config = TargetConfig::default();
        let lowered = lower(&mut session, &config, &decls).expect("lower");
        (session, decls, lowered)
    }

    #[test]
    fn test_single_entry_single_ret() {
        let (_, _, lowered) = lower_source("int main(void) { return 42; }");
        let backend = &lowered[0].backend;
        assert!(!backend.order.is_empty());
        assert_eq!(*backend.order.last().unwrap(), backend.ret_bb);
        // Exactly one occurrence of ret_bb in layout.
        assert_eq!(backend.order.iter().filter(|&&b| b == backend.ret_bb).count(), 1);
    }

    #[test]
    fn test_every_block_except_ret_has_successor() {
        let (_, _, lowered) = lower_source(
            "int f(int n) { int a = 0; for (int i = 0; i < n; ++i) a += i; return a; }",
        );
        let backend = &lowered[0].backend;
        for pos in 0..backend.order.len() {
            if backend.order[pos] == backend.ret_bb {
                continue;
            }
            assert!(
                !backend.successors(pos).is_empty(),
                "block {:?} has no successor",
                backend.order[pos]
            );
        }
    }

    #[test]
    fn test_return_jumps_to_ret_bb() {
        let (_, _, lowered) = lower_source("int main(void) { return 1; }");
        let backend = &lowered[0].backend;
        let entry = backend.bb(backend.order[0]);
        let has_ret_jump = entry.irs.iter().any(|ir| {
            matches!(&ir.kind, IrKind::Jmp { bb, cond: Cond::Any } if *bb == backend.ret_bb)
        });
        assert!(has_ret_jump);
        let has_result = entry.irs.iter().any(|ir| matches!(ir.kind, IrKind::Result));
        assert!(has_result);
    }

    #[test]
    fn test_dead_block_removed() {
        let (_, _, lowered) =
            lower_source("int main(void) { return 1; while (1) { } return 2; }");
        let backend = &lowered[0].backend;
        // Everything after the first return is unreachable; the layout
        // keeps only the entry and the return block.
        assert!(backend.order.len() <= 3);
    }

    #[test]
    fn test_address_taken_local_in_memory() {
        let (_, _, lowered) =
            lower_source("int main(void) { int x = 1; int *p = &x; return *p; }");
        let backend = &lowered[0].backend;
        let memory_bound =
            backend.ra.vregs.iter().filter(|v| v.flags.ref_taken && !v.flags.is_const).count();
        assert!(memory_bound >= 1);
    }

    #[test]
    fn test_call_has_precall_backref() {
        let (_, _, lowered) =
            lower_source("int g(int x); int main(void) { return g(1) + g(2); }");
        let backend = &lowered[0].backend;
        let mut calls = 0;
        for &bbid in &backend.order {
            for ir in &backend.bb(bbid).irs {
                if let IrKind::Call(info) = &ir.kind {
                    assert!(info.precall < backend.precalls.len());
                    calls += 1;
                }
            }
        }
        assert_eq!(calls, 2);
        assert_eq!(backend.precalls.len(), 2);
    }

    #[test]
    fn test_switch_dense_uses_table_jump() {
        let (_, _, lowered) = lower_source(
            "int f(int n) { switch (n) { case 0: return 1; case 1: return 2; \
             case 2: return 3; case 3: return 4; default: return 0; } }",
        );
        let backend = &lowered[0].backend;
        let mut tjmps = 0;
        for &bbid in &backend.order {
            for ir in &backend.bb(bbid).irs {
                if matches!(ir.kind, IrKind::TJmp { .. }) {
                    tjmps += 1;
                }
            }
        }
        assert_eq!(tjmps, 1);
    }

    #[test]
    fn test_switch_sparse_uses_compare_cascade() {
        let (_, _, lowered) = lower_source(
            "int f(int n) { switch (n) { case 0: return 1; case 100: return 2; } return 0; }",
        );
        let backend = &lowered[0].backend;
        for &bbid in &backend.order {
            for ir in &backend.bb(bbid).irs {
                assert!(!matches!(ir.kind, IrKind::TJmp { .. }));
            }
        }
    }
}
