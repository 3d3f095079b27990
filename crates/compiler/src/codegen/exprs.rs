//! Expression lowering.
//!
//! Post-order: operands first, then the op. Values live in virtual
//! registers; aggregates travel as addresses. Short-circuit operators
//! and the conditional operator write a shared result register from
//! both arms instead of materializing a phi.

use crate::ast::{BinOp, Expr, ExprKind, UnOp};
use crate::diag::CompileError;
use crate::ir::{
    BBId, CallInfo, Cond, Ir, IrKind, PrecallInfo, VRegFlags, VRegId, VRegType, WORD_SIZE,
};
use crate::lexer::Token;
use crate::symbols::Name;
use crate::types::Type;

use super::{CodeGen, VarAccess};

type R<T> = Result<T, CompileError>;

impl CodeGen<'_> {
    pub(super) fn gen_expr(&mut self, expr: &Expr) -> R<Option<VRegId>> {
        match &expr.kind {
            ExprKind::Fixnum(value) => {
                Ok(Some(self.ra.new_const(*value, VRegType::of(&expr.ty))))
            }
            ExprKind::Flonum(value) => {
                Ok(Some(self.load_flonum(*value, &expr.ty, &expr.token)))
            }
            ExprKind::Str(bytes) => {
                let label = self.string_literal_global(bytes.clone(), &expr.token);
                Ok(Some(self.iofs(label, false)))
            }
            ExprKind::Var { name, scope } => Ok(Some(self.gen_var_value(*name, *scope, &expr.ty))),
            ExprKind::Member { .. } => {
                let addr = self.gen_lval(expr)?;
                if VRegType::of(&expr.ty).non_reg {
                    Ok(Some(addr))
                } else {
                    Ok(Some(self.load(addr, VRegType::of(&expr.ty))))
                }
            }
            ExprKind::Unary { op, sub } => self.gen_unary(expr, *op, sub),
            ExprKind::Bop { op, lhs, rhs } => self.gen_bop(expr, *op, lhs, rhs),
            ExprKind::Ternary { cond, then_expr, else_expr } => {
                self.gen_ternary(expr, cond, then_expr, else_expr)
            }
            ExprKind::Funcall { func, args } => self.gen_funcall(expr, func, args),
            ExprKind::Complit { var, inits } => {
                for stmt in inits {
                    self.gen_stmt(stmt)?;
                }
                self.gen_expr(var)
            }
        }
    }

    /// Expression in a value position; void is an internal error fed by
    /// a parse bug, so recover with a zero.
    pub(super) fn gen_expr_value(&mut self, expr: &Expr) -> R<VRegId> {
        match self.gen_expr(expr)? {
            Some(vreg) => Ok(vreg),
            None => {
                debug_assert!(false, "value expected from void expression");
                Ok(self.ra.new_const(0, VRegType::word()))
            }
        }
    }

    // ---- addresses ----

    pub(super) fn gen_lval(&mut self, expr: &Expr) -> R<VRegId> {
        match &expr.kind {
            ExprKind::Var { name, scope } => match self.resolve_var(*name, *scope) {
                VarAccess::Global { label, global } => Ok(self.iofs(label, global)),
                VarAccess::Slot(slot) => Ok(self.bofs(slot)),
                VarAccess::Reg(_) => {
                    unreachable!("taking the address of a register variable")
                }
            },
            ExprKind::Str(bytes) => {
                let label = self.string_literal_global(bytes.clone(), &expr.token);
                Ok(self.iofs(label, false))
            }
            ExprKind::Unary { op: UnOp::Deref, sub } => self.gen_expr_value(sub),
            ExprKind::Member { target, index } => {
                let base = self.gen_lval(target)?;
                let offset = member_offset(&target.ty, *index);
                if offset == 0 {
                    Ok(base)
                } else {
                    let off = self.ra.new_const(offset as i64, VRegType::word());
                    let dst = self.ra.new_vreg(VRegType::word(), VRegFlags::default());
                    self.push_ir(
                        Ir::new(IrKind::Add, WORD_SIZE).with_dst(dst).with_opr1(base).with_opr2(off),
                    );
                    Ok(dst)
                }
            }
            ExprKind::Complit { var, inits } => {
                for stmt in inits {
                    self.gen_stmt(stmt)?;
                }
                self.gen_lval(var)
            }
            _ => {
                // The parser only lets addressable expressions through.
                unreachable!("not an lvalue")
            }
        }
    }

    fn gen_var_value(&mut self, name: Name, scope: crate::symbols::ScopeId, ty: &Type) -> VRegId {
        let vtype = VRegType::of(ty);
        match self.resolve_var(name, scope) {
            VarAccess::Reg(vreg) => vreg,
            VarAccess::Slot(slot) => {
                let addr = self.bofs(slot);
                if vtype.non_reg { addr } else { self.load(addr, vtype) }
            }
            VarAccess::Global { label, global } => {
                let addr = self.iofs(label, global);
                if vtype.non_reg || ty.is_func() {
                    addr
                } else {
                    self.load(addr, vtype)
                }
            }
        }
    }

    // ---- small IR helpers ----

    pub(super) fn iofs(&mut self, label: Name, global: bool) -> VRegId {
        let dst = self.ra.new_vreg(VRegType::word(), VRegFlags::default());
        self.push_ir(Ir::new(IrKind::Iofs { label, global }, WORD_SIZE).with_dst(dst));
        dst
    }

    pub(super) fn bofs(&mut self, slot: VRegId) -> VRegId {
        let dst = self.ra.new_vreg(VRegType::word(), VRegFlags::default());
        self.push_ir(Ir::new(IrKind::Bofs { slot }, WORD_SIZE).with_dst(dst));
        dst
    }

    pub(super) fn load(&mut self, addr: VRegId, vtype: VRegType) -> VRegId {
        let dst = self.ra.new_vreg(vtype, VRegFlags::default());
        self.push_ir(Ir::new(IrKind::Load, vtype.size).with_dst(dst).with_opr1(addr));
        dst
    }

    pub(super) fn store(&mut self, value: VRegId, addr: VRegId, size: usize) {
        self.push_ir(Ir::new(IrKind::Store, size).with_opr1(value).with_opr2(addr));
    }

    pub(super) fn mov(&mut self, dst: VRegId, src: VRegId) {
        let size = self.ra.vreg(dst).vtype.size;
        self.push_ir(Ir::new(IrKind::Mov, size).with_dst(dst).with_opr1(src));
    }

    fn load_flonum(&mut self, value: f64, ty: &Type, token: &Token) -> VRegId {
        let label = self.flonum_literal_global(value, ty, token);
        let addr = self.iofs(label, false);
        self.load(addr, VRegType::of(ty))
    }

    // ---- operators ----

    fn gen_unary(&mut self, expr: &Expr, op: UnOp, sub: &Expr) -> R<Option<VRegId>> {
        match op {
            UnOp::Ref => Ok(Some(self.gen_lval(sub)?)),
            UnOp::Deref => {
                let addr = self.gen_expr_value(sub)?;
                let vtype = VRegType::of(&expr.ty);
                if vtype.non_reg || expr.ty.is_func() {
                    Ok(Some(addr))
                } else {
                    Ok(Some(self.load(addr, vtype)))
                }
            }
            UnOp::Neg => {
                if expr.ty.is_flonum() {
                    // 0.0 - x; SSE has no direct negate.
                    let zero = self.load_flonum(0.0, &expr.ty, &expr.token);
                    let value = self.gen_expr_value(sub)?;
                    let dst = self.ra.new_vreg(VRegType::of(&expr.ty), VRegFlags::default());
                    self.push_ir(
                        Ir::new(IrKind::Sub, expr.ty.size())
                            .with_dst(dst)
                            .with_opr1(zero)
                            .with_opr2(value),
                    );
                    return Ok(Some(dst));
                }
                let value = self.gen_expr_value(sub)?;
                let dst = self.ra.new_vreg(VRegType::of(&expr.ty), VRegFlags::default());
                self.push_ir(
                    Ir::new(IrKind::Neg, expr.ty.size()).with_dst(dst).with_opr1(value),
                );
                Ok(Some(dst))
            }
            UnOp::BitNot => {
                let value = self.gen_expr_value(sub)?;
                let dst = self.ra.new_vreg(VRegType::of(&expr.ty), VRegFlags::default());
                self.push_ir(
                    Ir::new(IrKind::BitNot, expr.ty.size()).with_dst(dst).with_opr1(value),
                );
                Ok(Some(dst))
            }
            UnOp::Not => {
                let value = self.gen_expr_value(sub)?;
                let size = sub.ty.size().max(4);
                let zero = self.ra.new_const(0, self.ra.vreg(value).vtype);
                self.push_ir(Ir::new(IrKind::Cmp, size).with_opr1(value).with_opr2(zero));
                let dst = self.ra.new_vreg(VRegType::of(&expr.ty), VRegFlags::default());
                self.push_ir(
                    Ir::new(IrKind::CondSet { cond: Cond::Eq }, 4).with_dst(dst),
                );
                Ok(Some(dst))
            }
            UnOp::PreInc => Ok(Some(self.gen_incdec(sub, true, true)?)),
            UnOp::PreDec => Ok(Some(self.gen_incdec(sub, false, true)?)),
            UnOp::PostInc => Ok(Some(self.gen_incdec(sub, true, false)?)),
            UnOp::PostDec => Ok(Some(self.gen_incdec(sub, false, false)?)),
            UnOp::Cast => self.gen_cast(expr, sub),
            UnOp::Modify => Ok(Some(self.gen_modify(sub)?)),
        }
    }

    fn gen_cast(&mut self, expr: &Expr, sub: &Expr) -> R<Option<VRegId>> {
        if expr.ty.is_void() {
            // Cast to void evaluates for effect only.
            self.gen_expr(sub)?;
            return Ok(None);
        }
        let value = self.gen_expr_value(sub)?;
        let src = self.ra.vreg(value).vtype;
        let dst_vtype = VRegType::of(&expr.ty);
        if src.size == dst_vtype.size
            && src.flonum == dst_vtype.flonum
            && src.unsigned == dst_vtype.unsigned
        {
            return Ok(Some(value));
        }
        let dst = self.ra.new_vreg(dst_vtype, VRegFlags::default());
        self.push_ir(Ir::new(IrKind::Cast, dst_vtype.size).with_dst(dst).with_opr1(value));
        Ok(Some(dst))
    }

    fn gen_incdec(&mut self, sub: &Expr, inc: bool, pre: bool) -> R<VRegId> {
        let size = sub.ty.size();
        let kind = if inc { IrKind::Add } else { IrKind::Sub };
        let one: VRegId = if sub.ty.is_flonum() {
            self.load_flonum(1.0, &sub.ty, &sub.token)
        } else {
            let delta = self.incdec_delta(&sub.ty);
            self.ra.new_const(delta, VRegType::of(&sub.ty))
        };

        if let ExprKind::Var { name, scope } = &sub.kind {
            if let VarAccess::Reg(vreg) = self.resolve_var(*name, *scope) {
                if pre {
                    self.push_ir(
                        Ir::new(kind, size).with_dst(vreg).with_opr1(vreg).with_opr2(one),
                    );
                    return Ok(vreg);
                }
                let old = self.ra.new_vreg(self.ra.vreg(vreg).vtype, VRegFlags::default());
                self.mov(old, vreg);
                self.push_ir(Ir::new(kind, size).with_dst(vreg).with_opr1(vreg).with_opr2(one));
                return Ok(old);
            }
        }

        let addr = self.gen_lval(sub)?;
        let vtype = VRegType::of(&sub.ty);
        let old = self.load(addr, vtype);
        let new = self.ra.new_vreg(vtype, VRegFlags::default());
        self.push_ir(Ir::new(kind, size).with_dst(new).with_opr1(old).with_opr2(one));
        self.store(new, addr, size);
        Ok(if pre { new } else { old })
    }

    fn gen_modify(&mut self, sub: &Expr) -> R<VRegId> {
        // The wrapped bop's lhs is the lvalue; evaluate its address once.
        let ExprKind::Bop { op, lhs, rhs } = &sub.kind else {
            unreachable!("modify wraps a binary op")
        };
        let kind = arith_ir_kind(*op);
        let size = lhs.ty.size();
        let rhs_value = self.gen_expr_value(rhs)?;

        if let ExprKind::Var { name, scope } = &lhs.kind {
            if let VarAccess::Reg(vreg) = self.resolve_var(*name, *scope) {
                self.push_ir(
                    Ir::new(kind, size).with_dst(vreg).with_opr1(vreg).with_opr2(rhs_value),
                );
                return Ok(vreg);
            }
        }
        let addr = self.gen_lval(lhs)?;
        let vtype = VRegType::of(&lhs.ty);
        let old = self.load(addr, vtype);
        let new = self.ra.new_vreg(vtype, VRegFlags::default());
        self.push_ir(Ir::new(kind, size).with_dst(new).with_opr1(old).with_opr2(rhs_value));
        self.store(new, addr, size);
        Ok(new)
    }

    fn gen_bop(&mut self, expr: &Expr, op: BinOp, lhs: &Expr, rhs: &Expr) -> R<Option<VRegId>> {
        match op {
            BinOp::Assign => Ok(Some(self.gen_assign(lhs, rhs)?)),
            BinOp::Comma => {
                self.gen_expr(lhs)?;
                self.gen_expr(rhs)
            }
            BinOp::LogAnd | BinOp::LogOr => Ok(Some(self.gen_logical_value(expr)?)),
            _ if op.is_comparison() => {
                self.gen_cmp(lhs, rhs)?;
                let cond = self.bop_cond(op, lhs);
                let dst = self.ra.new_vreg(VRegType::of(&expr.ty), VRegFlags::default());
                self.push_ir(Ir::new(IrKind::CondSet { cond }, 4).with_dst(dst));
                Ok(Some(dst))
            }
            _ => {
                let kind = arith_ir_kind(op);
                let l = self.gen_expr_value(lhs)?;
                let r = self.gen_expr_value(rhs)?;
                let vtype = VRegType::of(&expr.ty);
                let dst = self.ra.new_vreg(vtype, VRegFlags::default());
                self.push_ir(
                    Ir::new(kind, expr.ty.size()).with_dst(dst).with_opr1(l).with_opr2(r),
                );
                Ok(Some(dst))
            }
        }
    }

    /// Emit the compare of a comparison operator's operands.
    fn gen_cmp(&mut self, lhs: &Expr, rhs: &Expr) -> R<()> {
        let l = self.gen_expr_value(lhs)?;
        let r = self.gen_expr_value(rhs)?;
        let size = lhs.ty.size().max(rhs.ty.size());
        self.push_ir(Ir::new(IrKind::Cmp, size).with_opr1(l).with_opr2(r));
        Ok(())
    }

    /// Condition code for a comparison, adjusted for unsigned and float
    /// operands (both use the unsigned flavor).
    fn bop_cond(&self, op: BinOp, lhs: &Expr) -> Cond {
        let base = match op {
            BinOp::Eq => Cond::Eq,
            BinOp::Ne => Cond::Ne,
            BinOp::Lt => Cond::Lt,
            BinOp::Le => Cond::Le,
            BinOp::Ge => Cond::Ge,
            BinOp::Gt => Cond::Gt,
            _ => Cond::Any,
        };
        let unsigned = lhs.ty.is_unsigned()
            || lhs.ty.is_ptr()
            || lhs.ty.is_array()
            || lhs.ty.is_flonum();
        if unsigned { base.to_unsigned() } else { base }
    }

    fn gen_assign(&mut self, lhs: &Expr, rhs: &Expr) -> R<VRegId> {
        let value = self.gen_expr_value(rhs)?;

        if let ExprKind::Var { name, scope } = &lhs.kind {
            if let VarAccess::Reg(vreg) = self.resolve_var(*name, *scope) {
                self.mov(vreg, value);
                return Ok(value);
            }
        }
        let addr = self.gen_lval(lhs)?;
        if lhs.ty.is_struct() {
            let size = lhs.ty.size();
            self.push_ir(
                Ir::new(IrKind::Memcpy { size }, size).with_opr1(value).with_opr2(addr),
            );
        } else {
            self.store(value, addr, lhs.ty.size());
        }
        Ok(value)
    }

    fn gen_logical_value(&mut self, expr: &Expr) -> R<VRegId> {
        let false_bb = self.new_bb();
        let next_bb = self.new_bb();
        let result = self.ra.new_vreg(VRegType::of(&Type::INT), VRegFlags::default());

        self.gen_cond_jmp(expr, false, false_bb)?;
        // True arm falls through.
        let one = self.ra.new_const(1, VRegType::of(&Type::INT));
        self.mov(result, one);
        self.jmp(Cond::Any, next_bb);

        self.set_curbb(false_bb);
        let zero = self.ra.new_const(0, VRegType::of(&Type::INT));
        self.mov(result, zero);

        self.set_curbb(next_bb);
        Ok(result)
    }

    fn gen_ternary(
        &mut self,
        expr: &Expr,
        cond: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
    ) -> R<Option<VRegId>> {
        let else_bb = self.new_bb();
        let next_bb = self.new_bb();
        let result = if expr.ty.is_void() {
            None
        } else {
            // Aggregates travel as addresses, so the shared result is a
            // plain word for them.
            let vtype = VRegType::of(&expr.ty);
            let vtype = if vtype.non_reg { VRegType::word() } else { vtype };
            Some(self.ra.new_vreg(vtype, VRegFlags::default()))
        };

        self.gen_cond_jmp(cond, false, else_bb)?;
        let then_value = self.gen_expr(then_expr)?;
        if let (Some(result), Some(value)) = (result, then_value) {
            self.mov(result, value);
        }
        self.jmp(Cond::Any, next_bb);

        self.set_curbb(else_bb);
        let else_value = self.gen_expr(else_expr)?;
        if let (Some(result), Some(value)) = (result, else_value) {
            self.mov(result, value);
        }

        self.set_curbb(next_bb);
        Ok(result)
    }

    fn gen_funcall(&mut self, expr: &Expr, func: &Expr, args: &[Expr]) -> R<Option<VRegId>> {
        let functype = func.ty.func_type().cloned();
        let vaargs = functype.as_ref().is_some_and(|f| f.vaargs);

        // Classify arguments into register and stack passes.
        let max_gp = self.config.max_reg_args();
        let max_fp = self.config.max_freg_args();
        let mut gp_used = 0usize;
        let mut fp_used = 0usize;
        let mut reg_indices = Vec::new();
        let mut stack_indices = Vec::new();
        let mut reg_args = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let is_float = arg.ty.is_flonum();
            let in_reg = if is_float {
                if fp_used < max_fp {
                    fp_used += 1;
                    true
                } else {
                    false
                }
            } else if gp_used < max_gp {
                gp_used += 1;
                true
            } else {
                false
            };
            if in_reg {
                reg_indices.push(i);
                reg_args.push(is_float);
            } else {
                stack_indices.push(i);
            }
        }

        let precall = self.new_precall(PrecallInfo {
            arg_count: args.len(),
            stack_args_size: stack_indices.len() * WORD_SIZE,
            living_gp: Vec::new(),
            living_fp: Vec::new(),
        });
        self.push_ir(Ir::new(IrKind::Precall { index: precall }, 0));

        // Stack-passed arguments first (they sit deepest), then the
        // register-passed ones, each group right to left.
        for &i in stack_indices.iter().rev() {
            let value = self.gen_expr_value(&args[i])?;
            self.push_ir(Ir::new(IrKind::PushArg, WORD_SIZE).with_opr1(value));
        }
        for &i in reg_indices.iter().rev() {
            let value = self.gen_expr_value(&args[i])?;
            self.push_ir(Ir::new(IrKind::PushArg, WORD_SIZE).with_opr1(value));
        }

        // Direct when the callee is a plain function name.
        let (label, global, indirect) = match &func.kind {
            ExprKind::Var { name, scope } if func.ty.is_func() => {
                match self.resolve_var(*name, *scope) {
                    VarAccess::Global { label, global } => (Some(label), global, None),
                    _ => (None, false, Some(self.gen_expr_value(func)?)),
                }
            }
            _ => (None, false, Some(self.gen_expr_value(func)?)),
        };

        let ret_ty = &expr.ty;
        let dst = if ret_ty.is_void() {
            None
        } else {
            Some(self.ra.new_vreg(VRegType::of(ret_ty), VRegFlags::default()))
        };
        let mut ir = Ir::new(
            IrKind::Call(Box::new(CallInfo {
                label,
                global,
                precall,
                reg_args,
                total_args: args.len(),
                vaargs,
            })),
            if ret_ty.is_void() { 0 } else { ret_ty.size() },
        );
        if let Some(dst) = dst {
            ir = ir.with_dst(dst);
        }
        if let Some(f) = indirect {
            ir = ir.with_opr1(f);
        }
        self.push_ir(ir);
        Ok(dst)
    }

    // ---- conditions ----

    /// Branch to `target` when the condition evaluates to `jump_when`;
    /// otherwise fall through.
    pub(super) fn gen_cond_jmp(&mut self, expr: &Expr, jump_when: bool, target: BBId) -> R<()> {
        match &expr.kind {
            ExprKind::Fixnum(value) => {
                if (*value != 0) == jump_when {
                    self.jmp(Cond::Any, target);
                }
                Ok(())
            }
            ExprKind::Unary { op: UnOp::Not, sub } => self.gen_cond_jmp(sub, !jump_when, target),
            ExprKind::Bop { op: BinOp::LogAnd, lhs, rhs } => {
                if jump_when {
                    let skip = self.new_bb();
                    self.gen_cond_jmp(lhs, false, skip)?;
                    self.gen_cond_jmp(rhs, true, target)?;
                    self.set_curbb(skip);
                } else {
                    self.gen_cond_jmp(lhs, false, target)?;
                    self.gen_cond_jmp(rhs, false, target)?;
                }
                Ok(())
            }
            ExprKind::Bop { op: BinOp::LogOr, lhs, rhs } => {
                if jump_when {
                    self.gen_cond_jmp(lhs, true, target)?;
                    self.gen_cond_jmp(rhs, true, target)?;
                } else {
                    let skip = self.new_bb();
                    self.gen_cond_jmp(lhs, true, skip)?;
                    self.gen_cond_jmp(rhs, false, target)?;
                    self.set_curbb(skip);
                }
                Ok(())
            }
            ExprKind::Bop { op, lhs, rhs } if op.is_comparison() => {
                self.gen_cmp(lhs, rhs)?;
                let mut cond = self.bop_cond(*op, lhs);
                if !jump_when {
                    cond = cond.invert();
                }
                self.jmp(cond, target);
                Ok(())
            }
            _ => {
                let value = self.gen_expr_value(expr)?;
                let vtype = self.ra.vreg(value).vtype;
                let zero = self.ra.new_const(0, vtype);
                self.push_ir(
                    Ir::new(IrKind::Cmp, vtype.size).with_opr1(value).with_opr2(zero),
                );
                self.jmp(if jump_when { Cond::Ne } else { Cond::Eq }, target);
                Ok(())
            }
        }
    }
}

fn arith_ir_kind(op: BinOp) -> IrKind {
    match op {
        BinOp::Add => IrKind::Add,
        BinOp::Sub => IrKind::Sub,
        BinOp::Mul => IrKind::Mul,
        BinOp::Div => IrKind::Div,
        BinOp::Mod => IrKind::Mod,
        BinOp::BitAnd => IrKind::BitAnd,
        BinOp::BitOr => IrKind::BitOr,
        BinOp::BitXor => IrKind::BitXor,
        BinOp::LShift => IrKind::LShift,
        BinOp::RShift => IrKind::RShift,
        _ => unreachable!("not an arithmetic operator"),
    }
}

fn member_offset(target_ty: &Type, index: usize) -> usize {
    let Some(sref) = target_ty.struct_ref() else { return 0 };
    let info = sref.info.borrow();
    info.as_ref().map_or(0, |info| info.members[index].offset)
}
