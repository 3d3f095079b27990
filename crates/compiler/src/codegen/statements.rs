//! Statement lowering: control flow to blocks and jumps.
//!
//! Loops keep their break/continue targets on stacks; a switch keeps one
//! block per case and either emits a jump table (dense case sets) or a
//! compare cascade.

use crate::ast::{CaseInfo, Expr, ExprKind, Stmt};
use crate::diag::CompileError;
use crate::ir::{Cond, Ir, IrKind, VRegFlags, VRegType};

use super::{CodeGen, VarAccess};

type R<T> = Result<T, CompileError>;

/// Emit a jump table when at least this many cases fill at least half
/// of the value range.
const TABLE_JUMP_MIN_CASES: usize = 4;

impl CodeGen<'_> {
    pub(super) fn gen_stmt(&mut self, stmt: &Stmt) -> R<()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.gen_expr(expr)?;
                Ok(())
            }
            Stmt::Block { stmts, .. } => {
                for stmt in stmts {
                    self.gen_stmt(stmt)?;
                }
                Ok(())
            }
            Stmt::VarDecl { inits } => {
                for stmt in inits {
                    self.gen_stmt(stmt)?;
                }
                Ok(())
            }
            Stmt::If { cond, then_stmt, else_stmt } => {
                self.gen_if(cond, then_stmt, else_stmt.as_deref())
            }
            Stmt::Switch { value, body, cases } => self.gen_switch(value, body, cases),
            Stmt::Case { index } => {
                let bb = self.case_bbs_stack.last().expect("case outside switch")[*index];
                self.set_curbb(bb);
                Ok(())
            }
            Stmt::While { cond, body } => self.gen_while(cond, body),
            Stmt::DoWhile { body, cond } => self.gen_do_while(body, cond),
            Stmt::For { pre, cond, post, body } => self.gen_for(pre, cond, post, body),
            Stmt::Break => {
                let target = *self.break_stack.last().expect("break outside loop");
                self.jmp(Cond::Any, target);
                Ok(())
            }
            Stmt::Continue => {
                let target = *self.continue_stack.last().expect("continue outside loop");
                self.jmp(Cond::Any, target);
                Ok(())
            }
            Stmt::Goto { label, .. } => {
                let bb = self.label_bb(*label);
                self.jmp(Cond::Any, bb);
                Ok(())
            }
            Stmt::Label { name, stmt } => {
                let bb = self.label_bb(*name);
                self.set_curbb(bb);
                self.gen_stmt(stmt)
            }
            Stmt::Return { value } => {
                if let Some(expr) = value {
                    let vreg = self.gen_expr_value(expr)?;
                    self.push_ir(Ir::new(IrKind::Result, expr.ty.size()).with_opr1(vreg));
                }
                let ret_bb = self.ret_bb();
                self.jmp(Cond::Any, ret_bb);
                Ok(())
            }
            Stmt::Asm { template, output } => self.gen_asm(template, output.as_ref()),
            Stmt::Clear(expr) => {
                let size = expr.ty.size();
                let addr = self.gen_lval(expr)?;
                self.push_ir(Ir::new(IrKind::Clear { size }, size).with_opr1(addr));
                Ok(())
            }
        }
    }

    fn gen_if(&mut self, cond: &Expr, then_stmt: &Stmt, else_stmt: Option<&Stmt>) -> R<()> {
        match else_stmt {
            None => {
                let next_bb = self.new_bb();
                self.gen_cond_jmp(cond, false, next_bb)?;
                self.gen_stmt(then_stmt)?;
                self.set_curbb(next_bb);
            }
            Some(else_stmt) => {
                let else_bb = self.new_bb();
                let next_bb = self.new_bb();
                self.gen_cond_jmp(cond, false, else_bb)?;
                self.gen_stmt(then_stmt)?;
                self.jmp(Cond::Any, next_bb);
                self.set_curbb(else_bb);
                self.gen_stmt(else_stmt)?;
                self.set_curbb(next_bb);
            }
        }
        Ok(())
    }

    fn gen_while(&mut self, cond: &Expr, body: &Stmt) -> R<()> {
        let cond_bb = self.new_bb();
        let break_bb = self.new_bb();

        self.set_curbb(cond_bb);
        self.gen_cond_jmp(cond, false, break_bb)?;

        self.break_stack.push(break_bb);
        self.continue_stack.push(cond_bb);
        let body_result = self.gen_stmt(body);
        self.break_stack.pop();
        self.continue_stack.pop();
        body_result?;

        self.jmp(Cond::Any, cond_bb);
        self.set_curbb(break_bb);
        Ok(())
    }

    fn gen_do_while(&mut self, body: &Stmt, cond: &Expr) -> R<()> {
        let body_bb = self.new_bb();
        let cond_bb = self.new_bb();
        let break_bb = self.new_bb();

        self.set_curbb(body_bb);
        self.break_stack.push(break_bb);
        self.continue_stack.push(cond_bb);
        let body_result = self.gen_stmt(body);
        self.break_stack.pop();
        self.continue_stack.pop();
        body_result?;

        self.set_curbb(cond_bb);
        self.gen_cond_jmp(cond, true, body_bb)?;
        self.set_curbb(break_bb);
        Ok(())
    }

    fn gen_for(
        &mut self,
        pre: &Option<Expr>,
        cond: &Option<Expr>,
        post: &Option<Expr>,
        body: &Stmt,
    ) -> R<()> {
        if let Some(pre) = pre {
            self.gen_expr(pre)?;
        }
        let cond_bb = self.new_bb();
        let continue_bb = self.new_bb();
        let break_bb = self.new_bb();

        self.set_curbb(cond_bb);
        if let Some(cond) = cond {
            self.gen_cond_jmp(cond, false, break_bb)?;
        }

        self.break_stack.push(break_bb);
        self.continue_stack.push(continue_bb);
        let body_result = self.gen_stmt(body);
        self.break_stack.pop();
        self.continue_stack.pop();
        body_result?;

        self.set_curbb(continue_bb);
        if let Some(post) = post {
            self.gen_expr(post)?;
        }
        self.jmp(Cond::Any, cond_bb);
        self.set_curbb(break_bb);
        Ok(())
    }

    fn gen_switch(&mut self, value: &Expr, body: &Stmt, cases: &[CaseInfo]) -> R<()> {
        let break_bb = self.new_bb();
        let case_bbs: Vec<_> = cases.iter().map(|_| self.new_bb()).collect();
        let default_bb = cases
            .iter()
            .position(|c| c.value.is_none())
            .map(|i| case_bbs[i])
            .unwrap_or(break_bb);

        let value_vreg = self.gen_expr_value(value)?;
        let size = value.ty.size().max(4);

        let mut labeled: Vec<(i64, usize)> = cases
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.value.map(|v| (v, i)))
            .collect();
        labeled.sort_by_key(|&(v, _)| v);

        let dense = if labeled.len() >= TABLE_JUMP_MIN_CASES {
            let min = labeled[0].0;
            let max = labeled[labeled.len() - 1].0;
            let range = (max - min + 1) as usize;
            range <= labeled.len() * 2
        } else {
            false
        };

        if dense {
            let min = labeled[0].0;
            let max = labeled[labeled.len() - 1].0;
            let range = (max - min + 1) as usize;

            // index = value - min; out-of-range goes to default.
            let index = if min != 0 {
                let min_vreg = self.ra.new_const(min, self.ra.vreg(value_vreg).vtype);
                let dst = self.ra.new_vreg(self.ra.vreg(value_vreg).vtype, VRegFlags::default());
                self.push_ir(
                    Ir::new(IrKind::Sub, size)
                        .with_dst(dst)
                        .with_opr1(value_vreg)
                        .with_opr2(min_vreg),
                );
                dst
            } else {
                value_vreg
            };
            let bound = self.ra.new_const(range as i64, self.ra.vreg(index).vtype);
            self.push_ir(Ir::new(IrKind::Cmp, size).with_opr1(index).with_opr2(bound));
            self.jmp(Cond::UGe, default_bb);

            let table_bb = self.new_bb();
            self.set_curbb(table_bb);
            let mut targets = vec![default_bb; range];
            for &(v, i) in &labeled {
                targets[(v - min) as usize] = case_bbs[i];
            }
            self.push_ir(Ir::new(IrKind::TJmp { targets }, size).with_opr1(index));
        } else {
            for &(v, i) in &labeled {
                let case_vreg = self.ra.new_const(v, self.ra.vreg(value_vreg).vtype);
                self.push_ir(
                    Ir::new(IrKind::Cmp, size).with_opr1(value_vreg).with_opr2(case_vreg),
                );
                self.jmp(Cond::Eq, case_bbs[i]);
            }
            self.jmp(Cond::Any, default_bb);
        }

        self.break_stack.push(break_bb);
        self.case_bbs_stack.push(case_bbs);
        let body_result = self.gen_stmt(body);
        self.case_bbs_stack.pop();
        self.break_stack.pop();
        body_result?;

        self.jmp(Cond::Any, break_bb);
        self.set_curbb(break_bb);
        Ok(())
    }

    fn gen_asm(&mut self, template: &std::rc::Rc<Vec<u8>>, output: Option<&Expr>) -> R<()> {
        let mut ir = Ir::new(IrKind::Asm { template: template.clone() }, 0);
        match output {
            None => self.push_ir(ir),
            Some(var_expr) => {
                if let ExprKind::Var { name, scope } = &var_expr.kind {
                    match self.resolve_var(*name, *scope) {
                        VarAccess::Reg(vreg) => {
                            ir = ir.with_dst(vreg);
                            self.push_ir(ir);
                        }
                        _ => {
                            // Memory-bound output: stage through a fresh
                            // register, then store.
                            let vtype = VRegType::of(&var_expr.ty);
                            let tmp = self.ra.new_vreg(vtype, VRegFlags::default());
                            ir = ir.with_dst(tmp);
                            self.push_ir(ir);
                            let addr = self.gen_lval(var_expr)?;
                            self.store(tmp, addr, var_expr.ty.size());
                        }
                    }
                } else {
                    self.push_ir(ir);
                }
            }
        }
        Ok(())
    }
}
