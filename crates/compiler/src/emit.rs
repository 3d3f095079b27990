//! Assembly emission: basic-block IR to AT&T x86-64 text.
//!
//! One short, fixed instruction sequence per IR op. Values narrower than
//! 32 bits are kept sign/zero-extended in 32-bit registers; loads and
//! casts maintain that invariant and stores write the true width.
//! Jump tables go to `.rodata`; globals are laid out with
//! `.quad/.long/.word/.byte/.ascii/.zero` according to their type and
//! flattened initializer.

use std::collections::HashMap;
use std::fmt::Write;

use tracing::debug;

use crate::ast::{BinOp, Declaration, Expr, ExprKind, InitKind, Initializer, UnOp};
use crate::codegen::LoweredFunc;
use crate::config::TargetConfig;
use crate::diag::CompileError;
use crate::ir::{Cond, FuncBackend, Ir, IrKind, VRegId, WORD_SIZE};
use crate::symbols::{GLOBAL_SCOPE, Name, Session, VarPlace};
use crate::types::{FlonumKind, Type};

type R<T> = Result<T, CompileError>;

pub fn emit(
    session: &Session,
    config: &TargetConfig,
    decls: &[Declaration],
    lowered: &[LoweredFunc],
) -> R<String> {
    let mut emitter = Emitter {
        session,
        config,
        out: String::new(),
        stackpos: 0,
        precall_pads: HashMap::new(),
        tables: Vec::new(),
        table_seq: 0,
    };
    emitter.emit_text(decls, lowered)?;
    emitter.emit_data()?;
    Ok(emitter.out)
}

struct Emitter<'a> {
    session: &'a Session,
    config: &'a TargetConfig,
    out: String,
    /// Bytes pushed since function entry (return address excluded);
    /// call sites need `stackpos % 16 == 8` for ABI alignment.
    stackpos: i64,
    precall_pads: HashMap<usize, i64>,
    /// Pending jump tables: (label, target labels).
    tables: Vec<(String, Vec<String>)>,
    table_seq: u32,
}

fn size_suffix(size: usize) -> char {
    match size {
        1 => 'b',
        2 => 'w',
        4 => 'l',
        _ => 'q',
    }
}

fn cond_cc(cond: Cond) -> &'static str {
    match cond {
        Cond::Eq => "e",
        Cond::Ne => "ne",
        Cond::Lt => "l",
        Cond::Le => "le",
        Cond::Ge => "ge",
        Cond::Gt => "g",
        Cond::ULt => "b",
        Cond::ULe => "be",
        Cond::UGe => "ae",
        Cond::UGt => "a",
        Cond::Any => "mp",
    }
}

impl Emitter<'_> {
    fn name(&self, name: Name) -> String {
        self.session.name_str(name)
    }

    // ---- operand rendering ----

    /// Register name for a located (non-const) vreg at `size` bytes.
    fn reg(&self, backend: &FuncBackend, id: VRegId, size: usize) -> String {
        let vreg = backend.ra.vreg(id);
        if vreg.vtype.flonum {
            let name = match (vreg.phys, vreg.scratch) {
                (Some(phys), _) => self.config.fp_regs[phys].name,
                (_, Some(index)) => self.config.fp_scratch[index].name,
                _ => self.config.fp_scratch[0].name,
            };
            return format!("%{}", name);
        }
        let size = size.max(4).min(8);
        let name = match (vreg.phys, vreg.scratch) {
            (Some(phys), _) => self.config.gp_regs[phys].name(size),
            (_, Some(index)) => self.config.gp_scratch[index].name(size),
            _ => self.config.gp_scratch[0].name(size),
        };
        format!("%{}", name)
    }

    fn scratch(&self, index: usize, size: usize) -> String {
        format!("%{}", self.config.gp_scratch[index].name(size.max(4).min(8)))
    }

    /// Register or immediate operand.
    fn opnd(&self, backend: &FuncBackend, id: VRegId, size: usize) -> String {
        let vreg = backend.ra.vreg(id);
        if vreg.flags.is_const {
            format!("${}", vreg.fixnum)
        } else {
            self.reg(backend, id, size)
        }
    }

    /// Force the operand into a register, staging constants through the
    /// given scratch register.
    fn reg_operand(
        &mut self,
        backend: &FuncBackend,
        id: VRegId,
        size: usize,
        scratch: usize,
    ) -> R<String> {
        let vreg = backend.ra.vreg(id);
        if !vreg.flags.is_const {
            return Ok(self.reg(backend, id, size));
        }
        let name = self.scratch(scratch, size);
        self.move_imm(vreg.fixnum, &name, size)?;
        Ok(name)
    }

    fn move_imm(&mut self, value: i64, reg: &str, size: usize) -> R<()> {
        if size.max(4) >= 8 && (value > i32::MAX as i64 || value < i32::MIN as i64) {
            writeln!(self.out, "\tmovabsq ${}, {}", value, reg)?;
        } else {
            writeln!(self.out, "\tmov{} ${}, {}", size_suffix(size.max(4)), value, reg)?;
        }
        Ok(())
    }

    // ---- functions ----

    fn emit_text(&mut self, decls: &[Declaration], lowered: &[LoweredFunc]) -> R<()> {
        if lowered.is_empty() {
            return Ok(());
        }
        writeln!(self.out, "\t.text")?;
        for lf in lowered {
            let Declaration::Defun(func) = &decls[lf.decl_index] else { continue };
            self.emit_function(func, &lf.backend)?;
        }
        Ok(())
    }

    fn emit_function(&mut self, func: &crate::ast::Function, backend: &FuncBackend) -> R<()> {
        let name = self.name(func.name);
        debug!(func = %name, blocks = backend.order.len(), "emitting");

        let is_static = self
            .session
            .scope_find(GLOBAL_SCOPE, func.name)
            .map(|(scope, index)| self.session.var(scope, index).storage.is_static)
            .unwrap_or(false);
        if !is_static {
            writeln!(self.out, "\t.globl {}", name)?;
        }
        writeln!(self.out, "{}:", name)?;

        // Prologue.
        writeln!(self.out, "\tpush %rbp")?;
        writeln!(self.out, "\tmov %rsp, %rbp")?;
        self.stackpos = WORD_SIZE as i64;
        for &phys in &backend.used_callee_saved {
            writeln!(self.out, "\tpush %{}", self.config.gp_regs[phys].name(8))?;
            self.stackpos += WORD_SIZE as i64;
        }
        if backend.frame_size > 0 {
            writeln!(self.out, "\tsub ${}, %rsp", backend.frame_size)?;
            self.stackpos += backend.frame_size;
        }
        self.home_params(backend)?;

        self.precall_pads.clear();
        self.tables.clear();
        for (pos, &bbid) in backend.order.iter().enumerate() {
            if bbid == backend.ret_bb {
                break;
            }
            if pos != 0 {
                writeln!(self.out, "{}:", self.name(backend.bb(bbid).label))?;
            }
            for ir in &backend.bb(bbid).irs {
                self.emit_ir(backend, ir)?;
            }
        }

        // Epilogue (the single return block).
        writeln!(self.out, "{}:", self.name(backend.bb(backend.ret_bb).label))?;
        if !backend.used_callee_saved.is_empty() {
            let save_bytes = backend.used_callee_saved.len() * WORD_SIZE;
            writeln!(self.out, "\tlea -{}(%rbp), %rsp", save_bytes)?;
            for &phys in backend.used_callee_saved.iter().rev() {
                writeln!(self.out, "\tpop %{}", self.config.gp_regs[phys].name(8))?;
            }
        }
        writeln!(self.out, "\tleave")?;
        writeln!(self.out, "\tret")?;

        // Jump tables collected while walking the body.
        if !self.tables.is_empty() {
            writeln!(self.out, "\t.section .rodata")?;
            let tables = std::mem::take(&mut self.tables);
            for (label, targets) in tables {
                writeln!(self.out, "\t.align 8")?;
                writeln!(self.out, "{}:", label)?;
                for target in targets {
                    writeln!(self.out, "\t.quad {}", target)?;
                }
            }
            writeln!(self.out, "\t.text")?;
        }
        Ok(())
    }

    /// Move incoming arguments into the registers or slots the
    /// allocator picked for the parameters.
    fn home_params(&mut self, backend: &FuncBackend) -> R<()> {
        let mut params: Vec<&crate::ir::VReg> =
            backend.ra.vregs.iter().filter(|v| v.param_index.is_some()).collect();
        params.sort_by_key(|v| v.param_index);

        let mut gp = 0usize;
        let mut fp = 0usize;
        let mut stack_index = 0usize;
        for vreg in params {
            let flonum = vreg.vtype.flonum;
            enum Src {
                Gp(usize),
                Fp(usize),
                Stack(usize),
            }
            let src = if flonum {
                if fp < self.config.max_freg_args() {
                    fp += 1;
                    Src::Fp(fp - 1)
                } else {
                    stack_index += 1;
                    Src::Stack(stack_index - 1)
                }
            } else if gp < self.config.max_reg_args() {
                gp += 1;
                Src::Gp(gp - 1)
            } else {
                stack_index += 1;
                Src::Stack(stack_index - 1)
            };

            let in_memory = vreg.in_memory();
            if !in_memory && vreg.phys.is_none() {
                continue; // dead parameter
            }
            match src {
                Src::Gp(i) => {
                    let src_name = self.config.arg_regs[i].name(8);
                    if in_memory {
                        writeln!(self.out, "\tmov %{}, {}(%rbp)", src_name, vreg.offset)?;
                    } else {
                        let dst = self.config.gp_regs[vreg.phys.unwrap_or(0)].name(8);
                        writeln!(self.out, "\tmov %{}, %{}", src_name, dst)?;
                    }
                }
                Src::Fp(i) => {
                    let src_name = self.config.fp_arg_regs[i].name;
                    let mnemonic = if vreg.vtype.size == 4 { "movss" } else { "movsd" };
                    if in_memory {
                        writeln!(self.out, "\t{} %{}, {}(%rbp)", mnemonic, src_name, vreg.offset)?;
                    } else {
                        let dst = self.config.fp_regs[vreg.phys.unwrap_or(0)].name;
                        writeln!(self.out, "\t{} %{}, %{}", mnemonic, src_name, dst)?;
                    }
                }
                Src::Stack(i) => {
                    let src_offset = 16 + (i * WORD_SIZE) as i64;
                    if in_memory {
                        writeln!(self.out, "\tmov {}(%rbp), %rax", src_offset)?;
                        writeln!(self.out, "\tmov %rax, {}(%rbp)", vreg.offset)?;
                    } else if flonum {
                        let dst = self.config.fp_regs[vreg.phys.unwrap_or(0)].name;
                        writeln!(self.out, "\tmovsd {}(%rbp), %{}", src_offset, dst)?;
                    } else {
                        let dst = self.config.gp_regs[vreg.phys.unwrap_or(0)].name(8);
                        writeln!(self.out, "\tmov {}(%rbp), %{}", src_offset, dst)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ---- per-op emission ----

    fn emit_ir(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        match &ir.kind {
            IrKind::Bofs { slot } => {
                let offset = backend.ra.vreg(*slot).offset;
                let dst = self.reg(backend, ir.dst.unwrap(), 8);
                writeln!(self.out, "\tlea {}(%rbp), {}", offset, dst)?;
            }
            IrKind::Iofs { label, .. } => {
                let dst = self.reg(backend, ir.dst.unwrap(), 8);
                writeln!(self.out, "\tlea {}(%rip), {}", self.name(*label), dst)?;
            }
            IrKind::Load => self.emit_load(backend, ir)?,
            IrKind::Store => self.emit_store(backend, ir)?,
            IrKind::Add | IrKind::Sub | IrKind::BitAnd | IrKind::BitOr | IrKind::BitXor => {
                self.emit_simple_bop(backend, ir)?
            }
            IrKind::Mul => self.emit_mul(backend, ir)?,
            IrKind::Div | IrKind::Mod => self.emit_divmod(backend, ir)?,
            IrKind::LShift | IrKind::RShift => self.emit_shift(backend, ir)?,
            IrKind::Cmp => self.emit_cmp(backend, ir)?,
            IrKind::Neg => {
                let dst = self.reg(backend, ir.dst.unwrap(), ir.size);
                writeln!(self.out, "\tneg{} {}", size_suffix(ir.size.max(4)), dst)?;
            }
            IrKind::BitNot => {
                let dst = self.reg(backend, ir.dst.unwrap(), ir.size);
                writeln!(self.out, "\tnot{} {}", size_suffix(ir.size.max(4)), dst)?;
            }
            IrKind::CondSet { cond } => {
                let dst = ir.dst.unwrap();
                let vreg = backend.ra.vreg(dst);
                let byte = match (vreg.phys, vreg.scratch) {
                    (Some(phys), _) => self.config.gp_regs[phys].name(1),
                    (_, Some(index)) => self.config.gp_scratch[index].name(1),
                    _ => self.config.gp_scratch[0].name(1),
                };
                let dword = self.reg(backend, dst, 4);
                writeln!(self.out, "\tset{} %{}", cond_cc(*cond), byte)?;
                writeln!(self.out, "\tmovzbl %{}, {}", byte, dword)?;
            }
            IrKind::Jmp { bb, cond } => {
                let label = self.name(backend.bb(*bb).label);
                writeln!(self.out, "\tj{} {}", cond_cc(*cond), label)?;
            }
            IrKind::TJmp { targets } => self.emit_table_jump(backend, ir, targets)?,
            IrKind::Precall { index } => self.emit_precall(backend, *index)?,
            IrKind::PushArg => self.emit_push_arg(backend, ir)?,
            IrKind::Call(info) => self.emit_call(backend, ir, info)?,
            IrKind::Result => {
                let opr1 = ir.opr1.unwrap();
                if backend.ra.vreg(opr1).vtype.flonum {
                    let mnemonic = if ir.size == 4 { "movss" } else { "movsd" };
                    let src = self.reg(backend, opr1, ir.size);
                    writeln!(self.out, "\t{} {}, %xmm0", mnemonic, src)?;
                } else {
                    let size = ir.size.max(4);
                    let acc = self.scratch(0, size);
                    let src = self.opnd(backend, opr1, size);
                    if src != acc {
                        writeln!(self.out, "\tmov{} {}, {}", size_suffix(size), src, acc)?;
                    }
                }
            }
            IrKind::Cast => self.emit_cast(backend, ir)?,
            IrKind::Mov => self.emit_mov(backend, ir)?,
            IrKind::Memcpy { size } => {
                let src = self.reg(backend, ir.opr1.unwrap(), 8);
                let dst = self.reg(backend, ir.opr2.unwrap(), 8);
                writeln!(self.out, "\tmov {}, %rsi", src)?;
                writeln!(self.out, "\tmov {}, %rdi", dst)?;
                writeln!(self.out, "\tmov ${}, %ecx", size)?;
                writeln!(self.out, "\trep movsb")?;
            }
            IrKind::Clear { size } => {
                let dst = self.reg(backend, ir.opr1.unwrap(), 8);
                writeln!(self.out, "\tmov {}, %rdi", dst)?;
                writeln!(self.out, "\tmov ${}, %ecx", size)?;
                writeln!(self.out, "\txor %eax, %eax")?;
                writeln!(self.out, "\trep stosb")?;
            }
            IrKind::Asm { template } => {
                let bytes: &[u8] = template;
                let text = String::from_utf8_lossy(bytes.strip_suffix(&[0]).unwrap_or(bytes));
                writeln!(self.out, "\t{}", text)?;
                if let Some(dst) = ir.dst {
                    let dst_name = self.reg(backend, dst, 8);
                    if dst_name != "%rax" {
                        writeln!(self.out, "\tmov %rax, {}", dst_name)?;
                    }
                }
            }
            IrKind::LoadSpilled { offset } => {
                let dst = ir.dst.unwrap();
                self.emit_load_from(backend, dst, &format!("{}(%rbp)", offset), ir.size)?;
            }
            IrKind::StoreSpilled { offset } => {
                let src = ir.opr1.unwrap();
                self.emit_store_to(backend, src, &format!("{}(%rbp)", offset), ir.size)?;
            }
        }
        Ok(())
    }

    /// Load from a memory operand, extending narrow values to 32 bits.
    fn emit_load_from(
        &mut self,
        backend: &FuncBackend,
        dst: VRegId,
        mem: &str,
        size: usize,
    ) -> R<()> {
        let vreg = backend.ra.vreg(dst);
        if vreg.vtype.flonum {
            let mnemonic = if size == 4 { "movss" } else { "movsd" };
            let dst = self.reg(backend, dst, size);
            writeln!(self.out, "\t{} {}, {}", mnemonic, mem, dst)?;
            return Ok(());
        }
        let unsigned = vreg.vtype.unsigned;
        match size {
            1 => {
                let dst = self.reg(backend, dst, 4);
                let op = if unsigned { "movzbl" } else { "movsbl" };
                writeln!(self.out, "\t{} {}, {}", op, mem, dst)?;
            }
            2 => {
                let dst = self.reg(backend, dst, 4);
                let op = if unsigned { "movzwl" } else { "movswl" };
                writeln!(self.out, "\t{} {}, {}", op, mem, dst)?;
            }
            4 => {
                let dst = self.reg(backend, dst, 4);
                writeln!(self.out, "\tmovl {}, {}", mem, dst)?;
            }
            _ => {
                let dst = self.reg(backend, dst, 8);
                writeln!(self.out, "\tmovq {}, {}", mem, dst)?;
            }
        }
        Ok(())
    }

    fn emit_store_to(
        &mut self,
        backend: &FuncBackend,
        src: VRegId,
        mem: &str,
        size: usize,
    ) -> R<()> {
        let vreg = backend.ra.vreg(src);
        if vreg.vtype.flonum {
            let mnemonic = if size == 4 { "movss" } else { "movsd" };
            let src = self.reg(backend, src, size);
            writeln!(self.out, "\t{} {}, {}", mnemonic, src, mem)?;
            return Ok(());
        }
        if vreg.flags.is_const {
            writeln!(self.out, "\tmov{} ${}, {}", size_suffix(size), vreg.fixnum, mem)?;
            return Ok(());
        }
        // True-width store needs the sub-register name.
        let name = match (vreg.phys, vreg.scratch) {
            (Some(phys), _) => self.config.gp_regs[phys].name(size),
            (_, Some(index)) => self.config.gp_scratch[index].name(size),
            _ => self.config.gp_scratch[0].name(size),
        };
        writeln!(self.out, "\tmov{} %{}, {}", size_suffix(size), name, mem)?;
        Ok(())
    }

    fn emit_load(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let addr = self.reg(backend, ir.opr1.unwrap(), 8);
        self.emit_load_from(backend, ir.dst.unwrap(), &format!("({})", addr), ir.size)
    }

    fn emit_store(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let addr = self.reg(backend, ir.opr2.unwrap(), 8);
        self.emit_store_to(backend, ir.opr1.unwrap(), &format!("({})", addr), ir.size)
    }

    fn emit_simple_bop(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let dst_id = ir.dst.unwrap();
        if backend.ra.vreg(dst_id).vtype.flonum {
            let mnemonic = match (&ir.kind, ir.size) {
                (IrKind::Add, 4) => "addss",
                (IrKind::Add, _) => "addsd",
                (IrKind::Sub, 4) => "subss",
                (IrKind::Sub, _) => "subsd",
                _ => unreachable!("bitwise op on float"),
            };
            let rhs = self.reg(backend, ir.opr2.unwrap(), ir.size);
            let dst = self.reg(backend, dst_id, ir.size);
            writeln!(self.out, "\t{} {}, {}", mnemonic, rhs, dst)?;
            return Ok(());
        }
        let mnemonic = match &ir.kind {
            IrKind::Add => "add",
            IrKind::Sub => "sub",
            IrKind::BitAnd => "and",
            IrKind::BitOr => "or",
            _ => "xor",
        };
        let size = ir.size.max(4);
        let rhs = self.bop_rhs(backend, ir.opr2.unwrap(), size)?;
        let dst = self.reg(backend, dst_id, size);
        writeln!(self.out, "\t{}{} {}, {}", mnemonic, size_suffix(size), rhs, dst)?;
        Ok(())
    }

    /// Second operand of an arithmetic op: immediate when it fits,
    /// else staged into scratch 1.
    fn bop_rhs(&mut self, backend: &FuncBackend, id: VRegId, size: usize) -> R<String> {
        let vreg = backend.ra.vreg(id);
        if vreg.flags.is_const {
            let fits = vreg.fixnum >= i32::MIN as i64 && vreg.fixnum <= i32::MAX as i64;
            if fits {
                return Ok(format!("${}", vreg.fixnum));
            }
            let name = self.scratch(1, size);
            self.move_imm(vreg.fixnum, &name, 8)?;
            return Ok(name);
        }
        Ok(self.reg(backend, id, size))
    }

    fn emit_mul(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let dst_id = ir.dst.unwrap();
        if backend.ra.vreg(dst_id).vtype.flonum {
            let mnemonic = if ir.size == 4 { "mulss" } else { "mulsd" };
            let rhs = self.reg(backend, ir.opr2.unwrap(), ir.size);
            let dst = self.reg(backend, dst_id, ir.size);
            writeln!(self.out, "\t{} {}, {}", mnemonic, rhs, dst)?;
            return Ok(());
        }
        let size = ir.size.max(4);
        let dst = self.reg(backend, dst_id, size);
        let opr2 = backend.ra.vreg(ir.opr2.unwrap());
        if opr2.flags.is_const {
            writeln!(
                self.out,
                "\timul{} ${}, {}, {}",
                size_suffix(size),
                opr2.fixnum,
                dst,
                dst
            )?;
        } else {
            let rhs = self.reg(backend, ir.opr2.unwrap(), size);
            writeln!(self.out, "\timul{} {}, {}", size_suffix(size), rhs, dst)?;
        }
        Ok(())
    }

    fn emit_divmod(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let dst_id = ir.dst.unwrap();
        if backend.ra.vreg(dst_id).vtype.flonum {
            // Only division reaches here for floats. Division is not
            // two-address-converted (the integer form uses fixed
            // registers), so establish dst == lhs here.
            let (mov, div) = if ir.size == 4 { ("movss", "divss") } else { ("movsd", "divsd") };
            let dst = self.reg(backend, dst_id, ir.size);
            let lhs = self.reg(backend, ir.opr1.unwrap(), ir.size);
            let mut rhs = self.reg(backend, ir.opr2.unwrap(), ir.size);
            if dst != lhs {
                if dst == rhs {
                    let staged = format!("%{}", self.config.fp_scratch[1].name);
                    writeln!(self.out, "\t{} {}, {}", mov, rhs, staged)?;
                    rhs = staged;
                }
                writeln!(self.out, "\t{} {}, {}", mov, lhs, dst)?;
            }
            writeln!(self.out, "\t{} {}, {}", div, rhs, dst)?;
            return Ok(());
        }
        let size = ir.size.max(4);
        let suffix = size_suffix(size);
        let unsigned = backend.ra.vreg(dst_id).vtype.unsigned;
        let acc = self.scratch(0, size);

        let lhs = self.opnd(backend, ir.opr1.unwrap(), size);
        if lhs != acc {
            writeln!(self.out, "\tmov{} {}, {}", suffix, lhs, acc)?;
        }
        let divisor = self.reg_operand(backend, ir.opr2.unwrap(), size, 1)?;
        if unsigned {
            writeln!(self.out, "\txor %edx, %edx")?;
            writeln!(self.out, "\tdiv{} {}", suffix, divisor)?;
        } else {
            writeln!(self.out, "\t{}", if size == 8 { "cqto" } else { "cltd" })?;
            writeln!(self.out, "\tidiv{} {}", suffix, divisor)?;
        }
        let result = if matches!(ir.kind, IrKind::Div) {
            self.scratch(0, size)
        } else {
            format!("%{}", if size == 8 { "rdx" } else { "edx" })
        };
        let dst = self.reg(backend, dst_id, size);
        if dst != result {
            writeln!(self.out, "\tmov{} {}, {}", suffix, result, dst)?;
        }
        Ok(())
    }

    fn emit_shift(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let dst_id = ir.dst.unwrap();
        let size = ir.size.max(4);
        let suffix = size_suffix(size);
        let unsigned = backend.ra.vreg(dst_id).vtype.unsigned;
        let mnemonic = match &ir.kind {
            IrKind::LShift => "shl",
            _ if unsigned => "shr",
            _ => "sar",
        };
        let dst = self.reg(backend, dst_id, size);
        let opr2 = backend.ra.vreg(ir.opr2.unwrap());
        if opr2.flags.is_const {
            writeln!(self.out, "\t{}{} ${}, {}", mnemonic, suffix, opr2.fixnum, dst)?;
        } else {
            let count = self.reg(backend, ir.opr2.unwrap(), 4);
            writeln!(self.out, "\tmovl {}, %ecx", count)?;
            writeln!(self.out, "\t{}{} %cl, {}", mnemonic, suffix, dst)?;
        }
        Ok(())
    }

    fn emit_cmp(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let opr1 = ir.opr1.unwrap();
        let opr2 = ir.opr2.unwrap();
        if backend.ra.vreg(opr1).vtype.flonum || backend.ra.vreg(opr2).vtype.flonum {
            let mnemonic = if ir.size == 4 { "ucomiss" } else { "ucomisd" };
            let rhs = self.reg(backend, opr2, ir.size);
            let lhs = self.reg(backend, opr1, ir.size);
            writeln!(self.out, "\t{} {}, {}", mnemonic, rhs, lhs)?;
            return Ok(());
        }
        let size = ir.size.max(4);
        let lhs = self.reg_operand(backend, opr1, size, 0)?;
        let rhs = self.bop_rhs(backend, opr2, size)?;
        writeln!(self.out, "\tcmp{} {}, {}", size_suffix(size), rhs, lhs)?;
        Ok(())
    }

    fn emit_table_jump(
        &mut self,
        backend: &FuncBackend,
        ir: &Ir,
        targets: &[crate::ir::BBId],
    ) -> R<()> {
        let label = format!(".Ltab{}", self.table_seq);
        self.table_seq += 1;
        let index = self.reg(backend, ir.opr1.unwrap(), 4);
        // Zero-extend the index, then dispatch through the table.
        writeln!(self.out, "\tmov {}, {}", index, self.scratch(1, 4))?;
        writeln!(self.out, "\tlea {}(%rip), {}", label, self.scratch(0, 8))?;
        writeln!(
            self.out,
            "\tjmp *({}, {}, 8)",
            self.scratch(0, 8),
            self.scratch(1, 8)
        )?;
        let target_labels =
            targets.iter().map(|&bb| self.name(backend.bb(bb).label)).collect();
        self.tables.push((label, target_labels));
        Ok(())
    }

    fn emit_precall(&mut self, backend: &FuncBackend, index: usize) -> R<()> {
        let info = backend.precalls[index].clone();
        for &phys in &info.living_gp {
            writeln!(self.out, "\tpush %{}", self.config.gp_regs[phys].name(8))?;
            self.stackpos += WORD_SIZE as i64;
        }
        for &phys in &info.living_fp {
            writeln!(self.out, "\tsub $8, %rsp")?;
            writeln!(self.out, "\tmovsd %{}, (%rsp)", self.config.fp_regs[phys].name)?;
            self.stackpos += WORD_SIZE as i64;
        }
        // 16-byte alignment at the call instruction.
        let arg_bytes = (info.arg_count * WORD_SIZE) as i64;
        let pad = if (self.stackpos + arg_bytes) % 16 == 8 { 0 } else { 8 };
        if pad != 0 {
            writeln!(self.out, "\tsub $8, %rsp")?;
            self.stackpos += pad;
        }
        self.precall_pads.insert(index, pad);
        Ok(())
    }

    fn emit_push_arg(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let src = ir.opr1.unwrap();
        let vreg = backend.ra.vreg(src);
        if vreg.vtype.flonum {
            let name = self.reg(backend, src, vreg.vtype.size);
            writeln!(self.out, "\tsub $8, %rsp")?;
            let mnemonic = if vreg.vtype.size == 4 { "movss" } else { "movsd" };
            writeln!(self.out, "\t{} {}, (%rsp)", mnemonic, name)?;
        } else if vreg.flags.is_const {
            let fits = vreg.fixnum >= i32::MIN as i64 && vreg.fixnum <= i32::MAX as i64;
            if fits {
                writeln!(self.out, "\tpush ${}", vreg.fixnum)?;
            } else {
                let name = self.scratch(1, 8);
                self.move_imm(vreg.fixnum, &name, 8)?;
                writeln!(self.out, "\tpush {}", name)?;
            }
        } else {
            writeln!(self.out, "\tpush {}", self.reg(backend, src, 8))?;
        }
        self.stackpos += WORD_SIZE as i64;
        Ok(())
    }

    fn emit_call(&mut self, backend: &FuncBackend, ir: &Ir, info: &crate::ir::CallInfo) -> R<()> {
        // Pop register-passed arguments, in argument order, into their
        // convention registers.
        let mut gp = 0usize;
        let mut fp = 0usize;
        for &is_float in &info.reg_args {
            if is_float {
                let name = self.config.fp_arg_regs[fp].name;
                writeln!(self.out, "\tmovsd (%rsp), %{}", name)?;
                writeln!(self.out, "\tadd $8, %rsp")?;
                fp += 1;
            } else {
                let name = self.config.arg_regs[gp].name(8);
                writeln!(self.out, "\tpop %{}", name)?;
                gp += 1;
            }
            self.stackpos -= WORD_SIZE as i64;
        }

        // Variadic calls report the number of vector arguments in al.
        let float_count = info.reg_args.iter().filter(|&&f| f).count();
        match (&info.label, ir.opr1) {
            (Some(label), _) => {
                if info.vaargs {
                    writeln!(self.out, "\tmov ${}, %eax", float_count)?;
                }
                writeln!(self.out, "\tcall {}", self.name(*label))?;
            }
            (None, Some(target)) => {
                let target_name = self.reg(backend, target, 8);
                if info.vaargs {
                    let staged = self.scratch(1, 8);
                    if target_name != staged {
                        writeln!(self.out, "\tmov {}, {}", target_name, staged)?;
                    }
                    writeln!(self.out, "\tmov ${}, %eax", float_count)?;
                    writeln!(self.out, "\tcall *{}", staged)?;
                } else {
                    writeln!(self.out, "\tcall *{}", target_name)?;
                }
            }
            (None, None) => unreachable!("indirect call without target"),
        }

        // Unwind stack arguments, padding, and saved registers.
        let pad = self.precall_pads.get(&info.precall).copied().unwrap_or(0);
        let cleanup = backend.precalls[info.precall].stack_args_size as i64 + pad;
        if cleanup > 0 {
            writeln!(self.out, "\tadd ${}, %rsp", cleanup)?;
            self.stackpos -= cleanup;
        }
        let saved = backend.precalls[info.precall].clone();
        for &phys in saved.living_fp.iter().rev() {
            writeln!(self.out, "\tmovsd (%rsp), %{}", self.config.fp_regs[phys].name)?;
            writeln!(self.out, "\tadd $8, %rsp")?;
            self.stackpos -= WORD_SIZE as i64;
        }
        for &phys in saved.living_gp.iter().rev() {
            writeln!(self.out, "\tpop %{}", self.config.gp_regs[phys].name(8))?;
            self.stackpos -= WORD_SIZE as i64;
        }

        // Fetch the result.
        if let Some(dst) = ir.dst {
            let vreg = backend.ra.vreg(dst);
            if vreg.vtype.flonum {
                let mnemonic = if vreg.vtype.size == 4 { "movss" } else { "movsd" };
                let name = self.reg(backend, dst, vreg.vtype.size);
                writeln!(self.out, "\t{} %xmm0, {}", mnemonic, name)?;
            } else {
                let size = ir.size.max(4);
                let acc = self.scratch(0, size);
                let name = self.reg(backend, dst, size);
                if name != acc {
                    writeln!(self.out, "\tmov{} {}, {}", size_suffix(size), acc, name)?;
                }
            }
        }
        Ok(())
    }

    fn emit_cast(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let dst_id = ir.dst.unwrap();
        let src_id = ir.opr1.unwrap();
        let dst = backend.ra.vreg(dst_id).vtype;
        let src = backend.ra.vreg(src_id).vtype;

        if backend.ra.vreg(src_id).flags.is_const {
            let value = backend.ra.vreg(src_id).fixnum;
            if dst.flonum {
                // Constant int to float: stage through the gp scratch.
                let gp = self.scratch(1, 8);
                self.move_imm(value, &gp, 8)?;
                let mnemonic = if dst.size == 4 { "cvtsi2ssq" } else { "cvtsi2sdq" };
                let name = self.reg(backend, dst_id, dst.size);
                writeln!(self.out, "\t{} {}, {}", mnemonic, gp, name)?;
            } else {
                let name = self.reg(backend, dst_id, dst.size);
                self.move_imm(value, &name, dst.size)?;
            }
            return Ok(());
        }

        match (src.flonum, dst.flonum) {
            (false, false) => {
                let src_name = |size: usize| {
                    let vreg = backend.ra.vreg(src_id);
                    let name = match (vreg.phys, vreg.scratch) {
                        (Some(phys), _) => self.config.gp_regs[phys].name(size),
                        (_, Some(index)) => self.config.gp_scratch[index].name(size),
                        _ => self.config.gp_scratch[0].name(size),
                    };
                    format!("%{}", name)
                };
                if dst.size >= 8 && src.size < 8 {
                    // Widen to 64 bits from the 32-bit-held value.
                    let dst_name = self.reg(backend, dst_id, 8);
                    if src.unsigned {
                        let dst32 = self.reg(backend, dst_id, 4);
                        writeln!(self.out, "\tmovl {}, {}", src_name(4), dst32)?;
                    } else {
                        writeln!(self.out, "\tmovslq {}, {}", src_name(4), dst_name)?;
                    }
                } else if dst.size >= 8 {
                    let dst_name = self.reg(backend, dst_id, 8);
                    if src_name(8) != dst_name {
                        writeln!(self.out, "\tmovq {}, {}", src_name(8), dst_name)?;
                    }
                } else if dst.size == 4 {
                    let dst_name = self.reg(backend, dst_id, 4);
                    if src_name(4) != dst_name {
                        writeln!(self.out, "\tmovl {}, {}", src_name(4), dst_name)?;
                    }
                } else {
                    // Truncate and re-extend so the 32-bit invariant
                    // holds for the narrow value.
                    let op = match (dst.size, dst.unsigned) {
                        (1, false) => "movsbl",
                        (1, true) => "movzbl",
                        (2, false) => "movswl",
                        _ => "movzwl",
                    };
                    let dst_name = self.reg(backend, dst_id, 4);
                    writeln!(self.out, "\t{} {}, {}", op, src_name(dst.size), dst_name)?;
                }
            }
            (false, true) => {
                let mnemonic = match (dst.size, src.size >= 8) {
                    (4, true) => "cvtsi2ssq",
                    (4, false) => "cvtsi2ss",
                    (_, true) => "cvtsi2sdq",
                    (_, false) => "cvtsi2sd",
                };
                let src_name = self.reg(backend, src_id, src.size.max(4));
                let dst_name = self.reg(backend, dst_id, dst.size);
                writeln!(self.out, "\t{} {}, {}", mnemonic, src_name, dst_name)?;
            }
            (true, false) => {
                let mnemonic = match (src.size, dst.size >= 8) {
                    (4, true) => "cvttss2siq",
                    (4, false) => "cvttss2si",
                    (_, true) => "cvttsd2siq",
                    (_, false) => "cvttsd2si",
                };
                let src_name = self.reg(backend, src_id, src.size);
                let dst_name = self.reg(backend, dst_id, dst.size.max(4));
                writeln!(self.out, "\t{} {}, {}", mnemonic, src_name, dst_name)?;
            }
            (true, true) => {
                let mnemonic = if dst.size == 4 { "cvtsd2ss" } else { "cvtss2sd" };
                let src_name = self.reg(backend, src_id, src.size);
                let dst_name = self.reg(backend, dst_id, dst.size);
                writeln!(self.out, "\t{} {}, {}", mnemonic, src_name, dst_name)?;
            }
        }
        Ok(())
    }

    fn emit_mov(&mut self, backend: &FuncBackend, ir: &Ir) -> R<()> {
        let dst_id = ir.dst.unwrap();
        let src_id = ir.opr1.unwrap();
        let dst_vreg = backend.ra.vreg(dst_id);
        if dst_vreg.vtype.flonum {
            let mnemonic = if dst_vreg.vtype.size == 4 { "movss" } else { "movsd" };
            let src = self.reg(backend, src_id, dst_vreg.vtype.size);
            let dst = self.reg(backend, dst_id, dst_vreg.vtype.size);
            if src != dst {
                writeln!(self.out, "\t{} {}, {}", mnemonic, src, dst)?;
            }
            return Ok(());
        }
        let size = ir.size.max(4);
        let src_vreg = backend.ra.vreg(src_id);
        let dst = self.reg(backend, dst_id, size);
        if src_vreg.flags.is_const {
            self.move_imm(src_vreg.fixnum, &dst, size)?;
            return Ok(());
        }
        let src = self.reg(backend, src_id, size);
        if src != dst {
            writeln!(self.out, "\tmov{} {}, {}", size_suffix(size), src, dst)?;
        }
        Ok(())
    }

    // ---- data sections ----

    fn emit_data(&mut self) -> R<()> {
        let globals = &self.session.scope(GLOBAL_SCOPE).vars;

        // Initialized data; compiler-introduced literals go to .rodata.
        let mut data_header_done = false;
        let mut rodata_header_done = false;
        for var in globals {
            if var.storage.is_extern || var.storage.is_typedef || var.ty.is_func() {
                continue;
            }
            let VarPlace::Global { init: Some(init), .. } = &var.place else { continue };
            let name = self.name(var.name);
            if var.literal {
                if !rodata_header_done {
                    writeln!(self.out, "\t.section .rodata")?;
                    rodata_header_done = true;
                    data_header_done = false;
                }
            } else if !data_header_done {
                writeln!(self.out, "\t.data")?;
                data_header_done = true;
                rodata_header_done = false;
            }
            let align = var.ty.align();
            if align > 1 {
                writeln!(self.out, "\t.align {}", align)?;
            }
            if !var.storage.is_static {
                writeln!(self.out, "\t.globl {}", name)?;
            }
            writeln!(self.out, "{}:", name)?;
            self.emit_init_value(&var.ty, Some(init))?;
        }

        // Uninitialized data.
        let mut bss_header_done = false;
        for var in globals {
            if var.storage.is_extern || var.storage.is_typedef || var.ty.is_func() {
                continue;
            }
            let VarPlace::Global { init: None, func_defined } = &var.place else { continue };
            if *func_defined {
                continue;
            }
            if !bss_header_done {
                writeln!(self.out, "\t.bss")?;
                bss_header_done = true;
            }
            let name = self.name(var.name);
            let align = var.ty.align();
            if align > 1 {
                writeln!(self.out, "\t.align {}", align)?;
            }
            if !var.storage.is_static {
                writeln!(self.out, "\t.globl {}", name)?;
            }
            writeln!(self.out, "{}:", name)?;
            writeln!(self.out, "\t.zero {}", var.ty.size().max(1))?;
        }
        Ok(())
    }

    fn emit_init_value(&mut self, ty: &Type, init: Option<&Initializer>) -> R<()> {
        let Some(init) = init else {
            writeln!(self.out, "\t.zero {}", ty.size().max(1))?;
            return Ok(());
        };
        match ty {
            Type::Fixnum { .. } | Type::Ptr(_) => {
                let InitKind::Single(expr) = &init.kind else {
                    writeln!(self.out, "\t.zero {}", ty.size().max(1))?;
                    return Ok(());
                };
                let rendered = render_const_expr(self.session, expr);
                let directive = match ty.size() {
                    1 => ".byte",
                    2 => ".word",
                    4 => ".long",
                    _ => ".quad",
                };
                writeln!(self.out, "\t{} {}", directive, rendered)?;
            }
            Type::Flonum(kind) => {
                let value = match &init.kind {
                    InitKind::Single(expr) => match &expr.kind {
                        ExprKind::Flonum(v) => *v,
                        ExprKind::Fixnum(v) => *v as f64,
                        _ => 0.0,
                    },
                    _ => 0.0,
                };
                match kind {
                    FlonumKind::Float => {
                        writeln!(self.out, "\t.long 0x{:08x}", (value as f32).to_bits())?;
                    }
                    FlonumKind::Double => {
                        writeln!(self.out, "\t.quad 0x{:016x}", value.to_bits())?;
                    }
                }
            }
            Type::Array { elem, len } => self.emit_array_init(elem, *len, init)?,
            Type::Struct(sref) => {
                let info = sref.info.borrow();
                let Some(info) = info.as_ref() else {
                    writeln!(self.out, "\t.zero {}", ty.size().max(1))?;
                    return Ok(());
                };
                let InitKind::Multi(items) = &init.kind else {
                    writeln!(self.out, "\t.zero {}", ty.size().max(1))?;
                    return Ok(());
                };
                let mut at = 0usize;
                for (i, member) in info.members.iter().enumerate() {
                    let item = items.get(i).and_then(|o| o.as_ref());
                    if info.is_union && item.is_none() {
                        continue;
                    }
                    if member.offset > at {
                        writeln!(self.out, "\t.zero {}", member.offset - at)?;
                        at = member.offset;
                    }
                    self.emit_init_value(&member.ty, item)?;
                    at += member.ty.size();
                    if info.is_union {
                        break;
                    }
                }
                if info.size > at {
                    writeln!(self.out, "\t.zero {}", info.size - at)?;
                }
            }
            _ => {
                writeln!(self.out, "\t.zero {}", ty.size().max(1))?;
            }
        }
        Ok(())
    }

    fn emit_array_init(&mut self, elem: &Type, len: isize, init: &Initializer) -> R<()> {
        let total = if len < 0 { 0 } else { len as usize * elem.size() };
        match &init.kind {
            InitKind::Single(expr) => {
                if let ExprKind::Str(bytes) = &expr.kind {
                    // The terminating NUL may be dropped exactly.
                    let keep = bytes.len().min(len.max(0) as usize);
                    self.emit_ascii(&bytes[..keep])?;
                    if total > keep {
                        writeln!(self.out, "\t.zero {}", total - keep)?;
                    }
                    return Ok(());
                }
                writeln!(self.out, "\t.zero {}", total.max(1))?;
            }
            InitKind::Multi(items) => {
                let mut index = 0usize;
                for item in items.iter().flatten() {
                    let (at, value) = match &item.kind {
                        InitKind::Arr { index: designated, value } => {
                            (*designated as usize, value.as_ref())
                        }
                        _ => (index, item),
                    };
                    if at > index {
                        writeln!(self.out, "\t.zero {}", (at - index) * elem.size())?;
                    }
                    self.emit_init_value(elem, Some(value))?;
                    index = at + 1;
                }
                if len > 0 && (len as usize) > index {
                    writeln!(self.out, "\t.zero {}", (len as usize - index) * elem.size())?;
                }
            }
            _ => {
                writeln!(self.out, "\t.zero {}", total.max(1))?;
            }
        }
        Ok(())
    }

    fn emit_ascii(&mut self, bytes: &[u8]) -> R<()> {
        let mut escaped = String::with_capacity(bytes.len() + 2);
        for &b in bytes {
            match b {
                b'"' => escaped.push_str("\\\""),
                b'\\' => escaped.push_str("\\\\"),
                0x20..=0x7e => escaped.push(b as char),
                _ => {
                    escaped.push('\\');
                    let _ = write!(escaped, "{:03o}", b);
                }
            }
        }
        writeln!(self.out, "\t.ascii \"{}\"", escaped)?;
        Ok(())
    }
}

/// Render a constant initializer expression: a number, a label, or a
/// label plus offset.
fn render_const_expr(session: &Session, expr: &Expr) -> String {
    match const_expr_parts(session, expr) {
        (Some(label), 0) => label,
        (Some(label), offset) if offset > 0 => format!("{} + {}", label, offset),
        (Some(label), offset) => format!("{} - {}", label, -offset),
        (None, value) => format!("{}", value),
    }
}

fn const_expr_parts(session: &Session, expr: &Expr) -> (Option<String>, i64) {
    match &expr.kind {
        ExprKind::Fixnum(value) => (None, *value),
        ExprKind::Flonum(value) => (None, *value as i64),
        ExprKind::Var { name, .. } => (Some(session.name_str(*name)), 0),
        ExprKind::Unary { op: UnOp::Ref | UnOp::Deref | UnOp::Cast, sub } => {
            const_expr_parts(session, sub)
        }
        ExprKind::Member { target, index } => {
            let (label, base) = const_expr_parts(session, target);
            let offset = target
                .ty
                .struct_ref()
                .and_then(|sref| {
                    sref.info.borrow().as_ref().map(|info| info.members[*index].offset)
                })
                .unwrap_or(0);
            (label, base + offset as i64)
        }
        ExprKind::Bop { op: BinOp::Add, lhs, rhs } => {
            let (llabel, lvalue) = const_expr_parts(session, lhs);
            let (rlabel, rvalue) = const_expr_parts(session, rhs);
            (llabel.or(rlabel), lvalue + rvalue)
        }
        ExprKind::Bop { op: BinOp::Sub, lhs, rhs } => {
            let (llabel, lvalue) = const_expr_parts(session, lhs);
            let (_, rvalue) = const_expr_parts(session, rhs);
            (llabel, lvalue - rvalue)
        }
        _ => (None, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen;
    use crate::diag::Diagnostics;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::regalloc;
    use crate::symbols::NameTable;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn compile(source: &str) -> String {
        let names = Rc::new(RefCell::new(NameTable::new()));
        let diags = Rc::new(RefCell::new(Diagnostics::new()));
        let mut lexer = Lexer::new(source, "test.c", names.clone(), diags.clone());
        let mut session = Session::new(names, diags.clone());
        let mut decls = Vec::new();
        Parser::new(&mut lexer, &mut session).parse(&mut decls).expect("parse");
        assert_eq!(diags.borrow().error_count(), 0, "unexpected diagnostics");
        let config = TargetConfig::default();
        let mut lowered = codegen::lower(&mut session, &config, &decls).expect("lower");
        for lf in &mut lowered {
            regalloc::allocate(&mut lf.backend, &config);
        }
        emit(&session, &config, &decls, &lowered).expect("emit")
    }

    #[test]
    fn test_minimal_function_shape() {
        let asm = compile("int main(void) { return 42; }");
        assert!(asm.contains("\t.text"));
        assert!(asm.contains("\t.globl main"));
        assert!(asm.contains("main:"));
        assert!(asm.contains("push %rbp"));
        assert!(asm.contains("mov %rsp, %rbp"));
        assert!(asm.contains("$42"));
        assert!(asm.contains("leave"));
        assert!(asm.trim_end().ends_with("ret") || asm.contains("\tret\n"));
    }

    #[test]
    fn test_static_function_not_global() {
        let asm = compile("static int helper(void) { return 1; } int main(void) { return helper(); }");
        assert!(!asm.contains(".globl helper"));
        assert!(asm.contains(".globl main"));
        assert!(asm.contains("call helper"));
    }

    #[test]
    fn test_global_data_directives() {
        let asm = compile(
            "char c = 7; short s = 8; int i = 9; long l = 10;\n\
             int arr[4] = {1, 2, 3, 4};\n\
             int zeroed[8];\n",
        );
        assert!(asm.contains("\t.data"));
        assert!(asm.contains("\t.byte 7"));
        assert!(asm.contains("\t.word 8"));
        assert!(asm.contains("\t.long 9"));
        assert!(asm.contains("\t.quad 10"));
        assert!(asm.contains("\t.bss"));
        assert!(asm.contains("\t.zero 32"));
    }

    #[test]
    fn test_string_literal_in_rodata() {
        let asm = compile("const char *msg(void) { return \"hi\"; }");
        assert!(asm.contains(".section .rodata"));
        assert!(asm.contains(".ascii \"hi\\000\""));
    }

    #[test]
    fn test_pointer_global_initializer() {
        let asm = compile("int g; int *p = &g; int *q = &g + 2;");
        assert!(asm.contains("\t.quad g"));
        assert!(asm.contains("\t.quad g + 8"));
    }

    #[test]
    fn test_call_emits_argument_registers() {
        let asm = compile("int add(int a, int b); int main(void) { return add(1, 2); }");
        assert!(asm.contains("pop %rdi"));
        assert!(asm.contains("pop %rsi"));
        assert!(asm.contains("call add"));
    }

    #[test]
    fn test_branching_shape() {
        let asm = compile("int f(int n) { if (n < 2) return n; return 2; }");
        // A conditional jump over the then-branch.
        assert!(asm.contains("\tcmpl $2,"));
        assert!(asm.contains("\tjge .L"));
    }

    #[test]
    fn test_designated_array_data() {
        let asm = compile("int a[] = {[2] = 7, 1, 2, [0] = 9};");
        // 9, gap, 7, 1, 2  =>  9 0 7 1 2
        let data_at = asm.find(".data").unwrap();
        let body = &asm[data_at..];
        let nine = body.find(".long 9").unwrap();
        let seven = body.find(".long 7").unwrap();
        let one = body.find(".long 1").unwrap();
        assert!(nine < seven && seven < one);
    }

    #[test]
    fn test_struct_padding_zeroed() {
        let asm = compile("struct S { char c; int i; }; struct S s = {1, 2};");
        assert!(asm.contains("\t.byte 1"));
        assert!(asm.contains("\t.zero 3"));
        assert!(asm.contains("\t.long 2"));
    }

    #[test]
    fn test_double_literal_bits() {
        let asm = compile("double d = 1.0;");
        assert!(asm.contains(".quad 0x3ff0000000000000"));
    }

    #[test]
    fn test_dense_switch_emits_table() {
        let asm = compile(
            "int f(int n) { switch (n) { case 0: return 1; case 1: return 2; \
             case 2: return 3; case 3: return 4; } return 0; }",
        );
        assert!(asm.contains("jmp *("));
        assert!(asm.contains(".Ltab0:"));
        assert!(asm.contains("\t.quad .L"));
    }

    #[test]
    fn test_stack_alignment_padding_tracked() {
        // One stack-passed argument (7 ints); cleanup must cover it.
        let asm = compile(
            "int g(int a, int b, int c, int d, int e, int f, int h);\n\
             int main(void) { return g(1, 2, 3, 4, 5, 6, 7); }",
        );
        assert!(asm.contains("pop %r9"));
        assert!(asm.contains("add $"));
    }
}
