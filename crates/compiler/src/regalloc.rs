//! Linear-scan register allocation.
//!
//! Liveness comes from a backward dataflow pass over the block layout
//! (`live_in = use ∪ (live_out − def)` to a fixed point); the scan walks
//! intervals sorted by start with the active set sorted by end, evicting
//! the latest-ending interval when that frees a register for a shorter
//! newcomer. Spilled registers get frame slots and explicit reload/store
//! ops pinned to the reserved scratch registers, then a final pass
//! rewrites three-address ops into x86's two-address shape.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::TargetConfig;
use crate::ir::{FuncBackend, Ir, IrKind, VRegFlags, VRegId, WORD_SIZE};

#[derive(Debug, Clone, Copy)]
struct LiveInterval {
    vreg: VRegId,
    start: usize,
    end: usize,
    flonum: bool,
}

/// Allocate physical registers for one lowered function, insert spill
/// code, and rewrite to two-address form.
pub fn allocate(backend: &mut FuncBackend, config: &TargetConfig) {
    let intervals = build_intervals(backend);
    run_linear_scan(backend, config, &intervals);
    assign_frame_offsets(backend, config);
    record_living_registers(backend, config, &intervals);
    insert_spill_code(backend);
    convert_3to2(backend);
    collect_callee_saved(backend, config);
    debug!(
        vregs = backend.ra.len(),
        spilled = backend.ra.vregs.iter().filter(|v| v.flags.spilled).count(),
        frame = backend.frame_size,
        "allocated"
    );
}

/// Operand uses of an op (reads). The slot of a `Bofs` is an address
/// constant, not a register read.
fn ir_uses(ir: &Ir) -> impl Iterator<Item = VRegId> + '_ {
    [ir.opr1, ir.opr2].into_iter().flatten()
}

fn is_allocatable(backend: &FuncBackend, id: VRegId) -> bool {
    let vreg = backend.ra.vreg(id);
    !vreg.flags.is_const && !vreg.flags.ref_taken && !vreg.vtype.non_reg
}

/// Global instruction numbering: (position of bb in layout, bounds).
fn number_irs(backend: &FuncBackend) -> (Vec<(usize, usize)>, usize) {
    let mut bounds = Vec::with_capacity(backend.order.len());
    let mut counter = 0usize;
    for &bbid in &backend.order {
        let len = backend.bb(bbid).irs.len();
        bounds.push((counter, counter + len));
        counter += len.max(1);
    }
    (bounds, counter)
}

fn build_intervals(backend: &FuncBackend) -> Vec<LiveInterval> {
    let nblocks = backend.order.len();
    let (bounds, _total) = number_irs(backend);

    // Per-block use (read before any write) and def sets.
    let mut use_sets: Vec<HashSet<VRegId>> = vec![HashSet::new(); nblocks];
    let mut def_sets: Vec<HashSet<VRegId>> = vec![HashSet::new(); nblocks];
    for (pos, &bbid) in backend.order.iter().enumerate() {
        for ir in &backend.bb(bbid).irs {
            for used in ir_uses(ir) {
                if is_allocatable(backend, used) && !def_sets[pos].contains(&used) {
                    use_sets[pos].insert(used);
                }
            }
            if let Some(dst) = ir.dst {
                if is_allocatable(backend, dst) {
                    def_sets[pos].insert(dst);
                }
            }
        }
    }

    // live_in = use ∪ (live_out − def), to a fixed point.
    let mut live_in: Vec<HashSet<VRegId>> = vec![HashSet::new(); nblocks];
    let mut live_out: Vec<HashSet<VRegId>> = vec![HashSet::new(); nblocks];
    loop {
        let mut changed = false;
        for pos in (0..nblocks).rev() {
            let mut out = HashSet::new();
            for succ in backend.successors(pos) {
                if let Some(spos) = backend.order.iter().position(|&b| b == succ) {
                    out.extend(live_in[spos].iter().copied());
                }
            }
            let mut inn = use_sets[pos].clone();
            for &v in &out {
                if !def_sets[pos].contains(&v) {
                    inn.insert(v);
                }
            }
            if out != live_out[pos] || inn != live_in[pos] {
                live_out[pos] = out;
                live_in[pos] = inn;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Collapse to one interval per register.
    let mut starts: HashMap<VRegId, usize> = HashMap::new();
    let mut ends: HashMap<VRegId, usize> = HashMap::new();
    let mut touch = |id: VRegId, at: usize| {
        starts.entry(id).and_modify(|s| *s = (*s).min(at)).or_insert(at);
        ends.entry(id).and_modify(|e| *e = (*e).max(at)).or_insert(at);
    };
    for (pos, &bbid) in backend.order.iter().enumerate() {
        let (first, last) = bounds[pos];
        let last = last.saturating_sub(1).max(first);
        for (offset, ir) in backend.bb(bbid).irs.iter().enumerate() {
            let at = first + offset;
            for used in ir_uses(ir) {
                if is_allocatable(backend, used) {
                    touch(used, at);
                }
            }
            if let Some(dst) = ir.dst {
                if is_allocatable(backend, dst) {
                    touch(dst, at);
                }
            }
        }
        for &v in &live_in[pos] {
            touch(v, first);
        }
        for &v in &live_out[pos] {
            touch(v, last);
        }
    }

    let mut intervals: Vec<LiveInterval> = starts
        .into_iter()
        .map(|(vreg, start)| {
            // Parameters are defined by the prologue.
            let start = if backend.ra.vreg(vreg).flags.param { 0 } else { start };
            LiveInterval {
                vreg,
                start,
                end: ends[&vreg],
                flonum: backend.ra.vreg(vreg).vtype.flonum,
            }
        })
        .collect();
    intervals.sort_by_key(|iv| (iv.start, iv.end));
    intervals
}

fn run_linear_scan(backend: &mut FuncBackend, config: &TargetConfig, intervals: &[LiveInterval]) {
    scan_class(backend, intervals, false, config.gp_regs.len());
    scan_class(backend, intervals, true, config.fp_regs.len());
}

fn scan_class(backend: &mut FuncBackend, intervals: &[LiveInterval], flonum: bool, nregs: usize) {
    // Active intervals sorted by end.
    let mut active: Vec<LiveInterval> = Vec::new();
    let mut free: Vec<usize> = (0..nregs).rev().collect();

    for &interval in intervals.iter().filter(|iv| iv.flonum == flonum) {
        active.retain(|done| {
            if done.end < interval.start {
                if let Some(phys) = backend.ra.vreg(done.vreg).phys {
                    free.push(phys);
                }
                false
            } else {
                true
            }
        });

        if let Some(phys) = free.pop() {
            backend.ra.vreg_mut(interval.vreg).phys = Some(phys);
        } else {
            // Evict the latest-ending active interval when the newcomer
            // finishes sooner; otherwise spill the newcomer.
            let victim_pos = active
                .iter()
                .enumerate()
                .max_by_key(|(_, iv)| iv.end)
                .map(|(i, _)| i);
            match victim_pos {
                Some(pos) if active[pos].end > interval.end => {
                    let victim = active.remove(pos);
                    let phys = backend.ra.vreg(victim.vreg).phys;
                    backend.ra.vreg_mut(victim.vreg).phys = None;
                    backend.ra.vreg_mut(victim.vreg).flags.spilled = true;
                    backend.ra.vreg_mut(interval.vreg).phys = phys;
                }
                _ => {
                    backend.ra.vreg_mut(interval.vreg).flags.spilled = true;
                    continue;
                }
            }
        }
        let pos = active.partition_point(|iv| iv.end <= interval.end);
        active.insert(pos, interval);
    }
}

/// Frame slots below the callee-save area: first the memory-bound
/// variables (address-taken and aggregates), then spill slots.
fn assign_frame_offsets(backend: &mut FuncBackend, config: &TargetConfig) {
    // The callee-save pushes sit right under the saved base pointer;
    // count them first so the slots land below. Only general-purpose
    // registers are callee-saved; the SSE class is all caller-saved.
    let saves = backend
        .ra
        .vregs
        .iter()
        .filter(|v| !v.vtype.flonum)
        .filter_map(|v| v.phys)
        .filter(|&phys| config.gp_regs[phys].callee_saved)
        .collect::<HashSet<_>>()
        .len();
    let save_bytes = (saves * WORD_SIZE) as i64;

    let mut frame: i64 = 0;
    for vreg in backend.ra.vregs.iter_mut() {
        let memory_var = (vreg.flags.ref_taken || vreg.vtype.non_reg) && !vreg.flags.is_const;
        if memory_var {
            let align = vreg.vtype.align.max(1) as i64;
            frame = (frame + vreg.vtype.size as i64 + align - 1) / align * align;
            vreg.offset = -(save_bytes + frame);
        }
    }
    for vreg in backend.ra.vregs.iter_mut() {
        if vreg.flags.spilled {
            frame += WORD_SIZE as i64;
            vreg.offset = -(save_bytes + frame);
        }
    }
    backend.frame_size = (frame + 15) / 16 * 16;
}

/// For each precall, the caller-saved registers carrying values that
/// survive the call.
fn record_living_registers(
    backend: &mut FuncBackend,
    config: &TargetConfig,
    intervals: &[LiveInterval],
) {
    // Map each precall to its (precall, call) instruction positions.
    let (bounds, _) = number_irs(backend);
    let mut spans: HashMap<usize, (usize, usize)> = HashMap::new();
    for (pos, &bbid) in backend.order.iter().enumerate() {
        for (offset, ir) in backend.bb(bbid).irs.iter().enumerate() {
            let at = bounds[pos].0 + offset;
            match &ir.kind {
                IrKind::Precall { index } => {
                    spans.entry(*index).or_insert((at, at)).0 = at;
                }
                IrKind::Call(info) => {
                    spans.entry(info.precall).or_insert((at, at)).1 = at;
                }
                _ => {}
            }
        }
    }

    for (index, (precall_at, call_at)) in spans {
        let mut living_gp = Vec::new();
        let mut living_fp = Vec::new();
        for interval in intervals {
            if interval.start > precall_at || interval.end <= call_at {
                continue;
            }
            let vreg = backend.ra.vreg(interval.vreg);
            let Some(phys) = vreg.phys else { continue };
            if vreg.vtype.flonum {
                living_fp.push(phys);
            } else if !config.gp_regs[phys].callee_saved {
                living_gp.push(phys);
            }
        }
        living_gp.sort_unstable();
        living_gp.dedup();
        living_fp.sort_unstable();
        living_fp.dedup();
        let info = &mut backend.precalls[index];
        info.living_gp = living_gp;
        info.living_fp = living_fp;
    }
}

/// Rewrite ops touching spilled registers to go through the reserved
/// scratch registers, with an explicit reload before and store after.
fn insert_spill_code(backend: &mut FuncBackend) {
    let order = backend.order.clone();
    for bbid in order {
        let irs = std::mem::take(&mut backend.bb_mut(bbid).irs);
        let mut out = Vec::with_capacity(irs.len());
        for mut ir in irs {
            // Reload opr1 into scratch 0, opr2 into scratch 1.
            if let Some(opr1) = ir.opr1 {
                if backend.ra.vreg(opr1).flags.spilled {
                    let tmp = scratch_twin(backend, opr1, 0);
                    let offset = backend.ra.vreg(opr1).offset;
                    let size = backend.ra.vreg(opr1).vtype.size;
                    out.push(
                        Ir::new(IrKind::LoadSpilled { offset }, size).with_dst(tmp),
                    );
                    ir.opr1 = Some(tmp);
                }
            }
            if let Some(opr2) = ir.opr2 {
                if backend.ra.vreg(opr2).flags.spilled {
                    let tmp = scratch_twin(backend, opr2, 1);
                    let offset = backend.ra.vreg(opr2).offset;
                    let size = backend.ra.vreg(opr2).vtype.size;
                    out.push(
                        Ir::new(IrKind::LoadSpilled { offset }, size).with_dst(tmp),
                    );
                    ir.opr2 = Some(tmp);
                }
            }
            let mut store_after: Option<Ir> = None;
            if let Some(dst) = ir.dst {
                if backend.ra.vreg(dst).flags.spilled {
                    let tmp = scratch_twin(backend, dst, 0);
                    let offset = backend.ra.vreg(dst).offset;
                    let size = backend.ra.vreg(dst).vtype.size;
                    ir.dst = Some(tmp);
                    store_after =
                        Some(Ir::new(IrKind::StoreSpilled { offset }, size).with_opr1(tmp));
                }
            }
            out.push(ir);
            if let Some(store) = store_after {
                out.push(store);
            }
        }
        backend.bb_mut(bbid).irs = out;
    }
}

/// A fresh register with the same shape as `of`, pinned to scratch
/// register `index` of its class.
fn scratch_twin(backend: &mut FuncBackend, of: VRegId, index: usize) -> VRegId {
    let vtype = backend.ra.vreg(of).vtype;
    let flags = VRegFlags { no_spill: true, ..VRegFlags::default() };
    let id = backend.ra.new_vreg(vtype, flags);
    backend.ra.vreg_mut(id).scratch = Some(index);
    id
}

/// Same physical location (register class + number or scratch pin)?
fn same_loc(backend: &FuncBackend, a: VRegId, b: VRegId) -> bool {
    if a == b {
        return true;
    }
    let ra = backend.ra.vreg(a);
    let rb = backend.ra.vreg(b);
    if ra.vtype.flonum != rb.vtype.flonum {
        return false;
    }
    match ((ra.phys, ra.scratch), (rb.phys, rb.scratch)) {
        ((Some(pa), _), (Some(pb), _)) => pa == pb,
        ((_, Some(sa)), (_, Some(sb))) => sa == sb,
        _ => false,
    }
}

/// x86 binary ops want `dst == opr1`; insert the move where the
/// allocator chose different registers. Division and modulo go through
/// fixed registers in the emitter and are left alone.
fn convert_3to2(backend: &mut FuncBackend) {
    let order = backend.order.clone();
    for bbid in order {
        let irs = std::mem::take(&mut backend.bb_mut(bbid).irs);
        let mut out = Vec::with_capacity(irs.len());
        for mut ir in irs {
            let two_addr = matches!(
                ir.kind,
                IrKind::Add
                    | IrKind::Sub
                    | IrKind::Mul
                    | IrKind::BitAnd
                    | IrKind::BitOr
                    | IrKind::BitXor
                    | IrKind::LShift
                    | IrKind::RShift
                    | IrKind::Neg
                    | IrKind::BitNot
            );
            if two_addr {
                let dst = ir.dst.expect("two-address op without dst");
                let opr1 = ir.opr1.expect("two-address op without opr1");
                if !same_loc(backend, dst, opr1) {
                    if let Some(opr2) = ir.opr2 {
                        if same_loc(backend, dst, opr2) {
                            // The move would clobber opr2; stage it
                            // through scratch 1 first.
                            let tmp = scratch_twin(backend, opr2, 1);
                            let size = ir.size;
                            out.push(
                                Ir::new(IrKind::Mov, size).with_dst(tmp).with_opr1(opr2),
                            );
                            ir.opr2 = Some(tmp);
                        }
                    }
                    out.push(Ir::new(IrKind::Mov, ir.size).with_dst(dst).with_opr1(opr1));
                    ir.opr1 = Some(dst);
                }
            }
            out.push(ir);
        }
        backend.bb_mut(bbid).irs = out;
    }
}

fn collect_callee_saved(backend: &mut FuncBackend, config: &TargetConfig) {
    let mut used: Vec<usize> = backend
        .ra
        .vregs
        .iter()
        .filter(|v| !v.vtype.flonum)
        .filter_map(|v| v.phys)
        .filter(|&phys| config.gp_regs[phys].callee_saved)
        .collect();
    used.sort_unstable();
    used.dedup();
    backend.used_callee_saved = used;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Declaration;
    use crate::codegen;
    use crate::config::TargetConfig;
    use crate::diag::Diagnostics;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::symbols::{NameTable, Session};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn allocate_source(source: &str) -> Vec<FuncBackend> {
        let names = Rc::new(RefCell::new(NameTable::new()));
        let diags = Rc::new(RefCell::new(Diagnostics::new()));
        let mut lexer = Lexer::new(source, "test.c", names.clone(), diags.clone());
        let mut session = Session::new(names, diags.clone());
        let mut decls: Vec<Declaration> = Vec::new();
        Parser::new(&mut lexer, &mut session).parse(&mut decls).expect("parse");
        assert_eq!(diags.borrow().error_count(), 0);
        let config = TargetConfig::default();
        let lowered = codegen::lower(&mut session, &config, &decls).expect("lower");
        lowered
            .into_iter()
            .map(|mut lf| {
                allocate(&mut lf.backend, &config);
                lf.backend
            })
            .collect()
    }

    /// Every register an op touches after allocation has a physical
    /// register, a scratch pin, a constant, or a stack slot.
    #[test]
    fn test_all_operands_located() {
        let backends = allocate_source(
            "int f(int a, int b) { int c = a * b; int d = c + a; return d - b; }",
        );
        for backend in &backends {
            for &bbid in &backend.order {
                for ir in &backend.bb(bbid).irs {
                    for id in [ir.dst, ir.opr1, ir.opr2].into_iter().flatten() {
                        let vreg = backend.ra.vreg(id);
                        let located = vreg.phys.is_some()
                            || vreg.scratch.is_some()
                            || vreg.flags.is_const
                            || vreg.in_memory();
                        assert!(located, "unlocated vreg {:?}", id);
                    }
                }
            }
        }
    }

    #[test]
    fn test_high_pressure_spills() {
        // More simultaneously-live values than allocatable registers.
        let source = "int f(int a) {\
            int v0=a+1; int v1=a+2; int v2=a+3; int v3=a+4; int v4=a+5;\
            int v5=a+6; int v6=a+7; int v7=a+8; int v8=a+9; int v9=a+10;\
            return v0+v1+v2+v3+v4+v5+v6+v7+v8+v9; }";
        let backends = allocate_source(source);
        let spilled = backends[0].ra.vregs.iter().filter(|v| v.flags.spilled).count();
        assert!(spilled > 0, "expected spills under register pressure");
        // Spill traffic was materialized.
        let mut reloads = 0;
        for &bbid in &backends[0].order {
            for ir in &backends[0].bb(bbid).irs {
                if matches!(ir.kind, IrKind::LoadSpilled { .. }) {
                    reloads += 1;
                }
            }
        }
        assert!(reloads > 0);
    }

    #[test]
    fn test_two_address_form() {
        let backends = allocate_source("int f(int a, int b) { return a + b * 2; }");
        for backend in &backends {
            for &bbid in &backend.order {
                for ir in &backend.bb(bbid).irs {
                    if matches!(
                        ir.kind,
                        IrKind::Add | IrKind::Sub | IrKind::Mul | IrKind::BitAnd
                    ) {
                        let dst = ir.dst.unwrap();
                        let opr1 = ir.opr1.unwrap();
                        assert!(same_loc(backend, dst, opr1), "not two-address: {:?}", ir);
                    }
                }
            }
        }
    }

    #[test]
    fn test_frame_size_aligned() {
        let backends = allocate_source(
            "int f(void) { int arr[10]; int *p = arr; return p[3]; }",
        );
        assert_eq!(backends[0].frame_size % 16, 0);
        assert!(backends[0].frame_size >= 40);
    }

    #[test]
    fn test_address_taken_never_in_register() {
        let backends =
            allocate_source("int f(void) { int x = 3; int *p = &x; *p = 5; return x; }");
        for vreg in &backends[0].ra.vregs {
            if vreg.flags.ref_taken {
                assert!(vreg.phys.is_none());
                assert!(vreg.offset != 0);
            }
        }
    }
}
