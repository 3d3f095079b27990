//! Target configuration.
//!
//! Describes the physical register file and calling convention the
//! allocator and emitter work against. The register sets are data, not
//! constants baked into the allocator, so a different ABI (or a register
//! reserved for experiments) only touches this module.

/// A general-purpose register with its name at each operand size
/// (1, 2, 4, 8 bytes).
#[derive(Debug, Clone, Copy)]
pub struct GpReg {
    pub names: [&'static str; 4],
    pub callee_saved: bool,
}

impl GpReg {
    /// AT&T register name for an operand of `size` bytes.
    pub fn name(&self, size: usize) -> &'static str {
        match size {
            1 => self.names[0],
            2 => self.names[1],
            4 => self.names[2],
            _ => self.names[3],
        }
    }
}

/// An SSE register. One name regardless of operand size; the mnemonic
/// suffix carries the width.
#[derive(Debug, Clone, Copy)]
pub struct FpReg {
    pub name: &'static str,
}

const fn gp(names: [&'static str; 4], callee_saved: bool) -> GpReg {
    GpReg { names, callee_saved }
}

const fn fp(name: &'static str) -> FpReg {
    FpReg { name }
}

/// Register file and ABI description for one target.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub word_size: usize,

    /// Allocatable general-purpose registers, in allocation order.
    pub gp_regs: Vec<GpReg>,
    /// Two registers reserved for spill traffic and address scratch;
    /// never handed to the allocator.
    pub gp_scratch: [GpReg; 2],
    /// Integer-class argument registers, in argument order.
    pub arg_regs: Vec<GpReg>,

    /// Allocatable SSE registers, in allocation order. All caller-saved.
    pub fp_regs: Vec<FpReg>,
    /// SSE scratch pair, mirroring `gp_scratch`.
    pub fp_scratch: [FpReg; 2],
    /// Float-class argument registers, in argument order.
    pub fp_arg_regs: Vec<FpReg>,
}

impl TargetConfig {
    /// System V AMD64: six integer argument registers, eight SSE
    /// argument registers, 16-byte stack alignment at calls.
    ///
    /// `%rax`/`%r11` and `%xmm14`/`%xmm15` are kept out of the
    /// allocatable set: the emitter needs them for spill reloads,
    /// division, and jump-table dispatch.
    pub fn sysv_amd64() -> Self {
        TargetConfig {
            word_size: 8,
            gp_regs: vec![
                gp(["bl", "bx", "ebx", "rbx"], true),
                gp(["r10b", "r10w", "r10d", "r10"], false),
                gp(["r12b", "r12w", "r12d", "r12"], true),
                gp(["r13b", "r13w", "r13d", "r13"], true),
                gp(["r14b", "r14w", "r14d", "r14"], true),
                gp(["r15b", "r15w", "r15d", "r15"], true),
            ],
            gp_scratch: [
                gp(["al", "ax", "eax", "rax"], false),
                gp(["r11b", "r11w", "r11d", "r11"], false),
            ],
            arg_regs: vec![
                gp(["dil", "di", "edi", "rdi"], false),
                gp(["sil", "si", "esi", "rsi"], false),
                gp(["dl", "dx", "edx", "rdx"], false),
                gp(["cl", "cx", "ecx", "rcx"], false),
                gp(["r8b", "r8w", "r8d", "r8"], false),
                gp(["r9b", "r9w", "r9d", "r9"], false),
            ],
            fp_regs: vec![
                fp("xmm8"),
                fp("xmm9"),
                fp("xmm10"),
                fp("xmm11"),
                fp("xmm12"),
                fp("xmm13"),
            ],
            fp_scratch: [fp("xmm14"), fp("xmm15")],
            fp_arg_regs: vec![
                fp("xmm0"),
                fp("xmm1"),
                fp("xmm2"),
                fp("xmm3"),
                fp("xmm4"),
                fp("xmm5"),
                fp("xmm6"),
                fp("xmm7"),
            ],
        }
    }

    pub fn max_reg_args(&self) -> usize {
        self.arg_regs.len()
    }

    pub fn max_freg_args(&self) -> usize {
        self.fp_arg_regs.len()
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig::sysv_amd64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sized_names() {
        let config = TargetConfig::sysv_amd64();
        let rbx = &config.gp_regs[0];
        assert_eq!(rbx.name(1), "bl");
        assert_eq!(rbx.name(4), "ebx");
        assert_eq!(rbx.name(8), "rbx");
    }

    #[test]
    fn test_scratch_disjoint_from_allocatable() {
        let config = TargetConfig::sysv_amd64();
        for scratch in &config.gp_scratch {
            assert!(config.gp_regs.iter().all(|r| r.names[3] != scratch.names[3]));
        }
        for scratch in &config.fp_scratch {
            assert!(config.fp_regs.iter().all(|r| r.name != scratch.name));
        }
    }

    #[test]
    fn test_sysv_arg_counts() {
        let config = TargetConfig::sysv_amd64();
        assert_eq!(config.max_reg_args(), 6);
        assert_eq!(config.max_freg_args(), 8);
    }
}
