//! x86-64 specific code: System V ABI, instruction encoding, codegen.

pub mod codegen;
pub mod encoder;
pub mod function_buffer;

pub use codegen::CodeGenerator;
pub use encoder::{FpSize, OpSize};
pub use function_buffer::FunctionBuffer;

use crate::core::error::{JitError, JitResult};
use crate::core::register_file::{AsmReg, RegBitSet, BANK_GP, BANK_XMM};
use crate::graph::ValueType;

pub const RAX: AsmReg = AsmReg::new(BANK_GP, 0);
pub const RCX: AsmReg = AsmReg::new(BANK_GP, 1);
pub const RDX: AsmReg = AsmReg::new(BANK_GP, 2);
pub const RSP: AsmReg = AsmReg::new(BANK_GP, 4);
pub const RBP: AsmReg = AsmReg::new(BANK_GP, 5);
pub const RSI: AsmReg = AsmReg::new(BANK_GP, 6);
pub const RDI: AsmReg = AsmReg::new(BANK_GP, 7);
pub const R8: AsmReg = AsmReg::new(BANK_GP, 8);
pub const R9: AsmReg = AsmReg::new(BANK_GP, 9);
pub const R10: AsmReg = AsmReg::new(BANK_GP, 10);
pub const R11: AsmReg = AsmReg::new(BANK_GP, 11);
pub const XMM0: AsmReg = AsmReg::new(BANK_XMM, 0);

/// Scratch register for spilled general-purpose values; also the integer
/// return register. Never allocatable.
pub const GP_SCRATCH: AsmReg = RAX;
/// Scratch for spilled vector values; also the float return register.
pub const XMM_SCRATCH: AsmReg = XMM0;
/// Variable shift counts must live in CL; RCX is reserved for that.
pub const SHIFT_SCRATCH: AsmReg = RCX;

/// System V integer argument registers, in order.
pub const GP_PARAM_REGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// System V floating-point argument registers, in order.
pub const XMM_PARAM_REGS: [AsmReg; 8] = [
    AsmReg::new(BANK_XMM, 0),
    AsmReg::new(BANK_XMM, 1),
    AsmReg::new(BANK_XMM, 2),
    AsmReg::new(BANK_XMM, 3),
    AsmReg::new(BANK_XMM, 4),
    AsmReg::new(BANK_XMM, 5),
    AsmReg::new(BANK_XMM, 6),
    AsmReg::new(BANK_XMM, 7),
];

/// Registers the allocator may hand out.
///
/// Caller-saved only, so generated code never has to preserve anything:
/// RAX/RCX are scratch, RSP/RBP frame, and the callee-saved set (RBX,
/// R12-R15) is left untouched. XMM0 is the float scratch/return register.
pub fn allocatable_regs() -> RegBitSet {
    let mut set = RegBitSet::new();
    for reg in [RDX, RSI, RDI, R8, R9, R10, R11] {
        set.set(reg);
    }
    for id in 1..8 {
        set.set(AsmReg::new(BANK_XMM, id));
    }
    set
}

/// Where a declared parameter lives on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLoc {
    /// Passed in `reg`; the prologue stores it to the `home` frame offset.
    Reg { reg: AsmReg, home: i32 },
    /// Passed on the caller's stack at `[rbp + offset]`.
    Stack { offset: i32 },
}

/// Stack frame shape for one compiled function.
///
/// Layout below RBP: home slots for register-passed parameters first, then
/// 8-byte spill slots. Frame size is 16-byte aligned per the System V ABI.
#[derive(Debug)]
pub struct FrameLayout {
    params: Vec<ParamLoc>,
    slots: u32,
    spill_count: u32,
    max_spill_slots: usize,
}

impl FrameLayout {
    /// Classify `param_types` per the System V convention and lay out their
    /// home slots.
    pub fn for_params(param_types: &[ValueType], max_spill_slots: usize) -> Self {
        let mut params = Vec::with_capacity(param_types.len());
        let mut gp_count = 0;
        let mut xmm_count = 0;
        let mut stack_count = 0;
        let mut slots = 0u32;

        for &ty in param_types {
            let reg = if ty.is_float() {
                let reg = XMM_PARAM_REGS.get(xmm_count).copied();
                xmm_count += usize::from(reg.is_some());
                reg
            } else {
                let reg = GP_PARAM_REGS.get(gp_count).copied();
                gp_count += usize::from(reg.is_some());
                reg
            };

            let loc = match reg {
                Some(reg) => {
                    slots += 1;
                    ParamLoc::Reg {
                        reg,
                        home: -8 * slots as i32,
                    }
                }
                None => {
                    let offset = 16 + 8 * stack_count;
                    stack_count += 1;
                    ParamLoc::Stack { offset }
                }
            };
            params.push(loc);
        }

        Self {
            params,
            slots,
            spill_count: 0,
            max_spill_slots,
        }
    }

    pub fn param_loc(&self, index: u32) -> ParamLoc {
        self.params[index as usize]
    }

    /// Frame offset to load parameter `index` from.
    pub fn param_offset(&self, index: u32) -> i32 {
        match self.param_loc(index) {
            ParamLoc::Reg { home, .. } => home,
            ParamLoc::Stack { offset } => offset,
        }
    }

    /// Parameters that arrive in registers, for the prologue's home stores.
    pub fn register_params(&self) -> impl Iterator<Item = (u32, ParamLoc)> + '_ {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, loc)| matches!(loc, ParamLoc::Reg { .. }))
            .map(|(i, loc)| (i as u32, *loc))
    }

    /// Reserve an 8-byte spill slot, returning its frame offset.
    pub fn allocate_spill_slot(&mut self) -> JitResult<i32> {
        if self.spill_count as usize >= self.max_spill_slots {
            return Err(JitError::SpillCapacity {
                max: self.max_spill_slots,
            });
        }
        self.spill_count += 1;
        self.slots += 1;
        Ok(-8 * self.slots as i32)
    }

    pub fn spill_count(&self) -> u32 {
        self.spill_count
    }

    /// Total frame size to subtract from RSP, 16-byte aligned.
    pub fn frame_size(&self) -> u32 {
        (self.slots * 8).div_ceil(16) * 16
    }
}
