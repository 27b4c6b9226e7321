//! x86-64 instruction encoding.
//!
//! Direct machine code generation, no external assembler dependency.
//! Every method writes through the [`CodeBuffer`] emission primitives;
//! operands whose target offset is not yet known (jumps, RIP-relative
//! constants) go through `emit_call_site` and are resolved by the final
//! patch pass, so encoders never compute distances themselves.
//!
//! ## Instruction format
//!
//! ```text
//! [Legacy prefix] [REX] [Opcode] [ModR/M] [Disp] [Imm]
//! ```
//!
//! Memory operands are always RBP-relative (frame slots) or RIP-relative
//! (constant pool); no SIB forms are needed.

use crate::core::code_buffer::CodeBuffer;
use crate::core::error::JitResult;
use crate::core::jump_table::Label;
use crate::core::register_file::AsmReg;

/// Integer operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    Dword,
    Qword,
}

impl OpSize {
    fn rex_w(self) -> bool {
        self == OpSize::Qword
    }
}

/// Scalar floating-point width, determining the mandatory SSE prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpSize {
    Single,
    Double,
}

impl FpSize {
    fn prefix(self) -> u8 {
        match self {
            FpSize::Single => 0xf3,
            FpSize::Double => 0xf2,
        }
    }
}

/// Two-operand integer ALU operations, encoded in their "dst in reg field"
/// form so register and memory sources share one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
}

impl AluOp {
    /// Opcode for `op r, r/m`.
    fn rm_opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x03,
            AluOp::Or => 0x0b,
            AluOp::And => 0x23,
            AluOp::Sub => 0x2b,
            AluOp::Xor => 0x33,
        }
    }

    /// Opcode extension for the `81 /n` immediate form.
    fn imm_ext(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
        }
    }
}

/// Scalar SSE arithmetic opcodes (`0F xx` after the size prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Add,
    Mul,
    Sub,
    Div,
}

impl FpOp {
    fn opcode(self) -> u8 {
        match self {
            FpOp::Add => 0x58,
            FpOp::Mul => 0x59,
            FpOp::Sub => 0x5c,
            FpOp::Div => 0x5e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Shl,
    /// Logical right shift (unsigned).
    Shr,
    /// Arithmetic right shift (signed).
    Sar,
}

impl ShiftKind {
    fn ext(self) -> u8 {
        match self {
            ShiftKind::Shl => 4,
            ShiftKind::Shr => 5,
            ShiftKind::Sar => 7,
        }
    }
}

/// REX prefix byte, emitted only when a bit is set.
fn rex(w: bool, r: bool, b: bool) -> Option<u8> {
    if w || r || b {
        Some(0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | u8::from(b))
    } else {
        None
    }
}

/// ModR/M for register-to-register (mod = 11).
fn modrm_rr(reg: AsmReg, rm: AsmReg) -> u8 {
    0xc0 | (reg.low_bits() << 3) | rm.low_bits()
}

/// ModR/M for register with opcode extension (mod = 11).
fn modrm_ext(ext: u8, rm: AsmReg) -> u8 {
    0xc0 | (ext << 3) | rm.low_bits()
}

impl CodeBuffer {
    fn emit_opt(&mut self, byte: Option<u8>) -> JitResult<()> {
        match byte {
            Some(b) => self.emit8(b),
            None => Ok(()),
        }
    }

    /// Opcode bytes + ModR/M for a register pair, with REX as needed.
    fn gp_op(&mut self, opcodes: &[u8], w: bool, reg: AsmReg, rm: AsmReg) -> JitResult<()> {
        self.emit_opt(rex(w, reg.needs_rex_ext(), rm.needs_rex_ext()))?;
        self.emit_bytes(opcodes)?;
        self.emit8(modrm_rr(reg, rm))
    }

    /// Opcode bytes + ModR/M for an `[rbp + disp]` memory operand.
    fn gp_op_mem(&mut self, opcodes: &[u8], w: bool, reg: AsmReg, disp: i32) -> JitResult<()> {
        self.emit_opt(rex(w, reg.needs_rex_ext(), false))?;
        self.emit_bytes(opcodes)?;
        if let Ok(d8) = i8::try_from(disp) {
            self.emit8(0x40 | (reg.low_bits() << 3) | 0x05)?;
            self.emit_value(d8)
        } else {
            self.emit8(0x80 | (reg.low_bits() << 3) | 0x05)?;
            self.emit_value(disp)
        }
    }

    /// SSE opcode with register operands: `[prefix] [REX] 0F op /r`.
    fn sse_op(
        &mut self,
        prefix: Option<u8>,
        w: bool,
        opcode: u8,
        reg: AsmReg,
        rm: AsmReg,
    ) -> JitResult<()> {
        self.emit_opt(prefix)?;
        self.emit_opt(rex(w, reg.needs_rex_ext(), rm.needs_rex_ext()))?;
        self.emit8(0x0f)?;
        self.emit8(opcode)?;
        self.emit8(modrm_rr(reg, rm))
    }

    fn sse_op_mem(
        &mut self,
        prefix: Option<u8>,
        opcode: u8,
        reg: AsmReg,
        disp: i32,
    ) -> JitResult<()> {
        self.emit_opt(prefix)?;
        self.emit_opt(rex(false, reg.needs_rex_ext(), false))?;
        self.emit8(0x0f)?;
        self.emit8(opcode)?;
        if let Ok(d8) = i8::try_from(disp) {
            self.emit8(0x40 | (reg.low_bits() << 3) | 0x05)?;
            self.emit_value(d8)
        } else {
            self.emit8(0x80 | (reg.low_bits() << 3) | 0x05)?;
            self.emit_value(disp)
        }
    }

    /// SSE opcode with a RIP-relative memory operand referencing `label`.
    /// The 4-byte displacement is a call site patched at finalize.
    fn sse_op_rip(
        &mut self,
        prefix: Option<u8>,
        opcode: u8,
        reg: AsmReg,
        label: Label,
    ) -> JitResult<()> {
        self.emit_opt(prefix)?;
        self.emit_opt(rex(false, reg.needs_rex_ext(), false))?;
        self.emit8(0x0f)?;
        self.emit8(opcode)?;
        self.emit8((reg.low_bits() << 3) | 0x05)?;
        self.emit_call_site(label, 4)
    }

    // ==================== Data movement ====================

    /// MOV r, imm. Chooses the shortest encoding that holds the value.
    pub fn mov_ri(&mut self, dst: AsmReg, imm: i64, size: OpSize) -> JitResult<()> {
        match size {
            OpSize::Dword => {
                self.emit_opt(rex(false, false, dst.needs_rex_ext()))?;
                self.emit8(0xb8 + dst.low_bits())?;
                self.emit32(imm as u32)
            }
            OpSize::Qword => {
                if let Ok(imm32) = i32::try_from(imm) {
                    self.emit_opt(rex(true, false, dst.needs_rex_ext()))?;
                    self.emit8(0xc7)?;
                    self.emit8(modrm_ext(0, dst))?;
                    self.emit_value(imm32)
                } else {
                    // movabs
                    self.emit_opt(rex(true, false, dst.needs_rex_ext()))?;
                    self.emit8(0xb8 + dst.low_bits())?;
                    self.emit64(imm as u64)
                }
            }
        }
    }

    /// MOV r, r.
    pub fn mov_rr(&mut self, dst: AsmReg, src: AsmReg, size: OpSize) -> JitResult<()> {
        self.gp_op(&[0x8b], size.rex_w(), dst, src)
    }

    /// MOV r32, r32: truncates, zero-extending the upper half.
    pub fn mov_rr32(&mut self, dst: AsmReg, src: AsmReg) -> JitResult<()> {
        self.gp_op(&[0x8b], false, dst, src)
    }

    /// MOV r, [rbp + disp].
    pub fn mov_load(&mut self, dst: AsmReg, disp: i32, size: OpSize) -> JitResult<()> {
        self.gp_op_mem(&[0x8b], size.rex_w(), dst, disp)
    }

    /// MOV [rbp + disp], r.
    pub fn mov_store(&mut self, disp: i32, src: AsmReg, size: OpSize) -> JitResult<()> {
        self.gp_op_mem(&[0x89], size.rex_w(), src, disp)
    }

    /// MOVSXD r64, r32 (sign-extend).
    pub fn movsxd(&mut self, dst: AsmReg, src: AsmReg) -> JitResult<()> {
        self.gp_op(&[0x63], true, dst, src)
    }

    // ==================== Integer arithmetic ====================

    /// ALU op, register source.
    pub fn alu_rr(&mut self, op: AluOp, dst: AsmReg, src: AsmReg, size: OpSize) -> JitResult<()> {
        self.gp_op(&[op.rm_opcode()], size.rex_w(), dst, src)
    }

    /// ALU op, `[rbp + disp]` source.
    pub fn alu_mem(&mut self, op: AluOp, dst: AsmReg, disp: i32, size: OpSize) -> JitResult<()> {
        self.gp_op_mem(&[op.rm_opcode()], size.rex_w(), dst, disp)
    }

    /// ALU op, sign-extended imm32 source (`81 /n`).
    pub fn alu_ri(&mut self, op: AluOp, dst: AsmReg, imm: i32, size: OpSize) -> JitResult<()> {
        self.emit_opt(rex(size.rex_w(), false, dst.needs_rex_ext()))?;
        self.emit8(0x81)?;
        self.emit8(modrm_ext(op.imm_ext(), dst))?;
        self.emit_value(imm)
    }

    /// IMUL r, r (`0F AF /r`).
    pub fn imul_rr(&mut self, dst: AsmReg, src: AsmReg, size: OpSize) -> JitResult<()> {
        self.gp_op(&[0x0f, 0xaf], size.rex_w(), dst, src)
    }

    /// IMUL r, [rbp + disp].
    pub fn imul_mem(&mut self, dst: AsmReg, disp: i32, size: OpSize) -> JitResult<()> {
        self.gp_op_mem(&[0x0f, 0xaf], size.rex_w(), dst, disp)
    }

    /// IMUL r, r, imm32 (`69 /r`).
    pub fn imul_ri(&mut self, dst: AsmReg, imm: i32, size: OpSize) -> JitResult<()> {
        self.emit_opt(rex(
            size.rex_w(),
            dst.needs_rex_ext(),
            dst.needs_rex_ext(),
        ))?;
        self.emit8(0x69)?;
        self.emit8(modrm_rr(dst, dst))?;
        self.emit_value(imm)
    }

    /// NEG r (`F7 /3`).
    pub fn neg(&mut self, dst: AsmReg, size: OpSize) -> JitResult<()> {
        self.emit_opt(rex(size.rex_w(), false, dst.needs_rex_ext()))?;
        self.emit8(0xf7)?;
        self.emit8(modrm_ext(3, dst))
    }

    /// NOT r (`F7 /2`).
    pub fn not(&mut self, dst: AsmReg, size: OpSize) -> JitResult<()> {
        self.emit_opt(rex(size.rex_w(), false, dst.needs_rex_ext()))?;
        self.emit8(0xf7)?;
        self.emit8(modrm_ext(2, dst))
    }

    /// Shift by CL (`D3 /n`).
    pub fn shift_cl(&mut self, kind: ShiftKind, dst: AsmReg, size: OpSize) -> JitResult<()> {
        self.emit_opt(rex(size.rex_w(), false, dst.needs_rex_ext()))?;
        self.emit8(0xd3)?;
        self.emit8(modrm_ext(kind.ext(), dst))
    }

    /// Shift by immediate (`C1 /n ib`).
    pub fn shift_imm(
        &mut self,
        kind: ShiftKind,
        dst: AsmReg,
        count: u8,
        size: OpSize,
    ) -> JitResult<()> {
        self.emit_opt(rex(size.rex_w(), false, dst.needs_rex_ext()))?;
        self.emit8(0xc1)?;
        self.emit8(modrm_ext(kind.ext(), dst))?;
        self.emit8(count & 0x3f)
    }

    // ==================== Scalar SSE ====================

    /// MOVSS/MOVSD xmm, xmm.
    pub fn fp_mov_rr(&mut self, dst: AsmReg, src: AsmReg, fsize: FpSize) -> JitResult<()> {
        self.sse_op(Some(fsize.prefix()), false, 0x10, dst, src)
    }

    /// MOVSS/MOVSD xmm, [rbp + disp].
    pub fn fp_load(&mut self, dst: AsmReg, disp: i32, fsize: FpSize) -> JitResult<()> {
        self.sse_op_mem(Some(fsize.prefix()), 0x10, dst, disp)
    }

    /// MOVSS/MOVSD [rbp + disp], xmm.
    pub fn fp_store(&mut self, disp: i32, src: AsmReg, fsize: FpSize) -> JitResult<()> {
        self.sse_op_mem(Some(fsize.prefix()), 0x11, src, disp)
    }

    /// MOVSS/MOVSD xmm, [rip + label].
    pub fn fp_load_rip(&mut self, dst: AsmReg, label: Label, fsize: FpSize) -> JitResult<()> {
        self.sse_op_rip(Some(fsize.prefix()), 0x10, dst, label)
    }

    /// ADDSD/SUBSD/MULSD/DIVSD (and SS forms), register source.
    pub fn fp_alu_rr(&mut self, op: FpOp, dst: AsmReg, src: AsmReg, fsize: FpSize) -> JitResult<()> {
        self.sse_op(Some(fsize.prefix()), false, op.opcode(), dst, src)
    }

    /// FP ALU with `[rbp + disp]` source.
    pub fn fp_alu_mem(&mut self, op: FpOp, dst: AsmReg, disp: i32, fsize: FpSize) -> JitResult<()> {
        self.sse_op_mem(Some(fsize.prefix()), op.opcode(), dst, disp)
    }

    /// FP ALU with `[rip + label]` source.
    pub fn fp_alu_rip(&mut self, op: FpOp, dst: AsmReg, label: Label, fsize: FpSize) -> JitResult<()> {
        self.sse_op_rip(Some(fsize.prefix()), op.opcode(), dst, label)
    }

    /// XORPS/XORPD xmm, [rip + label]. The memory operand must be 16-byte
    /// aligned; used for sign-mask negation.
    pub fn xorp_rip(&mut self, dst: AsmReg, label: Label, fsize: FpSize) -> JitResult<()> {
        let prefix = match fsize {
            FpSize::Single => None,
            FpSize::Double => Some(0x66),
        };
        self.sse_op_rip(prefix, 0x57, dst, label)
    }

    /// CVTSI2SS/CVTSI2SD xmm, r64.
    pub fn cvt_int_to_fp(&mut self, dst: AsmReg, src: AsmReg, fsize: FpSize) -> JitResult<()> {
        self.sse_op(Some(fsize.prefix()), true, 0x2a, dst, src)
    }

    /// CVTTSS2SI/CVTTSD2SI r64, xmm (truncating).
    pub fn cvt_fp_to_int(&mut self, dst: AsmReg, src: AsmReg, fsize: FpSize) -> JitResult<()> {
        self.sse_op(Some(fsize.prefix()), true, 0x2c, dst, src)
    }

    /// CVTSS2SD/CVTSD2SS xmm, xmm. `from` names the source width.
    pub fn cvt_fp_to_fp(&mut self, dst: AsmReg, src: AsmReg, from: FpSize) -> JitResult<()> {
        self.sse_op(Some(from.prefix()), false, 0x5a, dst, src)
    }

    // ==================== Stack and control flow ====================

    pub fn push_r(&mut self, reg: AsmReg) -> JitResult<()> {
        self.emit_opt(rex(false, false, reg.needs_rex_ext()))?;
        self.emit8(0x50 + reg.low_bits())
    }

    pub fn pop_r(&mut self, reg: AsmReg) -> JitResult<()> {
        self.emit_opt(rex(false, false, reg.needs_rex_ext()))?;
        self.emit8(0x58 + reg.low_bits())
    }

    pub fn leave(&mut self) -> JitResult<()> {
        self.emit8(0xc9)
    }

    pub fn ret(&mut self) -> JitResult<()> {
        self.emit8(0xc3)
    }

    /// JMP rel32 to `label` (patched at finalize).
    pub fn jmp(&mut self, label: Label) -> JitResult<()> {
        self.emit8(0xe9)?;
        self.emit_call_site(label, 4)
    }

    /// JMP rel8 to `label`. Finalize fails if the distance exceeds the
    /// signed 8-bit range.
    pub fn jmp_short(&mut self, label: Label) -> JitResult<()> {
        self.emit8(0xeb)?;
        self.emit_call_site(label, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::{R8, R9, RAX, RBP, RCX, RSP, XMM0};
    use crate::core::register_file::{AsmReg, BANK_XMM};

    const XMM1: AsmReg = AsmReg::new(BANK_XMM, 1);
    const XMM2: AsmReg = AsmReg::new(BANK_XMM, 2);

    fn buffer() -> CodeBuffer {
        CodeBuffer::new(256, 8, 8).unwrap()
    }

    #[test]
    fn test_mov_rr() {
        let mut buf = buffer();
        buf.mov_rr(RAX, RCX, OpSize::Qword).unwrap();
        // REX.W + 8B /r, dst in reg field
        assert_eq!(buf.bytes(), &[0x48, 0x8b, 0xc1]);
    }

    #[test]
    fn test_mov_rbp_rsp() {
        let mut buf = buffer();
        buf.mov_rr(RBP, RSP, OpSize::Qword).unwrap();
        assert_eq!(buf.bytes(), &[0x48, 0x8b, 0xec]);
    }

    #[test]
    fn test_add_rr() {
        let mut buf = buffer();
        buf.alu_rr(AluOp::Add, RAX, RCX, OpSize::Qword).unwrap();
        assert_eq!(buf.bytes(), &[0x48, 0x03, 0xc1]);
    }

    #[test]
    fn test_extended_registers_set_rex_bits() {
        let mut buf = buffer();
        buf.alu_rr(AluOp::Add, R8, R9, OpSize::Qword).unwrap();
        // REX.W + REX.R + REX.B
        assert_eq!(buf.bytes(), &[0x4d, 0x03, 0xc1]);
    }

    #[test]
    fn test_dword_ops_have_no_rex_w() {
        let mut buf = buffer();
        buf.alu_rr(AluOp::Sub, RAX, RCX, OpSize::Dword).unwrap();
        assert_eq!(buf.bytes(), &[0x2b, 0xc1]);
    }

    #[test]
    fn test_mov_load_disp8() {
        let mut buf = buffer();
        buf.mov_load(RAX, -8, OpSize::Qword).unwrap();
        // mod=01, rm=101 (rbp), disp8
        assert_eq!(buf.bytes(), &[0x48, 0x8b, 0x45, 0xf8]);
    }

    #[test]
    fn test_mov_load_disp32() {
        let mut buf = buffer();
        buf.mov_load(RAX, -300, OpSize::Qword).unwrap();
        assert_eq!(&buf.bytes()[..3], &[0x48, 0x8b, 0x85]);
        let disp = i32::from_le_bytes(buf.bytes()[3..7].try_into().unwrap());
        assert_eq!(disp, -300);
    }

    #[test]
    fn test_mov_ri_picks_shortest_form() {
        let mut buf = buffer();
        buf.mov_ri(RAX, 42, OpSize::Qword).unwrap();
        // imm32 form, not movabs
        assert_eq!(buf.bytes(), &[0x48, 0xc7, 0xc0, 42, 0, 0, 0]);

        let mut buf = buffer();
        buf.mov_ri(RAX, i64::MAX, OpSize::Qword).unwrap();
        assert_eq!(&buf.bytes()[..2], &[0x48, 0xb8]);
        assert_eq!(buf.bytes().len(), 10);
    }

    #[test]
    fn test_shift_imm_masks_count() {
        let mut buf = buffer();
        buf.shift_imm(ShiftKind::Shl, RAX, 3, OpSize::Qword).unwrap();
        assert_eq!(buf.bytes(), &[0x48, 0xc1, 0xe0, 0x03]);
    }

    #[test]
    fn test_push_pop_ret() {
        let mut buf = buffer();
        buf.push_r(RBP).unwrap();
        buf.pop_r(RBP).unwrap();
        buf.leave().unwrap();
        buf.ret().unwrap();
        assert_eq!(buf.bytes(), &[0x55, 0x5d, 0xc9, 0xc3]);
    }

    #[test]
    fn test_movsd_rr() {
        let mut buf = buffer();
        buf.fp_mov_rr(XMM0, XMM1, FpSize::Double).unwrap();
        assert_eq!(buf.bytes(), &[0xf2, 0x0f, 0x10, 0xc1]);
    }

    #[test]
    fn test_addsd_rr() {
        let mut buf = buffer();
        buf.fp_alu_rr(FpOp::Add, XMM1, XMM2, FpSize::Double).unwrap();
        assert_eq!(buf.bytes(), &[0xf2, 0x0f, 0x58, 0xca]);
    }

    #[test]
    fn test_cvtsi2sd() {
        let mut buf = buffer();
        buf.cvt_int_to_fp(XMM0, RAX, FpSize::Double).unwrap();
        // prefix, REX.W between prefix and 0F
        assert_eq!(buf.bytes(), &[0xf2, 0x48, 0x0f, 0x2a, 0xc0]);
    }

    #[test]
    fn test_fp_load_rip_records_call_site() {
        let mut buf = buffer();
        let label = buf.allocate_label().unwrap();
        buf.fp_load_rip(XMM1, label, FpSize::Double).unwrap();
        // F2 0F 10, ModRM mod=00 reg=001 rm=101, then 4 reserved bytes
        assert_eq!(&buf.bytes()[..4], &[0xf2, 0x0f, 0x10, 0x0d]);
        assert_eq!(buf.current_position(), 8);

        buf.place_label(label).unwrap();
        buf.patch_call_sites().unwrap();
        let rel = i32::from_le_bytes(buf.bytes()[4..8].try_into().unwrap());
        // Label sits right after the instruction: displacement zero.
        assert_eq!(rel, 0);
    }

    #[test]
    fn test_jmp_short_resolves_backward() {
        let mut buf = buffer();
        let label = buf.allocate_label().unwrap();
        buf.place_label(label).unwrap();
        buf.jmp_short(label).unwrap();
        buf.patch_call_sites().unwrap();
        assert_eq!(buf.bytes(), &[0xeb, 0xfe]); // jmp -2, to itself
    }
}
