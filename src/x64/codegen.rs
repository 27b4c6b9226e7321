//! Machine code emission from a scheduled expression graph.
//!
//! [`CodeGenerator`] walks the allocator's schedule and lowers each node
//! into x86-64 instructions, honoring the storage decisions already made:
//! register nodes compute in place, spilled nodes compute in the bank's
//! scratch register and store to their frame slot, and folded constants
//! become imm32 operands or RIP-relative pool loads.
//!
//! Binary operations use the two-address pattern: the left operand is
//! moved into the destination, then the right operand is applied from
//! whatever storage it has (register, frame slot, immediate, or constant
//! pool). The constant pool is laid out after the epilogue, deduplicated
//! by bit pattern, with 16-byte-aligned sign masks for float negation.

use hashbrown::HashMap;

use crate::core::code_buffer::CodeBuffer;
use crate::core::error::JitResult;
use crate::core::jump_table::Label;
use crate::core::register_file::AsmReg;
use crate::graph::{BinaryOp, ExprGraph, Node, NodeId, UnaryOp, ValueType};
use crate::regalloc::{Allocation, Storage};
use crate::x64::encoder::{AluOp, FpOp, FpSize, OpSize, ShiftKind};
use crate::x64::function_buffer::FunctionBuffer;
use crate::x64::{GP_SCRATCH, SHIFT_SCRATCH, XMM_SCRATCH};

/// Deduplication key and payload for one constant pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PoolEntry {
    F32(u32),
    F64(u64),
    /// 16-byte mask flipping the sign bit of the low f32 lane.
    SignMask32,
    /// 16-byte mask flipping the sign bit of the low f64 lane.
    SignMask64,
}

fn opsize(ty: ValueType) -> OpSize {
    if ty.size() == 4 {
        OpSize::Dword
    } else {
        OpSize::Qword
    }
}

fn fpsize(ty: ValueType) -> FpSize {
    match ty {
        ValueType::F32 => FpSize::Single,
        _ => FpSize::Double,
    }
}

/// Immediate bits as the i64 a register load wants.
fn imm_value(ty: ValueType, bits: u64) -> i64 {
    if ty.size() == 4 {
        bits as u32 as i64
    } else {
        bits as i64
    }
}

pub struct CodeGenerator<'a, 'arena> {
    graph: &'a ExprGraph<'arena>,
    alloc: &'a Allocation<'arena>,
    pool: Vec<(PoolEntry, Label)>,
    pool_index: HashMap<PoolEntry, Label>,
}

impl<'a, 'arena> CodeGenerator<'a, 'arena> {
    pub fn new(graph: &'a ExprGraph<'arena>, alloc: &'a Allocation<'arena>) -> Self {
        Self {
            graph,
            alloc,
            pool: Vec::new(),
            pool_index: HashMap::new(),
        }
    }

    /// Emit the complete function: prologue, the scheduled computation,
    /// the return-value move, epilogue, and the constant pool. Returns the
    /// number of pool entries emitted.
    pub fn emit(mut self, func: &mut FunctionBuffer, root: NodeId) -> JitResult<usize> {
        func.emit_prologue(self.alloc.frame())?;
        for i in 0..self.alloc.schedule().len() {
            let id = self.alloc.schedule()[i];
            self.emit_node(func.code_mut(), id)?;
        }
        self.emit_return_move(func.code_mut(), root)?;
        func.emit_epilogue()?;
        self.emit_pool(func.code_mut())?;

        log::debug!(
            "emitted {} bytes, {} pool constants",
            func.code().current_position(),
            self.pool.len()
        );
        Ok(self.pool.len())
    }

    fn emit_node(&mut self, code: &mut CodeBuffer, id: NodeId) -> JitResult<()> {
        let node = *self.graph.node(id);
        let storage = self.alloc.storage(id)?;

        match node {
            Node::Immediate { ty, bits } => match storage {
                // Folded into consumers; nothing to emit here.
                Storage::ImmInline(_) | Storage::RipConst => Ok(()),
                Storage::Reg(reg) => code.mov_ri(reg, imm_value(ty, bits), opsize(ty)),
                Storage::Spill { offset } => {
                    code.mov_ri(GP_SCRATCH, imm_value(ty, bits), opsize(ty))?;
                    code.mov_store(offset, GP_SCRATCH, OpSize::Qword)
                }
            },
            Node::Parameter { index, ty } => match storage {
                Storage::Reg(reg) => {
                    let offset = self.alloc.frame().param_offset(index);
                    if ty.is_float() {
                        code.fp_load(reg, offset, fpsize(ty))
                    } else {
                        code.mov_load(reg, offset, opsize(ty))
                    }
                }
                // Assigned its own home (or caller stack) slot; already there.
                Storage::Spill { .. } => Ok(()),
                _ => Ok(()),
            },
            Node::Binary { op, lhs, rhs, ty } => self.emit_binary(code, storage, op, lhs, rhs, ty),
            Node::Unary { op, operand, ty } => self.emit_unary(code, storage, op, operand, ty),
            Node::Cast { operand, from, to } => self.emit_cast(code, storage, operand, from, to),
        }
    }

    /// The register a node computes in: its own, or the bank scratch when
    /// it lives in a frame slot.
    fn work_reg(storage: Storage, ty: ValueType) -> AsmReg {
        match storage {
            Storage::Reg(reg) => reg,
            _ if ty.is_float() => XMM_SCRATCH,
            _ => GP_SCRATCH,
        }
    }

    /// Store a computed value back to its frame slot, when it has one.
    fn store_result(
        &mut self,
        code: &mut CodeBuffer,
        storage: Storage,
        work: AsmReg,
        ty: ValueType,
    ) -> JitResult<()> {
        if let Storage::Spill { offset } = storage {
            if ty.is_float() {
                code.fp_store(offset, work, fpsize(ty))?;
            } else {
                code.mov_store(offset, work, OpSize::Qword)?;
            }
        }
        Ok(())
    }

    /// Move an operand's value into `dst` from wherever it lives.
    fn load_operand(&mut self, code: &mut CodeBuffer, dst: AsmReg, id: NodeId) -> JitResult<()> {
        let ty = self.graph.node(id).ty();
        match self.alloc.storage(id)? {
            Storage::Reg(src) => {
                if src == dst {
                    Ok(())
                } else if ty.is_float() {
                    code.fp_mov_rr(dst, src, fpsize(ty))
                } else {
                    code.mov_rr(dst, src, OpSize::Qword)
                }
            }
            Storage::Spill { offset } => {
                if ty.is_float() {
                    code.fp_load(dst, offset, fpsize(ty))
                } else {
                    code.mov_load(dst, offset, opsize(ty))
                }
            }
            Storage::ImmInline(value) => code.mov_ri(dst, value as i64, opsize(ty)),
            Storage::RipConst => {
                let label = self.value_const(code, id)?;
                code.fp_load_rip(dst, label, fpsize(ty))
            }
        }
    }

    fn emit_binary(
        &mut self,
        code: &mut CodeBuffer,
        storage: Storage,
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
        ty: ValueType,
    ) -> JitResult<()> {
        let work = Self::work_reg(storage, ty);
        self.load_operand(code, work, lhs)?;

        if ty.is_float() {
            let fop = match op {
                BinaryOp::Add => FpOp::Add,
                BinaryOp::Sub => FpOp::Sub,
                BinaryOp::Mul => FpOp::Mul,
                BinaryOp::Div => FpOp::Div,
                // Remaining operators are integer-only by construction.
                _ => unreachable!("float {op:?}"),
            };
            let fs = fpsize(ty);
            match self.alloc.storage(rhs)? {
                Storage::Reg(src) => code.fp_alu_rr(fop, work, src, fs)?,
                Storage::Spill { offset } => code.fp_alu_mem(fop, work, offset, fs)?,
                Storage::RipConst => {
                    let label = self.value_const(code, rhs)?;
                    code.fp_alu_rip(fop, work, label, fs)?;
                }
                Storage::ImmInline(_) => unreachable!("inline float immediate"),
            }
        } else {
            let size = opsize(ty);
            match op {
                BinaryOp::Shl | BinaryOp::Shr => {
                    let kind = match op {
                        BinaryOp::Shl => ShiftKind::Shl,
                        _ if ty.is_signed() => ShiftKind::Sar,
                        _ => ShiftKind::Shr,
                    };
                    match self.alloc.storage(rhs)? {
                        Storage::ImmInline(count) => {
                            code.shift_imm(kind, work, count as u8, size)?
                        }
                        Storage::Reg(src) => {
                            code.mov_rr(SHIFT_SCRATCH, src, OpSize::Qword)?;
                            code.shift_cl(kind, work, size)?;
                        }
                        Storage::Spill { offset } => {
                            code.mov_load(SHIFT_SCRATCH, offset, OpSize::Qword)?;
                            code.shift_cl(kind, work, size)?;
                        }
                        Storage::RipConst => unreachable!("float shift count"),
                    }
                }
                BinaryOp::Mul => match self.alloc.storage(rhs)? {
                    Storage::Reg(src) => code.imul_rr(work, src, size)?,
                    Storage::Spill { offset } => code.imul_mem(work, offset, size)?,
                    Storage::ImmInline(value) => code.imul_ri(work, value, size)?,
                    Storage::RipConst => unreachable!("float integer multiply"),
                },
                _ => {
                    let aop = match op {
                        BinaryOp::Add => AluOp::Add,
                        BinaryOp::Sub => AluOp::Sub,
                        BinaryOp::And => AluOp::And,
                        BinaryOp::Or => AluOp::Or,
                        BinaryOp::Xor => AluOp::Xor,
                        _ => unreachable!("integer {op:?}"),
                    };
                    match self.alloc.storage(rhs)? {
                        Storage::Reg(src) => code.alu_rr(aop, work, src, size)?,
                        Storage::Spill { offset } => code.alu_mem(aop, work, offset, size)?,
                        Storage::ImmInline(value) => code.alu_ri(aop, work, value, size)?,
                        Storage::RipConst => unreachable!("float integer alu"),
                    }
                }
            }
        }

        self.store_result(code, storage, work, ty)
    }

    fn emit_unary(
        &mut self,
        code: &mut CodeBuffer,
        storage: Storage,
        op: UnaryOp,
        operand: NodeId,
        ty: ValueType,
    ) -> JitResult<()> {
        let work = Self::work_reg(storage, ty);
        self.load_operand(code, work, operand)?;

        match op {
            UnaryOp::Neg if ty.is_float() => {
                let fs = fpsize(ty);
                let mask = match fs {
                    FpSize::Single => PoolEntry::SignMask32,
                    FpSize::Double => PoolEntry::SignMask64,
                };
                let label = self.pool_label(code, mask)?;
                code.xorp_rip(work, label, fs)?;
            }
            UnaryOp::Neg => code.neg(work, opsize(ty))?,
            UnaryOp::Not => code.not(work, opsize(ty))?,
        }

        self.store_result(code, storage, work, ty)
    }

    fn emit_cast(
        &mut self,
        code: &mut CodeBuffer,
        storage: Storage,
        operand: NodeId,
        from: ValueType,
        to: ValueType,
    ) -> JitResult<()> {
        let work = Self::work_reg(storage, to);

        match (from.is_float(), to.is_float()) {
            (false, false) => self.emit_int_to_int(code, work, operand, from, to)?,
            (false, true) => {
                // cvtsi2ss/sd is signed 64-bit; narrower sources are
                // widened into the scratch register first.
                let src = self.int_operand_as_i64(code, operand, from)?;
                code.cvt_int_to_fp(work, src, fpsize(to))?;
            }
            (true, false) => {
                let src = match self.alloc.storage(operand)? {
                    Storage::Reg(reg) => reg,
                    Storage::Spill { offset } => {
                        code.fp_load(XMM_SCRATCH, offset, fpsize(from))?;
                        XMM_SCRATCH
                    }
                    Storage::RipConst => {
                        let label = self.value_const(code, operand)?;
                        code.fp_load_rip(XMM_SCRATCH, label, fpsize(from))?;
                        XMM_SCRATCH
                    }
                    Storage::ImmInline(_) => unreachable!("inline float immediate"),
                };
                code.cvt_fp_to_int(work, src, fpsize(from))?;
                if to.size() == 4 {
                    code.mov_rr32(work, work)?;
                }
            }
            (true, true) => {
                if from == to {
                    self.load_operand(code, work, operand)?;
                } else {
                    // Load in source width, then convert in place.
                    match self.alloc.storage(operand)? {
                        Storage::Reg(src) => code.cvt_fp_to_fp(work, src, fpsize(from))?,
                        Storage::Spill { offset } => {
                            code.fp_load(work, offset, fpsize(from))?;
                            code.cvt_fp_to_fp(work, work, fpsize(from))?;
                        }
                        Storage::RipConst => {
                            let label = self.value_const(code, operand)?;
                            code.fp_load_rip(work, label, fpsize(from))?;
                            code.cvt_fp_to_fp(work, work, fpsize(from))?;
                        }
                        Storage::ImmInline(_) => unreachable!("inline float immediate"),
                    }
                }
            }
        }

        self.store_result(code, storage, work, to)
    }

    fn emit_int_to_int(
        &mut self,
        code: &mut CodeBuffer,
        work: AsmReg,
        operand: NodeId,
        from: ValueType,
        to: ValueType,
    ) -> JitResult<()> {
        match self.alloc.storage(operand)? {
            Storage::ImmInline(value) => {
                let imm = match from {
                    ValueType::I32 => value as i64,
                    ValueType::U32 => value as u32 as i64,
                    _ => value as i64,
                };
                return code.mov_ri(work, imm, opsize(to));
            }
            Storage::Reg(src) => match (from, to.size()) {
                (ValueType::I32, 8) => code.movsxd(work, src)?,
                (ValueType::U32, 8) => code.mov_rr32(work, src)?,
                (_, 4) => code.mov_rr32(work, src)?,
                _ => {
                    if src != work {
                        code.mov_rr(work, src, OpSize::Qword)?;
                    }
                }
            },
            Storage::Spill { offset } => match (from, to.size()) {
                (ValueType::I32, 8) => {
                    code.mov_load(work, offset, OpSize::Dword)?;
                    code.movsxd(work, work)?;
                }
                (ValueType::U32, 8) | (_, 4) => code.mov_load(work, offset, OpSize::Dword)?,
                _ => code.mov_load(work, offset, OpSize::Qword)?,
            },
            Storage::RipConst => unreachable!("integer pool constant"),
        }
        Ok(())
    }

    /// The operand's value, sign- or zero-extended to 64 bits, in a
    /// general-purpose register (the operand's own when already wide).
    fn int_operand_as_i64(
        &mut self,
        code: &mut CodeBuffer,
        operand: NodeId,
        from: ValueType,
    ) -> JitResult<AsmReg> {
        match self.alloc.storage(operand)? {
            Storage::Reg(src) if from.size() == 8 => Ok(src),
            Storage::Reg(src) => {
                if from == ValueType::I32 {
                    code.movsxd(GP_SCRATCH, src)?;
                } else {
                    code.mov_rr32(GP_SCRATCH, src)?;
                }
                Ok(GP_SCRATCH)
            }
            Storage::Spill { offset } => {
                match from {
                    ValueType::I32 => {
                        code.mov_load(GP_SCRATCH, offset, OpSize::Dword)?;
                        code.movsxd(GP_SCRATCH, GP_SCRATCH)?;
                    }
                    ValueType::U32 => code.mov_load(GP_SCRATCH, offset, OpSize::Dword)?,
                    _ => code.mov_load(GP_SCRATCH, offset, OpSize::Qword)?,
                }
                Ok(GP_SCRATCH)
            }
            Storage::ImmInline(value) => {
                let imm = match from {
                    ValueType::U32 => value as u32 as i64,
                    _ => value as i64,
                };
                code.mov_ri(GP_SCRATCH, imm, OpSize::Qword)?;
                Ok(GP_SCRATCH)
            }
            Storage::RipConst => unreachable!("integer pool constant"),
        }
    }

    /// Move the root value into the ABI return register.
    fn emit_return_move(&mut self, code: &mut CodeBuffer, root: NodeId) -> JitResult<()> {
        let ty = self.graph.node(root).ty();
        let dst = if ty.is_float() { XMM_SCRATCH } else { GP_SCRATCH };
        self.load_operand(code, dst, root)
    }

    /// Pool label for a float immediate node's bit pattern.
    fn value_const(&mut self, code: &mut CodeBuffer, id: NodeId) -> JitResult<Label> {
        let entry = match *self.graph.node(id) {
            Node::Immediate { ty: ValueType::F32, bits } => PoolEntry::F32(bits as u32),
            Node::Immediate { bits, .. } => PoolEntry::F64(bits),
            ref node => unreachable!("pool reference to {node:?}"),
        };
        self.pool_label(code, entry)
    }

    /// Deduplicated label for a pool entry, allocating on first use.
    fn pool_label(&mut self, code: &mut CodeBuffer, entry: PoolEntry) -> JitResult<Label> {
        if let Some(&label) = self.pool_index.get(&entry) {
            return Ok(label);
        }
        let label = code.allocate_label()?;
        self.pool_index.insert(entry, label);
        self.pool.push((entry, label));
        Ok(label)
    }

    /// Lay the constant pool out after the code. Masks are 16-byte aligned
    /// for xorps/xorpd; scalars align to their own size.
    fn emit_pool(&mut self, code: &mut CodeBuffer) -> JitResult<()> {
        // Widest alignment first keeps padding minimal.
        let mut entries = std::mem::take(&mut self.pool);
        entries.sort_by_key(|(entry, _)| match entry {
            PoolEntry::SignMask32 | PoolEntry::SignMask64 => 0,
            PoolEntry::F64(_) => 1,
            PoolEntry::F32(_) => 2,
        });

        for &(entry, label) in &entries {
            match entry {
                PoolEntry::SignMask32 => {
                    code.align_to(16)?;
                    code.place_label(label)?;
                    code.emit32(0x8000_0000)?;
                    for _ in 0..3 {
                        code.emit32(0)?;
                    }
                }
                PoolEntry::SignMask64 => {
                    code.align_to(16)?;
                    code.place_label(label)?;
                    code.emit64(0x8000_0000_0000_0000)?;
                    code.emit64(0)?;
                }
                PoolEntry::F64(bits) => {
                    code.align_to(8)?;
                    code.place_label(label)?;
                    code.emit64(bits)?;
                }
                PoolEntry::F32(bits) => {
                    code.align_to(4)?;
                    code.place_label(label)?;
                    code.emit32(bits)?;
                }
            }
        }
        self.pool = entries;
        Ok(())
    }
}
