//! A function under construction: code stream plus executable backing.
//!
//! [`FunctionBuffer`] pairs a [`CodeBuffer`] with an [`ExecutionBuffer`] of
//! the same capacity and owns the standard frame protocol. Emission writes
//! into the patchable code stream; `finalize` patches every pending label
//! reference, copies the finished bytes into the mapping, and flips it to
//! read-execute. The two-buffer split keeps writable and executable memory
//! disjoint at all times.

use crate::core::code_buffer::CodeBuffer;
use crate::core::error::{JitError, JitResult};
use crate::core::execution_buffer::ExecutionBuffer;
use crate::core::register_file::BANK_GP;
use crate::x64::encoder::{AluOp, FpSize, OpSize};
use crate::x64::{FrameLayout, ParamLoc, RBP, RSP};

pub struct FunctionBuffer {
    code: CodeBuffer,
    execution: ExecutionBuffer,
    finalized: bool,
}

impl FunctionBuffer {
    pub fn new(capacity: usize, max_labels: usize, max_call_sites: usize) -> JitResult<Self> {
        Ok(Self {
            code: CodeBuffer::new(capacity, max_labels, max_call_sites)?,
            execution: ExecutionBuffer::new(capacity)?,
            finalized: false,
        })
    }

    pub fn code(&self) -> &CodeBuffer {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut CodeBuffer {
        &mut self.code
    }

    /// Standard frame setup: save RBP, carve the frame, and store every
    /// register-passed parameter to its home slot so later reads are
    /// uniform frame loads.
    pub fn emit_prologue(&mut self, frame: &FrameLayout) -> JitResult<()> {
        self.code.push_r(RBP)?;
        self.code.mov_rr(RBP, RSP, OpSize::Qword)?;
        let frame_size = frame.frame_size();
        if frame_size > 0 {
            self.code
                .alu_ri(AluOp::Sub, RSP, frame_size as i32, OpSize::Qword)?;
        }
        for (_, loc) in frame.register_params() {
            if let ParamLoc::Reg { reg, home } = loc {
                if reg.bank == BANK_GP {
                    self.code.mov_store(home, reg, OpSize::Qword)?;
                } else {
                    // Full 8-byte store; narrow loads read the low half.
                    self.code.fp_store(home, reg, FpSize::Double)?;
                }
            }
        }
        Ok(())
    }

    pub fn emit_epilogue(&mut self) -> JitResult<()> {
        self.code.leave()?;
        self.code.ret()
    }

    /// Patch all pending label references, move the code into executable
    /// memory, and protect it. Returns the entry address.
    pub fn finalize(&mut self) -> JitResult<*const u8> {
        if self.finalized {
            return Err(JitError::AlreadyFinalized);
        }
        self.code.patch_call_sites()?;
        self.execution.write(0, self.code.bytes())?;
        self.execution.make_executable()?;
        self.finalized = true;
        Ok(self.execution.entry())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The finalized machine code.
    pub fn finalized_bytes(&self) -> JitResult<&[u8]> {
        if !self.finalized {
            return Err(JitError::NotFinalized);
        }
        Ok(self.code.bytes())
    }

    /// Reinterpret the entry point as a callable of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern "C"` function pointer type matching the
    /// signature the code was compiled for, and must not outlive `self`.
    pub unsafe fn as_fn<F: Copy>(&self) -> JitResult<F> {
        if !self.finalized {
            return Err(JitError::NotFinalized);
        }
        self.execution.as_fn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ValueType;
    use crate::x64::GP_SCRATCH;

    #[test]
    fn test_empty_frame_prologue_skips_rsp_adjust() {
        let mut func = FunctionBuffer::new(4096, 8, 8).unwrap();
        let frame = FrameLayout::for_params(&[], 16);
        func.emit_prologue(&frame).unwrap();
        // push rbp; mov rbp, rsp; nothing else
        assert_eq!(func.code().bytes(), &[0x55, 0x48, 0x8b, 0xec]);
    }

    #[test]
    fn test_prologue_homes_register_params() {
        let mut func = FunctionBuffer::new(4096, 8, 8).unwrap();
        let frame = FrameLayout::for_params(&[ValueType::I64], 16);
        func.emit_prologue(&frame).unwrap();
        let bytes = func.code().bytes();
        // Ends with mov [rbp-8], rdi.
        assert_eq!(&bytes[bytes.len() - 4..], &[0x48, 0x89, 0x7d, 0xf8]);
    }

    #[test]
    fn test_finalize_produces_callable_code() {
        let mut func = FunctionBuffer::new(4096, 8, 8).unwrap();
        let frame = FrameLayout::for_params(&[], 16);
        func.emit_prologue(&frame).unwrap();
        func.code_mut().mov_ri(GP_SCRATCH, 42, OpSize::Qword).unwrap();
        func.emit_epilogue().unwrap();
        func.finalize().unwrap();

        let f: extern "C" fn() -> i64 = unsafe { func.as_fn().unwrap() };
        assert_eq!(f(), 42);
    }

    #[test]
    fn test_double_finalize_rejected() {
        let mut func = FunctionBuffer::new(4096, 8, 8).unwrap();
        func.code_mut().ret().unwrap();
        func.finalize().unwrap();
        assert_eq!(func.finalize(), Err(JitError::AlreadyFinalized));
    }

    #[test]
    fn test_as_fn_before_finalize_rejected() {
        let func = FunctionBuffer::new(4096, 8, 8).unwrap();
        let result = unsafe { func.as_fn::<extern "C" fn()>() };
        assert_eq!(result.err(), Some(JitError::NotFinalized));
    }
}
