//! Shared infrastructure: errors, buffers, labels, and registers.

pub mod code_buffer;
pub mod error;
pub mod execution_buffer;
pub mod jump_table;
pub mod register_file;

pub use code_buffer::{CodeBuffer, EmitScalar};
pub use error::{JitError, JitResult};
pub use execution_buffer::ExecutionBuffer;
pub use jump_table::{JumpTable, Label};
pub use register_file::{AsmReg, RegBitSet, RegisterPool, BANK_GP, BANK_XMM};
