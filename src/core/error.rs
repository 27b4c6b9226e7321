//! Error types for the expression compiler.
//!
//! Using thiserror for more idiomatic error handling. Every failure is
//! reported synchronously at the point of violation (construction, emission
//! call, or finalize), never deferred to execution of generated code.

use thiserror::Error;

use crate::graph::ValueType;

/// Main error type for expression compilation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JitError {
    // Capacity errors: detected before any out-of-bounds write.
    #[error("label capacity exceeded: at most {max} labels")]
    LabelCapacity { max: usize },

    #[error("call site capacity exceeded: at most {max} call sites")]
    CallSiteCapacity { max: usize },

    #[error("code buffer overflow: write of {requested} bytes at offset {position} exceeds capacity {capacity}")]
    BufferOverflow {
        position: usize,
        requested: usize,
        capacity: usize,
    },

    #[error("buffer capacity must be non-zero")]
    ZeroCapacity,

    #[error("invalid buffer position {position} (capacity {capacity})")]
    InvalidPosition { position: usize, capacity: usize },

    // Protocol errors: label/patch lifecycle violations.
    #[error("label {id} does not exist")]
    InvalidLabel { id: u32 },

    #[error("label {id} placed twice")]
    LabelAlreadyPlaced { id: u32 },

    #[error("label {id} referenced but never placed")]
    UnplacedLabel { id: u32 },

    #[error("relative offset {offset} does not fit in a {size}-byte field")]
    OffsetOutOfRange { offset: i64, size: u8 },

    #[error("unsupported call site width {size} (must be 1, 4, or 8)")]
    InvalidCallSiteWidth { size: u8 },

    #[error("function buffer already finalized")]
    AlreadyFinalized,

    #[error("function buffer not finalized")]
    NotFinalized,

    // Graph errors: malformed or unsupported expression graphs.
    #[error("parameter index {index} out of range (function has {arity} parameters)")]
    ParameterOutOfRange { index: u32, arity: u32 },

    #[error("operand type mismatch: {lhs} vs {rhs}")]
    TypeMismatch { lhs: ValueType, rhs: ValueType },

    #[error("operation {op} is not supported for {ty}")]
    UnsupportedOp { op: &'static str, ty: ValueType },

    #[error("cast from {from} to {to} is not supported")]
    UnsupportedCast { from: ValueType, to: ValueType },

    #[error("node {node} of type {ty} was assigned to register bank {bank}")]
    RegisterClassMismatch { node: u32, ty: ValueType, bank: u8 },

    #[error("node {node} has no storage assignment")]
    MissingAssignment { node: u32 },

    // Allocation errors: register/spill demand unsatisfiable.
    #[error("spill capacity exceeded: expression needs more than {max} spill slots")]
    SpillCapacity { max: usize },

    // Executable memory errors.
    #[error("executable memory allocation of {size} bytes failed")]
    MemoryAllocation { size: usize },

    #[error("changing memory protection failed")]
    MemoryProtection,

    #[error("write to protected execution buffer")]
    BufferProtected,
}

/// Result type alias for compile operations.
pub type JitResult<T> = Result<T, JitError>;
