//! Runtime compilation of expression graphs to native x86-64 code.
//!
//! Build a typed expression DAG over immediates, function parameters,
//! arithmetic, bitwise operations, and casts, then compile it into a
//! directly callable machine-code function following the System V AMD64
//! calling convention:
//!
//! ```
//! use bumpalo::Bump;
//! use exprjit::compiler::compile;
//! use exprjit::graph::{BinaryOp, ExprGraph, ValueType};
//!
//! let arena = Bump::new();
//! let mut graph = ExprGraph::new(&arena, &[ValueType::I64, ValueType::I64]);
//! let a = graph.parameter(0)?;
//! let b = graph.parameter(1)?;
//! let sum = graph.binary(BinaryOp::Add, a, b)?;
//!
//! let compiled = compile(&graph, sum)?;
//! let f: extern "C" fn(i64, i64) -> i64 = unsafe { compiled.as_fn()? };
//! assert_eq!(f(2, 40), 42);
//! # Ok::<(), exprjit::JitError>(())
//! ```
//!
//! Compilation is a single pass per stage: a Sethi-Ullman walk orders the
//! graph and assigns registers (spilling to frame slots past seven live
//! general-purpose values), then code emission lowers each scheduled node
//! into a fixed-capacity patchable buffer. Floating-point constants are
//! never loaded through registers; they land in a RIP-addressed pool after
//! the code. The finished bytes move into a write-xor-execute mapping
//! owned by the returned [`compiler::CompiledFunction`].
//!
//! Type errors, capacity overruns, and label misuse all surface as
//! [`JitError`] at graph construction or compile time; generated code
//! itself performs no checks.

pub mod compiler;
pub mod core;
pub mod graph;
pub mod regalloc;
pub mod x64;

pub use crate::compiler::{compile, compile_with, CompiledFunction, CompileStats, CompilerConfig};
pub use crate::core::error::{JitError, JitResult};
pub use crate::graph::{BinaryOp, ExprGraph, Node, NodeId, UnaryOp, ValueType};
