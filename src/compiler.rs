//! The compile pipeline: graph in, callable out.
//!
//! [`compile`] runs register allocation, validates the result, emits
//! machine code into a fresh [`FunctionBuffer`], and finalizes it into
//! executable memory. The returned [`CompiledFunction`] owns that memory;
//! the graph and its arena can be dropped as soon as `compile` returns.

use bumpalo::Bump;

use crate::core::error::{JitError, JitResult};
use crate::graph::{ExprGraph, NodeId};
use crate::regalloc::allocate;
use crate::x64::{CodeGenerator, FunctionBuffer};

/// Resource bounds for one compile.
#[derive(Debug, Clone, Copy)]
pub struct CompilerConfig {
    /// Code buffer (and executable mapping) size in bytes.
    pub code_capacity: usize,
    pub max_labels: usize,
    pub max_call_sites: usize,
    pub max_spill_slots: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            code_capacity: 16 * 1024,
            max_labels: 256,
            max_call_sites: 256,
            max_spill_slots: 64,
        }
    }
}

/// Counters from one compile, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileStats {
    pub code_size: usize,
    pub registers_allocated: u32,
    pub spill_slots: u32,
    pub pool_constants: usize,
}

/// A finalized function in executable memory.
pub struct CompiledFunction {
    buffer: FunctionBuffer,
    stats: CompileStats,
}

impl CompiledFunction {
    /// The finalized machine code bytes.
    pub fn code(&self) -> &[u8] {
        self.buffer.code().bytes()
    }

    pub fn code_size(&self) -> usize {
        self.buffer.code().current_position()
    }

    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    /// Reinterpret the entry point as a callable of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern "C"` function pointer type whose parameter
    /// and return types match the graph this was compiled from, and the
    /// callable must not outlive this [`CompiledFunction`].
    pub unsafe fn as_fn<F: Copy>(&self) -> JitResult<F> {
        self.buffer.as_fn()
    }
}

/// Compile `root` with default resource bounds.
pub fn compile(graph: &ExprGraph<'_>, root: NodeId) -> JitResult<CompiledFunction> {
    compile_with(&CompilerConfig::default(), graph, root)
}

/// Compile `root` of `graph` into a callable function.
pub fn compile_with(
    config: &CompilerConfig,
    graph: &ExprGraph<'_>,
    root: NodeId,
) -> JitResult<CompiledFunction> {
    if root.index() >= graph.node_count() {
        return Err(JitError::MissingAssignment { node: root.id() });
    }

    let arena = Bump::new();
    let alloc = allocate(&arena, graph, root, config.max_spill_slots)?;
    alloc.validate(graph)?;

    let mut buffer = FunctionBuffer::new(
        config.code_capacity,
        config.max_labels,
        config.max_call_sites,
    )?;
    let pool_constants = CodeGenerator::new(graph, &alloc).emit(&mut buffer, root)?;
    buffer.finalize()?;

    let stats = CompileStats {
        code_size: buffer.code().current_position(),
        registers_allocated: alloc.registers_allocated(),
        spill_slots: alloc.spill_count(),
        pool_constants,
    };
    log::debug!(
        "compiled {} nodes into {} bytes ({} spill slots, {} constants)",
        graph.node_count(),
        stats.code_size,
        stats.spill_slots,
        stats.pool_constants
    );

    Ok(CompiledFunction { buffer, stats })
}
