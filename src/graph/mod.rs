//! The expression graph clients build and compile.
//!
//! Nodes form a typed, immutable DAG stored in an arena-backed,
//! index-addressed table: constructors append a node and hand back its
//! [`NodeId`], nothing is ever mutated or removed, and sharing a `NodeId`
//! between parents shares the computation. The graph's lifetime is exactly
//! the arena's, so there are no cyclic-reference or double-free concerns.
//!
//! Type and arity violations are rejected at construction, before any
//! compilation starts.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::core::error::{JitError, JitResult};
use crate::core::register_file::{BANK_GP, BANK_XMM};

/// Result type of an expression node, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ValueType {
    /// Register bank holding values of this type.
    pub fn bank(self) -> u8 {
        if self.is_float() {
            BANK_XMM
        } else {
            BANK_GP
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, ValueType::I32 | ValueType::I64)
    }

    /// Value size in bytes.
    pub fn size(self) -> usize {
        match self {
            ValueType::I32 | ValueType::U32 | ValueType::F32 => 4,
            ValueType::I64 | ValueType::U64 | ValueType::F64 => 8,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueType::I32 => "i32",
            ValueType::U32 => "u32",
            ValueType::I64 => "i64",
            ValueType::U64 => "u64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Floating-point only.
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
        }
    }

    fn supported_for(self, ty: ValueType) -> bool {
        match self {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => true,
            BinaryOp::Div => ty.is_float(),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Shl | BinaryOp::Shr => {
                !ty.is_float()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    /// Bitwise complement, integer only.
    Not,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
        }
    }
}

/// Index of a node within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn id(self) -> u32 {
        self.0
    }
}

/// A computation node. The variant set is closed; the allocator and code
/// generator match exhaustively over it.
#[derive(Debug, Clone, Copy)]
pub enum Node {
    /// Constant with its raw bit pattern (floats via `to_bits`, 32-bit
    /// integers zero-extended).
    Immediate { ty: ValueType, bits: u64 },
    Parameter { index: u32, ty: ValueType },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
        ty: ValueType,
    },
    Unary {
        op: UnaryOp,
        operand: NodeId,
        ty: ValueType,
    },
    Cast {
        operand: NodeId,
        from: ValueType,
        to: ValueType,
    },
}

impl Node {
    /// Result type of this node.
    pub fn ty(&self) -> ValueType {
        match *self {
            Node::Immediate { ty, .. } => ty,
            Node::Parameter { ty, .. } => ty,
            Node::Binary { ty, .. } => ty,
            Node::Unary { ty, .. } => ty,
            Node::Cast { to, .. } => to,
        }
    }
}

/// Expression graph under construction, scoped to one compile arena.
pub struct ExprGraph<'arena> {
    nodes: BumpVec<'arena, Node>,
    params: BumpVec<'arena, ValueType>,
}

impl<'arena> ExprGraph<'arena> {
    /// Create a graph for a function taking `params`.
    pub fn new(arena: &'arena Bump, params: &[ValueType]) -> Self {
        let mut param_vec = BumpVec::with_capacity_in(params.len(), arena);
        param_vec.extend_from_slice(params);
        Self {
            nodes: BumpVec::new_in(arena),
            params: param_vec,
        }
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Declared parameter types.
    pub fn param_types(&self) -> &[ValueType] {
        &self.params
    }

    pub fn arity(&self) -> u32 {
        self.params.len() as u32
    }

    pub fn imm_i32(&mut self, value: i32) -> NodeId {
        self.push(Node::Immediate {
            ty: ValueType::I32,
            bits: value as u32 as u64,
        })
    }

    pub fn imm_u32(&mut self, value: u32) -> NodeId {
        self.push(Node::Immediate {
            ty: ValueType::U32,
            bits: value as u64,
        })
    }

    pub fn imm_i64(&mut self, value: i64) -> NodeId {
        self.push(Node::Immediate {
            ty: ValueType::I64,
            bits: value as u64,
        })
    }

    pub fn imm_u64(&mut self, value: u64) -> NodeId {
        self.push(Node::Immediate {
            ty: ValueType::U64,
            bits: value,
        })
    }

    pub fn imm_f32(&mut self, value: f32) -> NodeId {
        self.push(Node::Immediate {
            ty: ValueType::F32,
            bits: value.to_bits() as u64,
        })
    }

    pub fn imm_f64(&mut self, value: f64) -> NodeId {
        self.push(Node::Immediate {
            ty: ValueType::F64,
            bits: value.to_bits(),
        })
    }

    /// Reference to the function's `index`-th parameter.
    pub fn parameter(&mut self, index: u32) -> JitResult<NodeId> {
        let ty = *self
            .params
            .get(index as usize)
            .ok_or(JitError::ParameterOutOfRange {
                index,
                arity: self.arity(),
            })?;
        Ok(self.push(Node::Parameter { index, ty }))
    }

    /// Binary operation over two same-typed operands.
    pub fn binary(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> JitResult<NodeId> {
        let lhs_ty = self.node(lhs).ty();
        let rhs_ty = self.node(rhs).ty();
        if lhs_ty != rhs_ty {
            return Err(JitError::TypeMismatch {
                lhs: lhs_ty,
                rhs: rhs_ty,
            });
        }
        if !op.supported_for(lhs_ty) {
            return Err(JitError::UnsupportedOp {
                op: op.name(),
                ty: lhs_ty,
            });
        }
        Ok(self.push(Node::Binary {
            op,
            lhs,
            rhs,
            ty: lhs_ty,
        }))
    }

    pub fn unary(&mut self, op: UnaryOp, operand: NodeId) -> JitResult<NodeId> {
        let ty = self.node(operand).ty();
        if op == UnaryOp::Not && ty.is_float() {
            return Err(JitError::UnsupportedOp {
                op: op.name(),
                ty,
            });
        }
        Ok(self.push(Node::Unary { op, operand, ty }))
    }

    /// Convert `operand` to `to`.
    pub fn cast(&mut self, operand: NodeId, to: ValueType) -> JitResult<NodeId> {
        let from = self.node(operand).ty();
        if !cast_supported(from, to) {
            return Err(JitError::UnsupportedCast { from, to });
        }
        Ok(self.push(Node::Cast { operand, from, to }))
    }
}

/// U64 has no direct SSE2 conversion (`cvtsi2sd` is signed); those casts
/// are rejected rather than silently computed wrong.
pub(crate) fn cast_supported(from: ValueType, to: ValueType) -> bool {
    use ValueType::U64;
    if from == to {
        return true;
    }
    !((from == U64 && to.is_float()) || (from.is_float() && to == U64))
}
