//! Sethi-Ullman register allocation.
//!
//! One pass over the expression DAG decides, before any code is emitted,
//! the evaluation order and the storage of every node. Subtree register
//! demand ("weight") drives scheduling: at each binary node the heavier
//! child is evaluated first so its result is the only value held across
//! the lighter child's evaluation, which is optimal for expression trees.
//! Shared nodes are scheduled once and kept alive by a per-edge use count;
//! their register is released exactly at the last consuming parent.
//!
//! When a bank runs out of registers the node is assigned an 8-byte frame
//! slot instead; emission goes through the bank's scratch register. Small
//! integer constants and floating-point constants never consume a register
//! at all, they fold into instruction operands (imm32 or RIP-relative
//! pool loads).

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::core::error::{JitError, JitResult};
use crate::core::register_file::{AsmReg, RegisterPool};
use crate::graph::{ExprGraph, Node, NodeId, ValueType};
use crate::x64::{allocatable_regs, FrameLayout};

/// Where a node's value lives during emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Reg(AsmReg),
    /// 8-byte frame slot at `[rbp + offset]`.
    Spill { offset: i32 },
    /// Integer constant folded into an imm32 operand field.
    ImmInline(i32),
    /// Constant materialized in the RIP-relative pool after the code.
    RipConst,
}

/// Evaluation order and storage assignment for one compile.
pub struct Allocation<'arena> {
    schedule: BumpVec<'arena, NodeId>,
    storages: BumpVec<'arena, Option<Storage>>,
    frame: FrameLayout,
    registers_allocated: u32,
}

impl<'arena> Allocation<'arena> {
    /// Nodes in emission order; every node appears after its operands and
    /// exactly once.
    pub fn schedule(&self) -> &[NodeId] {
        &self.schedule
    }

    pub fn storage(&self, id: NodeId) -> JitResult<Storage> {
        self.storages
            .get(id.index())
            .copied()
            .flatten()
            .ok_or(JitError::MissingAssignment { node: id.id() })
    }

    pub fn frame(&self) -> &FrameLayout {
        &self.frame
    }

    pub fn registers_allocated(&self) -> u32 {
        self.registers_allocated
    }

    pub fn spill_count(&self) -> u32 {
        self.frame.spill_count()
    }

    /// Check every scheduled node against its declared type: a storage must
    /// exist, and a register assignment must come from the type's bank.
    pub fn validate(&self, graph: &ExprGraph<'_>) -> JitResult<()> {
        for &id in self.schedule.iter() {
            let ty = graph.node(id).ty();
            if let Storage::Reg(reg) = self.storage(id)? {
                if reg.bank != ty.bank() {
                    return Err(JitError::RegisterClassMismatch {
                        node: id.id(),
                        ty,
                        bank: reg.bank,
                    });
                }
            }
        }
        Ok(())
    }
}

/// How an immediate participates in emission.
enum ImmClass {
    /// Fits a sign-extended imm32 operand.
    Inline(i32),
    /// Goes to the RIP-relative constant pool.
    Pool,
    /// 64-bit integer outside imm32 range; needs a `movabs` register load.
    Wide,
}

fn classify_imm(ty: ValueType, bits: u64) -> ImmClass {
    if ty.is_float() {
        return ImmClass::Pool;
    }
    if ty.size() == 4 {
        return ImmClass::Inline(bits as u32 as i32);
    }
    match i32::try_from(bits as i64) {
        Ok(v) => ImmClass::Inline(v),
        Err(_) => ImmClass::Wide,
    }
}

struct Allocator<'a, 'arena> {
    graph: &'a ExprGraph<'arena>,
    uses: Vec<u32>,
    weights: Vec<u32>,
    storages: BumpVec<'arena, Option<Storage>>,
    schedule: BumpVec<'arena, NodeId>,
    pool: RegisterPool,
    frame: FrameLayout,
    registers_allocated: u32,
}

/// Plan the evaluation of `root`: count uses, weigh subtrees, schedule
/// heavy-first, and bind every scheduled node to a register, frame slot,
/// or folded-constant storage.
pub fn allocate<'arena>(
    arena: &'arena Bump,
    graph: &ExprGraph<'arena>,
    root: NodeId,
    max_spill_slots: usize,
) -> JitResult<Allocation<'arena>> {
    let n = graph.node_count();
    let mut storages = BumpVec::with_capacity_in(n, arena);
    storages.extend(std::iter::repeat(None).take(n));

    let mut alloc = Allocator {
        graph,
        uses: vec![0; n],
        weights: vec![0; n],
        storages,
        schedule: BumpVec::new_in(arena),
        pool: RegisterPool::new(allocatable_regs()),
        frame: FrameLayout::for_params(graph.param_types(), max_spill_slots),
        registers_allocated: 0,
    };

    alloc.count_uses(root);
    alloc.weigh(root);
    alloc.build_schedule(root);
    alloc.assign()?;

    log::debug!(
        "allocated {} nodes: {} register grabs, {} spill slots",
        alloc.schedule.len(),
        alloc.registers_allocated,
        alloc.frame.spill_count()
    );

    Ok(Allocation {
        schedule: alloc.schedule,
        storages: alloc.storages,
        frame: alloc.frame,
        registers_allocated: alloc.registers_allocated,
    })
}

fn children(node: &Node) -> (Option<NodeId>, Option<NodeId>) {
    match *node {
        Node::Immediate { .. } | Node::Parameter { .. } => (None, None),
        Node::Binary { lhs, rhs, .. } => (Some(lhs), Some(rhs)),
        Node::Unary { operand, .. } => (Some(operand), None),
        Node::Cast { operand, .. } => (Some(operand), None),
    }
}

impl<'a, 'arena> Allocator<'a, 'arena> {
    /// Count consumer edges per node. Each reachable node is expanded once,
    /// but a shared child is incremented through every edge pointing at it.
    fn count_uses(&mut self, root: NodeId) {
        let mut expanded = vec![false; self.uses.len()];
        let mut stack = vec![root];
        self.uses[root.index()] = 1; // the implicit return use

        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut expanded[id.index()], true) {
                continue;
            }
            let (a, b) = children(self.graph.node(id));
            for child in [a, b].into_iter().flatten() {
                self.uses[child.index()] += 1;
                stack.push(child);
            }
        }
    }

    /// Sethi-Ullman weight: registers needed to evaluate the subtree with
    /// no spilling. Folded constants are free; equal-weight binary children
    /// cost one extra register because the first result is held while the
    /// second child evaluates.
    fn weigh(&mut self, root: NodeId) {
        let mut visited = vec![false; self.weights.len()];
        let mut stack = vec![(root, false)];

        while let Some((id, post)) = stack.pop() {
            if post {
                let w = match *self.graph.node(id) {
                    Node::Immediate { ty, bits } => match classify_imm(ty, bits) {
                        ImmClass::Inline(_) | ImmClass::Pool => 0,
                        ImmClass::Wide => 1,
                    },
                    Node::Parameter { .. } => 1,
                    Node::Unary { operand, .. } | Node::Cast { operand, .. } => {
                        self.weights[operand.index()].max(1)
                    }
                    Node::Binary { lhs, rhs, .. } => {
                        let wl = self.weights[lhs.index()];
                        let wr = self.weights[rhs.index()];
                        if wl == wr {
                            (wl + 1).max(1)
                        } else {
                            wl.max(wr)
                        }
                    }
                };
                self.weights[id.index()] = w;
                continue;
            }
            if visited[id.index()] {
                continue;
            }
            visited[id.index()] = true;
            stack.push((id, true));
            let (a, b) = children(self.graph.node(id));
            for child in [a, b].into_iter().flatten() {
                stack.push((child, false));
            }
        }
    }

    /// Post-order schedule, heavier child first (left first on ties).
    /// A shared node enters the schedule at its first visit only.
    fn build_schedule(&mut self, root: NodeId) {
        let mut scheduled = vec![false; self.weights.len()];
        let mut stack = vec![(root, false)];

        while let Some((id, post)) = stack.pop() {
            if post {
                self.schedule.push(id);
                continue;
            }
            if std::mem::replace(&mut scheduled[id.index()], true) {
                continue;
            }
            stack.push((id, true));
            match children(self.graph.node(id)) {
                (Some(lhs), Some(rhs)) => {
                    // Pushed in reverse of evaluation order.
                    if self.weights[rhs.index()] > self.weights[lhs.index()] {
                        stack.push((lhs, false));
                        stack.push((rhs, false));
                    } else {
                        stack.push((rhs, false));
                        stack.push((lhs, false));
                    }
                }
                (Some(child), None) => stack.push((child, false)),
                _ => {}
            }
        }
    }

    /// Walk the schedule binding storage, releasing each operand register
    /// at its last use.
    fn assign(&mut self) -> JitResult<()> {
        for i in 0..self.schedule.len() {
            let id = self.schedule[i];
            let node = *self.graph.node(id);
            let bank = node.ty().bank();

            let storage = match node {
                Node::Immediate { ty, bits } => match classify_imm(ty, bits) {
                    ImmClass::Inline(v) => Storage::ImmInline(v),
                    ImmClass::Pool => Storage::RipConst,
                    ImmClass::Wide => self.fresh_location(bank)?,
                },
                Node::Parameter { index, .. } => match self.pool.allocate(bank) {
                    Some(reg) => {
                        self.registers_allocated += 1;
                        Storage::Reg(reg)
                    }
                    // The value already sits in its home (or caller stack)
                    // slot; reading it from there costs no new slot.
                    None => Storage::Spill {
                        offset: self.frame.param_offset(index),
                    },
                },
                Node::Binary { lhs, rhs, .. } => {
                    self.uses[lhs.index()] -= 1;
                    self.uses[rhs.index()] -= 1;

                    // Two-address form computes in the destination, so a
                    // dying lhs register is taken over outright.
                    if let Some(reg) = self.reusable_reg(lhs, bank) {
                        self.release_if_dead(rhs, Some(reg));
                        Storage::Reg(reg)
                    } else {
                        // Allocate before releasing: the destination must
                        // not alias a still-unread operand register.
                        let dst = self.fresh_location(bank)?;
                        let except = match dst {
                            Storage::Reg(r) => Some(r),
                            _ => None,
                        };
                        self.release_if_dead(lhs, except);
                        self.release_if_dead(rhs, except);
                        dst
                    }
                }
                Node::Unary { operand, .. } | Node::Cast { operand, .. } => {
                    self.uses[operand.index()] -= 1;
                    if let Some(reg) = self.reusable_reg(operand, bank) {
                        Storage::Reg(reg)
                    } else {
                        let dst = self.fresh_location(bank)?;
                        let except = match dst {
                            Storage::Reg(r) => Some(r),
                            _ => None,
                        };
                        self.release_if_dead(operand, except);
                        dst
                    }
                }
            };

            self.storages[id.index()] = Some(storage);
        }
        Ok(())
    }

    /// A register or, when the bank is exhausted, a new spill slot.
    fn fresh_location(&mut self, bank: u8) -> JitResult<Storage> {
        match self.pool.allocate(bank) {
            Some(reg) => {
                self.registers_allocated += 1;
                Ok(Storage::Reg(reg))
            }
            None => Ok(Storage::Spill {
                offset: self.frame.allocate_spill_slot()?,
            }),
        }
    }

    /// The operand's register, if this was its last use and the bank fits.
    fn reusable_reg(&self, operand: NodeId, bank: u8) -> Option<AsmReg> {
        if self.uses[operand.index()] != 0 {
            return None;
        }
        match self.storages[operand.index()] {
            Some(Storage::Reg(reg)) if reg.bank == bank => Some(reg),
            _ => None,
        }
    }

    fn release_if_dead(&mut self, id: NodeId, except: Option<AsmReg>) {
        if self.uses[id.index()] != 0 {
            return;
        }
        if let Some(Storage::Reg(reg)) = self.storages[id.index()] {
            if Some(reg) != except {
                self.pool.free(reg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BinaryOp;

    #[test]
    fn test_schedule_is_post_order() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[ValueType::I64, ValueType::I64]);
        let a = graph.parameter(0).unwrap();
        let b = graph.parameter(1).unwrap();
        let sum = graph.binary(BinaryOp::Add, a, b).unwrap();

        let alloc = allocate(&arena, &graph, sum, 16).unwrap();
        let pos = |id: NodeId| {
            alloc
                .schedule()
                .iter()
                .position(|&x| x == id)
                .unwrap()
        };
        assert_eq!(alloc.schedule().len(), 3);
        assert!(pos(a) < pos(sum));
        assert!(pos(b) < pos(sum));
        alloc.validate(&graph).unwrap();
    }

    #[test]
    fn test_binary_reuses_dying_lhs_register() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[ValueType::I64, ValueType::I64]);
        let a = graph.parameter(0).unwrap();
        let b = graph.parameter(1).unwrap();
        let sum = graph.binary(BinaryOp::Add, a, b).unwrap();

        let alloc = allocate(&arena, &graph, sum, 16).unwrap();
        let a_reg = match alloc.storage(a).unwrap() {
            Storage::Reg(r) => r,
            s => panic!("unexpected {s:?}"),
        };
        assert_eq!(alloc.storage(sum).unwrap(), Storage::Reg(a_reg));
    }

    #[test]
    fn test_shared_node_scheduled_once_and_kept_alive() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[ValueType::I64, ValueType::I64]);
        let a = graph.parameter(0).unwrap();
        let b = graph.parameter(1).unwrap();
        let product = graph.binary(BinaryOp::Mul, a, b).unwrap();
        let sum = graph.binary(BinaryOp::Add, product, product).unwrap();

        let alloc = allocate(&arena, &graph, sum, 16).unwrap();
        let occurrences = alloc
            .schedule()
            .iter()
            .filter(|&&id| id == product)
            .count();
        assert_eq!(occurrences, 1);
        // x + x takes over x's register.
        let prod_reg = match alloc.storage(product).unwrap() {
            Storage::Reg(r) => r,
            s => panic!("unexpected {s:?}"),
        };
        assert_eq!(alloc.storage(sum).unwrap(), Storage::Reg(prod_reg));
    }

    #[test]
    fn test_constant_classification() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[]);
        let small = graph.imm_i64(-7);
        let wide = graph.imm_i64(1 << 40);
        let float = graph.imm_f64(1.5);

        let p = graph.binary(BinaryOp::Add, small, wide).unwrap();
        let alloc = allocate(&arena, &graph, p, 16).unwrap();
        assert_eq!(alloc.storage(small).unwrap(), Storage::ImmInline(-7));
        assert!(matches!(alloc.storage(wide).unwrap(), Storage::Reg(_)));

        let q = graph.binary(BinaryOp::Add, float, float).unwrap();
        let alloc = allocate(&arena, &graph, q, 16).unwrap();
        assert_eq!(alloc.storage(float).unwrap(), Storage::RipConst);
    }

    #[test]
    fn test_registers_released_at_last_use() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[ValueType::I64; 2]);
        let a = graph.parameter(0).unwrap();
        let b = graph.parameter(1).unwrap();
        // ((a+b)+(a+b)) evaluated as a chain; peak demand stays small.
        let s1 = graph.binary(BinaryOp::Add, a, b).unwrap();
        let s2 = graph.binary(BinaryOp::Add, s1, s1).unwrap();

        let alloc = allocate(&arena, &graph, s2, 16).unwrap();
        assert_eq!(alloc.spill_count(), 0);
        // a, b each take one register; everything else reuses them.
        assert_eq!(alloc.registers_allocated(), 2);
    }

    #[test]
    fn test_deep_tree_spills_and_stays_valid() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[]);

        // A balanced tree of register-demanding leaves: depth 8 weighs 9,
        // past the seven allocatable general-purpose registers.
        let mut layer: Vec<NodeId> = (0..256)
            .map(|i| graph.imm_i64((1 << 40) + i))
            .collect();
        while layer.len() > 1 {
            layer = layer
                .chunks(2)
                .map(|pair| graph.binary(BinaryOp::Add, pair[0], pair[1]).unwrap())
                .collect();
        }

        let alloc = allocate(&arena, &graph, layer[0], 64).unwrap();
        assert!(alloc.spill_count() > 0);
        alloc.validate(&graph).unwrap();
    }

    #[test]
    fn test_spill_capacity_error_propagates() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[]);
        let mut layer: Vec<NodeId> = (0..256)
            .map(|i| graph.imm_i64((1 << 40) + i))
            .collect();
        while layer.len() > 1 {
            layer = layer
                .chunks(2)
                .map(|pair| graph.binary(BinaryOp::Add, pair[0], pair[1]).unwrap())
                .collect();
        }

        assert!(matches!(
            allocate(&arena, &graph, layer[0], 0),
            Err(JitError::SpillCapacity { max: 0 })
        ));
    }

    #[test]
    fn test_float_values_get_xmm_registers() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[ValueType::F64, ValueType::F64]);
        let a = graph.parameter(0).unwrap();
        let b = graph.parameter(1).unwrap();
        let q = graph.binary(BinaryOp::Div, a, b).unwrap();

        let alloc = allocate(&arena, &graph, q, 16).unwrap();
        for id in [a, b, q] {
            match alloc.storage(id).unwrap() {
                Storage::Reg(reg) => {
                    assert_eq!(reg.bank, crate::core::register_file::BANK_XMM)
                }
                s => panic!("unexpected {s:?}"),
            }
        }
        alloc.validate(&graph).unwrap();
    }

    #[test]
    fn test_missing_assignment_for_unscheduled_node() {
        let arena = Bump::new();
        let mut graph = ExprGraph::new(&arena, &[]);
        let used = graph.imm_i64(1 << 40);
        let orphan = graph.imm_i64(2 << 40);

        let root = graph.binary(BinaryOp::Add, used, used).unwrap();
        let alloc = allocate(&arena, &graph, root, 16).unwrap();
        assert_eq!(
            alloc.storage(orphan),
            Err(JitError::MissingAssignment {
                node: orphan.id()
            })
        );
    }
}
