//! Reaching definitions
//!
//! A forward analysis mapping each register to the set of instructions
//! that may have defined its current value. Definitions are represented
//! by the identity of the defining instruction item. The primary client
//! is live-range renumbering, which unions every pair of defs that share
//! a use.

use crate::cfg::{BlockId, Cfg};
use crate::instruction::IrInstruction;
use crate::item::ItemId;
use dexopt_analysis::domains::{AbstractDomain, PatriciaTreeMapEnvironment, PatriciaTreeSet};
use dexopt_analysis::{FixpointTransfer, MonotonicFixpointIterator};
use hashbrown::HashMap;

/// The set of instruction items that may define a register: an
/// unconstrained register (no def seen) is top, and the sets join by
/// union.
#[derive(Debug, Clone, PartialEq)]
pub enum DefsDomain {
    Bottom,
    Defs(PatriciaTreeSet),
    Top,
}

impl DefsDomain {
    pub fn singleton(def: ItemId) -> Self {
        DefsDomain::Defs(PatriciaTreeSet::singleton(def.0))
    }

    /// The defining items, empty for bottom. Asserts on top: a use whose
    /// def set is unconstrained has no def at all, which well-formed
    /// input never produces.
    pub fn elements(&self) -> Vec<ItemId> {
        match self {
            DefsDomain::Bottom => Vec::new(),
            DefsDomain::Defs(set) => set.elements().map(ItemId).collect(),
            DefsDomain::Top => panic!("use without a reaching def"),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, DefsDomain::Defs(_))
    }
}

impl AbstractDomain for DefsDomain {
    fn bottom() -> Self {
        DefsDomain::Bottom
    }

    fn top() -> Self {
        DefsDomain::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, DefsDomain::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, DefsDomain::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        match (self, other) {
            (DefsDomain::Bottom, _) => true,
            (_, DefsDomain::Top) => true,
            (DefsDomain::Defs(a), DefsDomain::Defs(b)) => a.is_subset(b),
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        match (&mut *self, other) {
            (_, DefsDomain::Bottom) => {}
            (DefsDomain::Bottom, _) => *self = other.clone(),
            (DefsDomain::Top, _) => {}
            (_, DefsDomain::Top) => *self = DefsDomain::Top,
            (DefsDomain::Defs(a), DefsDomain::Defs(b)) => a.union_with(b),
        }
    }

    fn meet_with(&mut self, other: &Self) {
        match (&mut *self, other) {
            (_, DefsDomain::Top) => {}
            (DefsDomain::Top, _) => *self = other.clone(),
            (DefsDomain::Bottom, _) => {}
            (_, DefsDomain::Bottom) => *self = DefsDomain::Bottom,
            (DefsDomain::Defs(a), DefsDomain::Defs(b)) => {
                let intersection: PatriciaTreeSet =
                    a.elements().filter(|e| b.contains(*e)).collect();
                *a = intersection;
            }
        }
    }
}

pub type ReachingDefsEnvironment = PatriciaTreeMapEnvironment<DefsDomain>;

struct ReachingDefsTransfer;

impl FixpointTransfer<Cfg, ReachingDefsEnvironment> for ReachingDefsTransfer {
    fn analyze_node(&self, cfg: &Cfg, block: BlockId, state: &mut ReachingDefsEnvironment) {
        for id in cfg.block(block).items.insn_ids(&cfg.arena) {
            analyze_instruction(id, cfg.arena.insn(id), state);
        }
    }
}

/// The per-instruction transfer function: a def kills every previous def
/// of its register.
pub fn analyze_instruction(item: ItemId, insn: &IrInstruction, env: &mut ReachingDefsEnvironment) {
    if insn.has_dest() {
        env.set(insn.dest(), DefsDomain::singleton(item));
    }
}

/// Per-block entry states of the reaching-definitions analysis.
pub struct ReachingDefinitions {
    entry: HashMap<BlockId, ReachingDefsEnvironment>,
}

impl ReachingDefinitions {
    pub fn analyze(cfg: &Cfg) -> ReachingDefinitions {
        let mut fixpoint = MonotonicFixpointIterator::new(cfg, ReachingDefsTransfer);
        fixpoint.run(ReachingDefsEnvironment::top());
        let entry = cfg
            .block_ids()
            .into_iter()
            .map(|b| (b, fixpoint.entry_state_at(b)))
            .collect();
        ReachingDefinitions { entry }
    }

    pub fn entry_state_at(&self, b: BlockId) -> ReachingDefsEnvironment {
        self.entry.get(&b).cloned().unwrap_or_else(ReachingDefsEnvironment::bottom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::IrCode;
    use crate::opcode::Opcode;

    #[test]
    fn test_def_kills_previous_def() {
        let mut env = ReachingDefsEnvironment::top();
        let first = ItemId(1);
        let second = ItemId(2);
        let insn = IrInstruction::new(Opcode::Const).with_dest(0).with_literal(5);
        analyze_instruction(first, &insn, &mut env);
        assert_eq!(env.get(0).elements(), vec![first]);
        analyze_instruction(second, &insn, &mut env);
        assert_eq!(env.get(0).elements(), vec![second]);
    }

    #[test]
    fn test_join_unions_defs() {
        // Two const defs of v0 on different paths both reach the join.
        let mut code = IrCode::new();
        code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
        code.push(IrInstruction::new(Opcode::Return).with_src(0));
        let mut cfg = Cfg::build(code);
        let b0 = cfg.entry_block();
        let join = cfg.create_block();
        cfg.push_back(join, vec![IrInstruction::new(Opcode::Return).with_src(1)]);

        let left = cfg.create_block();
        cfg.push_back(left, vec![
            IrInstruction::new(Opcode::Const).with_dest(1).with_literal(1),
        ]);
        cfg.add_edge(left, join, crate::cfg::EdgeKind::Goto);
        let right = cfg.create_block();
        cfg.push_back(right, vec![
            IrInstruction::new(Opcode::Const).with_dest(1).with_literal(2),
        ]);
        cfg.add_edge(right, join, crate::cfg::EdgeKind::Goto);

        let ret = cfg.last_insn(b0).unwrap();
        cfg.remove_insn(b0, ret);
        cfg.create_branch(
            b0,
            IrInstruction::new(Opcode::IfEqz).with_src(0),
            Some(left),
            vec![(1, right)],
        );

        let defs = ReachingDefinitions::analyze(&cfg);
        let at_join = defs.entry_state_at(join);
        assert_eq!(at_join.get(1).elements().len(), 2);
        assert_eq!(at_join.get(0).elements().len(), 1);
    }
}
