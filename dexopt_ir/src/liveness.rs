//! Liveness analysis over the CFG
//!
//! A backward may-analysis over the powerset of virtual registers: a
//! register is live at a point when some path from that point reads it
//! before writing it. Because may-throw instructions never own their
//! destination (the move-result-pseudo does), the analysis needs no
//! special cases for exceptional control flow.

use crate::cfg::{BlockId, Cfg};
use crate::instruction::IrInstruction;
use dexopt_analysis::domains::{LivenessDomain, PowersetDomain};
use dexopt_analysis::{BackwardsGraph, FixpointTransfer, MonotonicFixpointIterator};
use hashbrown::HashMap;

struct LivenessTransfer;

impl<'a> FixpointTransfer<BackwardsGraph<'a, Cfg>, LivenessDomain> for LivenessTransfer {
    fn analyze_node(
        &self,
        graph: &BackwardsGraph<'a, Cfg>,
        block: BlockId,
        state: &mut LivenessDomain,
    ) {
        let cfg = graph.forward_graph();
        let mut insns = cfg.block(block).items.insn_ids(&cfg.arena);
        insns.reverse();
        for id in insns {
            analyze_instruction(cfg.arena.insn(id), state);
        }
    }
}

/// The per-instruction transfer function, exposed so clients can walk a
/// block backwards from its live-out state (the interference graph
/// builder does this).
pub fn analyze_instruction(insn: &IrInstruction, state: &mut LivenessDomain) {
    if insn.has_dest() {
        state.remove(&insn.dest());
    }
    for &src in insn.srcs() {
        state.add(src);
    }
}

/// The computed result: live registers at block entry and exit.
pub struct Liveness {
    live_in: HashMap<BlockId, LivenessDomain>,
    live_out: HashMap<BlockId, LivenessDomain>,
}

impl Liveness {
    /// Runs the analysis. The CFG must have a calculated exit block.
    pub fn analyze(cfg: &Cfg) -> Liveness {
        let exit = cfg.exit_block().expect("liveness requires a calculated exit block");
        let backwards = BackwardsGraph::new(cfg, exit);
        let mut fixpoint = MonotonicFixpointIterator::new(&backwards, LivenessTransfer);
        fixpoint.run(PowersetDomain::value([]));

        let mut live_in = HashMap::new();
        let mut live_out = HashMap::new();
        for b in cfg.block_ids() {
            // In the backward formulation the iterator's "exit" state of a
            // node is the state before the node runs, i.e. its live-in.
            live_in.insert(b, fixpoint.exit_state_at(b));
            live_out.insert(b, fixpoint.entry_state_at(b));
        }
        Liveness { live_in, live_out }
    }

    pub fn live_in_vars_at(&self, b: BlockId) -> &LivenessDomain {
        &self.live_in[&b]
    }

    pub fn live_out_vars_at(&self, b: BlockId) -> &LivenessDomain {
        &self.live_out[&b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::IrCode;
    use crate::opcode::Opcode;

    #[test]
    fn test_straight_line_liveness() {
        // const v0; const v1; add v2 = v0 + v1; return v2
        let mut code = IrCode::new();
        code.push(IrInstruction::new(Opcode::Const).with_dest(0).with_literal(1));
        code.push(IrInstruction::new(Opcode::Const).with_dest(1).with_literal(2));
        code.push(IrInstruction::new(Opcode::AddInt).with_dest(2).with_srcs([0, 1]));
        code.push(IrInstruction::new(Opcode::Return).with_src(2));
        let mut cfg = Cfg::build(code);
        cfg.calculate_exit_block();

        let liveness = Liveness::analyze(&cfg);
        let entry = cfg.entry_block();
        // Nothing is live on method entry.
        assert!(liveness.live_in_vars_at(entry).is_empty());
    }

    #[test]
    fn test_branch_liveness() {
        // B0: load-param v0; if-eqz v0 -> B2
        // B1: const v1 = 1; return v1
        // B2: return v0
        let mut code = IrCode::new();
        let mut cfg = {
            code.push(IrInstruction::new(Opcode::LoadParam).with_dest(0));
            code.push(IrInstruction::new(Opcode::Return).with_src(0));
            Cfg::build(code)
        };
        let b0 = cfg.entry_block();
        let b1 = cfg.create_block();
        cfg.push_back(b1, vec![
            IrInstruction::new(Opcode::Const).with_dest(1).with_literal(1),
            IrInstruction::new(Opcode::Return).with_src(1),
        ]);
        // Split the entry: delete the return, then branch to b1/b2.
        let b2 = cfg.create_block();
        let ret = cfg.last_insn(b0).unwrap();
        let ret_insn = cfg.arena.insn(ret).clone();
        cfg.remove_insn(b0, ret);
        cfg.push_back(b2, vec![ret_insn]);
        cfg.create_branch(
            b0,
            IrInstruction::new(Opcode::IfEqz).with_src(0),
            Some(b1),
            vec![(1, b2)],
        );
        cfg.calculate_exit_block();

        let liveness = Liveness::analyze(&cfg);
        // v0 is live into the branch block and into the return block.
        assert!(liveness.live_in_vars_at(b2).contains(&0));
        // v1 is local to b1.
        assert!(!liveness.live_out_vars_at(b1).contains(&1));
        assert!(!liveness.live_in_vars_at(b1).contains(&1));
    }
}
