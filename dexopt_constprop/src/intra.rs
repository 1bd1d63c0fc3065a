//! The intraprocedural constant-propagation fixpoint
//!
//! Runs the analyzer chain over one method's CFG. The edge transformer is
//! where branches earn their keep: traversing the taken arm of `if-eqz v`
//! meets `v` with zero, the fallthrough meets it with not-zero, and a
//! switch arm meets the scrutinee with its case key. A contradiction
//! collapses the environment to bottom and the arm is dead.

use crate::analyzer::InstructionAnalyzerCombiner;
use crate::domain::{ConstantEnvironment, ConstantValue};
use dexopt_analysis::domains::{AbstractDomain, SignedConstantDomain};
use dexopt_analysis::{FixpointTransfer, MonotonicFixpointIterator};
use dexopt_ir::cfg::{Cfg, EdgeId, EdgeKind};
use dexopt_ir::{BlockId, IrInstruction, ItemId, Opcode, Reg};

pub struct IntraTransfer<'c> {
    combiner: InstructionAnalyzerCombiner<'c>,
}

impl FixpointTransfer<Cfg, ConstantEnvironment> for IntraTransfer<'_> {
    fn analyze_node(&self, cfg: &Cfg, block: BlockId, state: &mut ConstantEnvironment) {
        for id in cfg.block(block).items.insn_ids(&cfg.arena) {
            self.combiner.run(id, cfg.arena.insn(id), state);
        }
    }

    fn analyze_edge(
        &self,
        cfg: &Cfg,
        edge: &EdgeId,
        exit_state_at_source: &ConstantEnvironment,
    ) -> ConstantEnvironment {
        let mut env = exit_state_at_source.clone();
        if env.is_bottom() {
            return env;
        }
        let e = cfg.edge(*edge);
        let Some(last) = cfg.last_insn(e.src) else {
            return env;
        };
        let insn = cfg.arena.insn(last);
        let op = insn.opcode();
        if op.is_conditional_branch() {
            let taken = matches!(e.kind, EdgeKind::Branch { .. });
            if matches!(e.kind, EdgeKind::Branch { .. } | EdgeKind::Goto) {
                refine_condition(&mut env, insn, taken);
            }
        } else if op.is_switch() {
            if let EdgeKind::Branch { case_key: Some(k) } = e.kind {
                let scrutinee = insn.src(0);
                let refined = env.get(scrutinee).meet(&ConstantValue::constant(k as i64));
                env.set(scrutinee, refined);
            }
            // The switch fallthrough stays unrefined: expressing "none of
            // the keys" is beyond the interval domain.
        }
        env
    }
}

/// Applies the constraint of a two-way branch to the environment.
fn refine_condition(env: &mut ConstantEnvironment, insn: &IrInstruction, taken: bool) {
    use Opcode::*;
    match (insn.opcode(), taken) {
        (IfEqz, true) | (IfNez, false) => meet_signed(env, insn.src(0), SignedConstantDomain::new(0)),
        (IfEqz, false) | (IfNez, true) => meet_signed(env, insn.src(0), SignedConstantDomain::nez()),
        (IfLtz, true) | (IfGez, false) => {
            meet_signed(env, insn.src(0), SignedConstantDomain::from_range(i64::MIN, -1))
        }
        (IfLtz, false) | (IfGez, true) => {
            meet_signed(env, insn.src(0), SignedConstantDomain::from_range(0, i64::MAX))
        }
        (IfGtz, true) | (IfLez, false) => {
            meet_signed(env, insn.src(0), SignedConstantDomain::from_range(1, i64::MAX))
        }
        (IfGtz, false) | (IfLez, true) => {
            meet_signed(env, insn.src(0), SignedConstantDomain::from_range(i64::MIN, 0))
        }
        (IfEq, true) | (IfNe, false) => refine_equal(env, insn.src(0), insn.src(1)),
        (IfEq, false) | (IfNe, true) => refine_not_equal(env, insn.src(0), insn.src(1)),
        (IfLt, true) | (IfGe, false) => refine_less(env, insn.src(0), insn.src(1), true),
        (IfGe, true) | (IfLt, false) => refine_less(env, insn.src(1), insn.src(0), false),
        (IfGt, true) | (IfLe, false) => refine_less(env, insn.src(1), insn.src(0), true),
        (IfLe, true) | (IfGt, false) => refine_less(env, insn.src(0), insn.src(1), false),
        _ => {}
    }
}

fn meet_signed(env: &mut ConstantEnvironment, reg: Reg, constraint: SignedConstantDomain) {
    let refined = env.get(reg).meet(&ConstantValue::signed(constraint));
    env.set(reg, refined);
}

/// On equality both registers hold the same runtime value, so each is
/// refined by the other.
fn refine_equal(env: &mut ConstantEnvironment, left: Reg, right: Reg) {
    let l = env.get(left);
    let r = env.get(right);
    let met = l.clone().meet(&r);
    env.set(left, met.clone());
    env.set(right, met);
}

/// Inequality is only expressible against zero.
fn refine_not_equal(env: &mut ConstantEnvironment, left: Reg, right: Reg) {
    if env.get(right).get_constant() == Some(0) {
        meet_signed(env, left, SignedConstantDomain::nez());
    }
    if env.get(left).get_constant() == Some(0) {
        meet_signed(env, right, SignedConstantDomain::nez());
    }
}

/// `left < right` (strict) or `left <= right`: shrink both intervals
/// toward each other.
fn refine_less(env: &mut ConstantEnvironment, left: Reg, right: Reg, strict: bool) {
    let l = env.get(left).as_signed();
    let r = env.get(right).as_signed();
    if l.is_bottom() || r.is_bottom() {
        return;
    }
    let gap = strict as i64;
    let left_max = r.max_element().saturating_sub(gap);
    let right_min = l.min_element().saturating_add(gap);
    meet_signed(env, left, SignedConstantDomain::from_range(i64::MIN, left_max));
    meet_signed(env, right, SignedConstantDomain::from_range(right_min, i64::MAX));
}

/// The intraprocedural fixpoint iterator over one CFG.
pub struct IntraFixpointIterator<'g, 'c> {
    inner: MonotonicFixpointIterator<'g, Cfg, ConstantEnvironment, IntraTransfer<'c>>,
}

impl<'g, 'c> IntraFixpointIterator<'g, 'c> {
    pub fn new(cfg: &'g Cfg, combiner: InstructionAnalyzerCombiner<'c>) -> Self {
        Self {
            inner: MonotonicFixpointIterator::new(cfg, IntraTransfer { combiner }),
        }
    }

    pub fn run(&mut self, init: ConstantEnvironment) {
        self.inner.run(init);
    }

    pub fn entry_state_at(&self, b: BlockId) -> ConstantEnvironment {
        self.inner.entry_state_at(b)
    }

    pub fn exit_state_at(&self, b: BlockId) -> ConstantEnvironment {
        self.inner.exit_state_at(b)
    }

    /// Replays the transfer of a single instruction; used by the
    /// transform walk to carry the state through a block.
    pub fn analyze_instruction(
        &self,
        item: ItemId,
        insn: &IrInstruction,
        env: &mut ConstantEnvironment,
    ) {
        self.inner.transfer().combiner.run(item, insn, env);
    }

    /// Exposes the edge refinement; target forwarding uses this to
    /// evaluate a successor's branch under a particular incoming edge.
    pub fn analyze_edge(&self, edge: EdgeId, state: &ConstantEnvironment) -> ConstantEnvironment {
        self.inner.transfer().analyze_edge(self.inner.graph(), &edge, state)
    }
}

/// An environment populated with the method's parameter values: the
/// i-th load-param gets the i-th argument binding.
pub fn env_with_params(cfg: &Cfg, args: &crate::domain::ArgumentDomain) -> ConstantEnvironment {
    let mut env = ConstantEnvironment::top();
    for (i, item) in cfg.param_insns().into_iter().enumerate() {
        let dest = cfg.arena.insn(item).dest();
        env.set(dest, args.get(i as u32));
    }
    env
}

/// The join of the abstract value returned from every return site.
/// Bottom means the method never returns normally.
pub fn collect_return_state(
    cfg: &Cfg,
    fixpoint: &IntraFixpointIterator<'_, '_>,
) -> ConstantValue {
    let mut state = ConstantValue::bottom();
    for b in cfg.block_ids() {
        let mut env = fixpoint.entry_state_at(b);
        for id in cfg.block(b).items.insn_ids(&cfg.arena) {
            let insn = cfg.arena.insn(id);
            if insn.opcode().is_return() && insn.srcs_size() > 0 && !env.is_bottom() {
                state.join_with(&env.get(insn.src(0)));
            }
            fixpoint.analyze_instruction(id, insn, &mut env);
        }
    }
    state
}
