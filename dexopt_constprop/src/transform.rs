//! Applying constant-propagation results to the code
//!
//! The transform walks the CFG once, carrying the intraprocedural entry
//! state through each block, and queues every rewrite it finds: constants
//! to materialize, branches that always or never fire, switches with a
//! known scrutinee, redundant puts, trivially forwardable targets, and
//! dereferences of a proven null. All queued changes are applied
//! atomically after the walk; edge deletions and additions are batched
//! so the analysis stays valid while it is being consumed.

use crate::analyzer::InstructionAnalyzerCombiner;
use crate::domain::{ConstantEnvironment, ConstantValue};
use crate::intra::IntraFixpointIterator;
use crate::whole_program::WholeProgramState;
use dexopt_analysis::domains::AbstractDomain;
use dexopt_common::PassStats;
use dexopt_ir::cfg::{Cfg, CfgMutation, EdgeId, EdgeType};
use dexopt_ir::{refs, BlockId, IrInstruction, ItemId, Opcode, OpcodeGroup, Reg};

#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub replace_moves_with_consts: bool,
    pub fold_branches: bool,
    pub forward_targets: bool,
    pub remove_redundant_puts: bool,
    pub synthesize_npe_throws: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            replace_moves_with_consts: true,
            fold_branches: true,
            forward_targets: true,
            remove_redundant_puts: true,
            synthesize_npe_throws: true,
        }
    }
}

#[derive(Default)]
struct Changes {
    mutation: CfgMutation,
    edge_deletes: Vec<EdgeId>,
    redirects: Vec<(EdgeId, BlockId)>,
    npes: Vec<(ItemId, String)>,
}

/// One transform run over one method.
pub struct Transform {
    config: TransformConfig,
    stats: PassStats,
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(TransformConfig::default())
    }
}

impl Transform {
    pub fn new(config: TransformConfig) -> Self {
        Self { config, stats: PassStats::new() }
    }

    pub fn stats(&self) -> &PassStats {
        &self.stats
    }

    /// Runs the analysis with `combiner` from `init` and applies every
    /// applicable rewrite to the graph.
    pub fn apply(
        &mut self,
        cfg: &mut Cfg,
        combiner: InstructionAnalyzerCombiner<'_>,
        wps: &WholeProgramState,
        init: ConstantEnvironment,
    ) -> PassStats {
        let changes = {
            let mut fixpoint = IntraFixpointIterator::new(cfg, combiner);
            fixpoint.run(init);
            self.collect_changes(cfg, &fixpoint, wps)
        };
        self.apply_changes(cfg, changes);
        let removed = cfg.remove_unreachable_blocks();
        self.stats.unreachable_instructions_removed += removed;
        cfg.simplify();
        self.stats.clone()
    }

    fn collect_changes(
        &mut self,
        cfg: &Cfg,
        fixpoint: &IntraFixpointIterator<'_, '_>,
        wps: &WholeProgramState,
    ) -> Changes {
        let mut changes = Changes::default();
        for b in cfg.block_ids() {
            let mut env = fixpoint.entry_state_at(b);
            if env.is_bottom() {
                // Unreachable; the blocks feeding it fold their branches
                // and simplify sweeps it away.
                continue;
            }
            let mut npe_fired = false;
            for id in cfg.block(b).items.insn_ids(&cfg.arena) {
                let insn = cfg.arena.insn(id);
                if self.config.synthesize_npe_throws {
                    if let Some(message) = null_dereference(insn, &env) {
                        changes.npes.push((id, message));
                        self.stats.throws_synthesized += 1;
                        npe_fired = true;
                        // Everything after the throw is unreachable.
                        break;
                    }
                }
                self.simplify_instruction(cfg, b, id, insn, &env, wps, fixpoint, &mut changes);
                fixpoint.analyze_instruction(id, insn, &mut env);
            }
            if npe_fired {
                continue;
            }
            if self.config.fold_branches {
                self.fold_branch(cfg, b, &env, &mut changes);
            }
        }
        if self.config.forward_targets {
            self.forward_targets(cfg, fixpoint, &mut changes);
        }
        changes
    }

    #[allow(clippy::too_many_arguments)]
    fn simplify_instruction(
        &mut self,
        cfg: &Cfg,
        b: BlockId,
        id: ItemId,
        insn: &IrInstruction,
        env: &ConstantEnvironment,
        wps: &WholeProgramState,
        fixpoint: &IntraFixpointIterator<'_, '_>,
        changes: &mut Changes,
    ) {
        let op = insn.opcode();

        if self.config.remove_redundant_puts {
            match op.group() {
                OpcodeGroup::Sput => {
                    let stored = env.get(insn.src(0));
                    let known = wps.get_field_value(insn.field());
                    if let (Some(a), Some(c)) = (stored.get_constant(), known.get_constant()) {
                        if a == c {
                            changes.mutation.remove(id);
                            self.stats.redundant_puts_removed += 1;
                            return;
                        }
                    }
                }
                OpcodeGroup::Aput => {
                    let stored = env.get(insn.src(0)).as_signed();
                    let idx = env.get(insn.src(2)).as_signed().get_constant();
                    if let (Some(a), Some(idx)) = (stored.get_constant(), idx) {
                        if idx >= 0
                            && env.get_array(insn.src(1)).get(idx as u32).get_constant()
                                == Some(a)
                        {
                            changes.mutation.remove(id);
                            self.stats.redundant_puts_removed += 1;
                            return;
                        }
                    }
                }
                _ => {}
            }
        }

        if op == Opcode::InstanceOf {
            if let Some((_, result)) = self.eval_instance_of(insn, env) {
                if let Some((_, mrp)) = cfg.move_result_of(b, id) {
                    let dest = cfg.arena.insn(mrp).dest();
                    changes.mutation.replace(
                        id,
                        vec![IrInstruction::new(Opcode::Const)
                            .with_dest(dest)
                            .with_literal(result)],
                    );
                    self.stats.materialized_consts += 1;
                    return;
                }
            }
        }

        if self.config.replace_moves_with_consts {
            self.replace_with_const(id, insn, env, fixpoint, changes);
        }
    }

    /// The write-backs of an instruction that produced a value the
    /// analysis already knows: substitute the appropriate const form.
    fn replace_with_const(
        &mut self,
        id: ItemId,
        insn: &IrInstruction,
        env: &ConstantEnvironment,
        fixpoint: &IntraFixpointIterator<'_, '_>,
        changes: &mut Changes,
    ) {
        let op = insn.opcode();
        // Only plain value-producing opcodes are eligible: constants are
        // already constants, parameter loads are the ABI, and pseudos
        // belong to their primary instruction.
        let eligible = matches!(
            op.group(),
            OpcodeGroup::Move
                | OpcodeGroup::Unop
                | OpcodeGroup::Binop
                | OpcodeGroup::BinopLit
                | OpcodeGroup::Cmp
        ) && insn.has_dest();
        if !eligible {
            return;
        }
        let mut after = env.clone();
        fixpoint.analyze_instruction(id, insn, &mut after);
        if after.is_bottom() {
            return;
        }
        let dest = insn.dest();
        match after.get(dest) {
            ConstantValue::SignedConstant(s) => {
                if let Some(value) = s.get_constant() {
                    let const_op =
                        if insn.dest_is_wide() { Opcode::ConstWide } else { Opcode::Const };
                    let replacement =
                        IrInstruction::new(const_op).with_dest(dest).with_literal(value);
                    if *insn != replacement {
                        changes.mutation.replace(id, vec![replacement]);
                        self.stats.materialized_consts += 1;
                    }
                }
            }
            ConstantValue::String(s) if op.group() == OpcodeGroup::Move => {
                changes.mutation.replace(
                    id,
                    vec![
                        IrInstruction::new(Opcode::ConstString).with_string(s),
                        IrInstruction::new(Opcode::MoveResultPseudoObject).with_dest(dest),
                    ],
                );
                self.stats.materialized_consts += 1;
            }
            ConstantValue::Class(t) if op.group() == OpcodeGroup::Move => {
                changes.mutation.replace(
                    id,
                    vec![
                        IrInstruction::new(Opcode::ConstClass).with_type(t),
                        IrInstruction::new(Opcode::MoveResultPseudoObject).with_dest(dest),
                    ],
                );
                self.stats.materialized_consts += 1;
            }
            _ => {}
        }
    }

    fn eval_instance_of(
        &self,
        insn: &IrInstruction,
        env: &ConstantEnvironment,
    ) -> Option<(Reg, i64)> {
        let value = env.get(insn.src(0));
        if value.get_constant() == Some(0) {
            // instance-of on null is always false.
            return Some((insn.src(0), 0));
        }
        if let Some(obj) = value.as_new_object() {
            if obj.object_type == insn.type_ref() {
                return Some((insn.src(0), 1));
            }
        }
        None
    }

    fn fold_branch(&mut self, cfg: &Cfg, b: BlockId, env: &ConstantEnvironment, changes: &mut Changes) {
        let Some(last) = cfg.last_insn(b) else { return };
        let insn = cfg.arena.insn(last);
        let op = insn.opcode();
        if op.is_conditional_branch() {
            let Some(taken) = eval_conditional(insn, env) else {
                return;
            };
            if env.get(insn.src(0)).is_object_like() {
                self.stats.null_checks_removed += 1;
            }
            if taken {
                // The fallthrough is dead; the surviving branch edge
                // becomes the goto when the deletion cleans up.
                if let Some(goto) = cfg.succ_edge_of_type(b, EdgeType::Goto) {
                    changes.edge_deletes.push(goto);
                }
            } else {
                for e in cfg.succ_edges_of_type(b, EdgeType::Branch) {
                    changes.edge_deletes.push(e);
                }
            }
            self.stats.branches_removed += 1;
        } else if op.is_switch() {
            let Some(k) = env.get(insn.src(0)).get_constant() else {
                return;
            };
            let arms = cfg.succ_edges_of_type(b, EdgeType::Branch);
            let matching = arms.iter().copied().find(|e| {
                matches!(
                    cfg.edge(*e).kind,
                    dexopt_ir::EdgeKind::Branch { case_key: Some(key) } if key as i64 == k
                )
            });
            for e in arms {
                if Some(e) != matching {
                    changes.edge_deletes.push(e);
                }
            }
            if matching.is_some() {
                if let Some(goto) = cfg.succ_edge_of_type(b, EdgeType::Goto) {
                    changes.edge_deletes.push(goto);
                }
            }
            self.stats.branches_removed += 1;
        }
    }

    /// An edge into a block that holds nothing but a conditional branch
    /// can skip it when the incoming state already decides the branch.
    fn forward_targets(
        &mut self,
        cfg: &Cfg,
        fixpoint: &IntraFixpointIterator<'_, '_>,
        changes: &mut Changes,
    ) {
        for b in cfg.block_ids() {
            for e in cfg.succs(b) {
                let edge = cfg.edge(e);
                if !matches!(edge.kind.edge_type(), EdgeType::Goto | EdgeType::Branch) {
                    continue;
                }
                let s = edge.tgt;
                if s == b {
                    continue;
                }
                // Forwarding is only sound when the intermediate block
                // computes nothing.
                let insns = cfg.block(s).items.insn_ids(&cfg.arena);
                if insns.len() != 1 {
                    continue;
                }
                let branch = cfg.arena.insn(insns[0]);
                if !branch.opcode().is_conditional_branch() {
                    continue;
                }
                let state = fixpoint.analyze_edge(e, &fixpoint.exit_state_at(b));
                if state.is_bottom() {
                    continue;
                }
                let Some(taken) = eval_conditional(branch, &state) else {
                    continue;
                };
                let skip_to = if taken {
                    cfg.succ_edge_of_type(s, EdgeType::Branch).map(|be| cfg.edge(be).tgt)
                } else {
                    cfg.goto_target(s)
                };
                if let Some(target) = skip_to {
                    changes.redirects.push((e, target));
                    self.stats.branches_forwarded += 1;
                }
            }
        }
    }

    fn apply_changes(&mut self, cfg: &mut Cfg, changes: Changes) {
        changes.mutation.apply(cfg);
        for e in changes.edge_deletes {
            cfg.delete_edge(e);
        }
        for (e, target) in changes.redirects {
            cfg.set_edge_target(e, target);
        }
        if !changes.npes.is_empty() {
            let npe = NpeCreator::new(cfg);
            for (anchor, message) in changes.npes {
                let Some((block, _)) = cfg
                    .instructions()
                    .into_iter()
                    .find(|(_, id)| *id == anchor)
                else {
                    continue;
                };
                let insns = npe.get_insns(&message);
                cfg.insert_before(block, anchor, insns);
            }
        }
    }
}

/// Builds the instruction sequence that raises a NullPointerException
/// naming the member whose access was proven to fail. The two temp
/// registers are reserved once per graph and reused across sites.
struct NpeCreator {
    string_reg: Reg,
    exception_reg: Reg,
    npe_type: dexopt_ir::TypeId,
    npe_init: dexopt_ir::MethodId,
}

impl NpeCreator {
    fn new(cfg: &mut Cfg) -> Self {
        Self {
            string_reg: cfg.allocate_temp(),
            exception_reg: cfg.allocate_temp(),
            npe_type: refs::make_type("Ljava/lang/NullPointerException;"),
            npe_init: refs::make_method_desc(
                "Ljava/lang/NullPointerException;.<init>:(Ljava/lang/String;)V",
            ),
        }
    }

    fn get_insns(&self, message: &str) -> Vec<IrInstruction> {
        vec![
            IrInstruction::new(Opcode::ConstString).with_string(refs::make_string(message)),
            IrInstruction::new(Opcode::MoveResultPseudoObject).with_dest(self.string_reg),
            IrInstruction::new(Opcode::NewInstance).with_type(self.npe_type),
            IrInstruction::new(Opcode::MoveResultPseudoObject).with_dest(self.exception_reg),
            IrInstruction::new(Opcode::InvokeDirect)
                .with_method(self.npe_init)
                .with_srcs([self.exception_reg, self.string_reg]),
            IrInstruction::new(Opcode::Throw).with_src(self.exception_reg),
        ]
    }
}

/// The receiver register an instruction dereferences, if any.
fn dereferenced_register(insn: &IrInstruction) -> Option<Reg> {
    use OpcodeGroup::*;
    match insn.opcode().group() {
        Iget | ArrayLength | Aget | Monitor => Some(insn.src(0)),
        Iput | Aput => Some(insn.src(1)),
        Invoke if insn.opcode() != Opcode::InvokeStatic => Some(insn.src(0)),
        _ => None,
    }
}

/// Some("member name") when the instruction is proven to throw an NPE.
fn null_dereference(insn: &IrInstruction, env: &ConstantEnvironment) -> Option<String> {
    let reg = dereferenced_register(insn)?;
    if env.get(reg).get_constant() != Some(0) {
        return None;
    }
    let message = if insn.has_field() {
        refs::string(refs::field(insn.field()).name).to_string()
    } else if insn.has_method() {
        refs::string(refs::method(insn.method()).name).to_string()
    } else if matches!(insn.opcode().group(), OpcodeGroup::Aget | OpcodeGroup::Aput) {
        "array access".to_string()
    } else {
        // No member to name; show the opcode mnemonic instead, e.g.
        // "monitor-enter".
        opcode_mnemonic(insn.opcode())
    };
    Some(message)
}

fn opcode_mnemonic(op: Opcode) -> String {
    let mut mnemonic = String::new();
    for c in format!("{:?}", op).chars() {
        if c.is_ascii_uppercase() {
            if !mnemonic.is_empty() {
                mnemonic.push('-');
            }
            mnemonic.push(c.to_ascii_lowercase());
        } else {
            mnemonic.push(c);
        }
    }
    mnemonic
}

/// Whether a two-way branch is decided by the environment, and which way.
fn eval_conditional(insn: &IrInstruction, env: &ConstantEnvironment) -> Option<bool> {
    use Opcode::*;
    let op = insn.opcode();
    let left = env.get(insn.src(0));
    let l = left.as_signed();
    if l.is_bottom() {
        return None;
    }
    let (min, max) = (l.min_element(), l.max_element());
    match op {
        IfEqz => zero_test(&l),
        IfNez => zero_test(&l).map(|t| !t),
        IfLtz => decide(max < 0, min >= 0),
        IfGez => decide(min >= 0, max < 0),
        IfGtz => decide(min > 0, max <= 0),
        IfLez => decide(max <= 0, min > 0),
        IfEq | IfNe => {
            let right = env.get(insn.src(1));
            let eq = runtime_equals(&left, &right)?;
            Some(if op == IfEq { eq } else { !eq })
        }
        IfLt | IfGe | IfGt | IfLe => {
            let r = env.get(insn.src(1)).as_signed();
            if r.is_bottom() {
                return None;
            }
            let lt = if l.max_element() < r.min_element() {
                Some(true)
            } else if l.min_element() >= r.max_element() {
                Some(false)
            } else {
                None
            };
            let le = if l.max_element() <= r.min_element() {
                Some(true)
            } else if l.min_element() > r.max_element() {
                Some(false)
            } else {
                None
            };
            match op {
                IfLt => lt,
                IfGe => lt.map(|t| !t),
                IfLe => le,
                IfGt => le.map(|t| !t),
                _ => unreachable!(),
            }
        }
        _ => None,
    }
}

fn zero_test(s: &dexopt_analysis::domains::SignedConstantDomain) -> Option<bool> {
    if s.get_constant() == Some(0) {
        Some(true)
    } else if s.is_nez() {
        Some(false)
    } else {
        None
    }
}

fn decide(always: bool, never: bool) -> Option<bool> {
    if always {
        Some(true)
    } else if never {
        Some(false)
    } else {
        None
    }
}

/// Runtime equality of two abstract values, when decidable. Note that
/// this is a different relation from the lattice's `equals`: two values
/// both approximating "some positive int" are lattice-equal but their
/// runtime incarnations may differ.
fn runtime_equals(left: &ConstantValue, right: &ConstantValue) -> Option<bool> {
    use ConstantValue::*;
    match (left, right) {
        (SignedConstant(a), SignedConstant(b)) => {
            match (a.get_constant(), b.get_constant()) {
                (Some(x), Some(y)) => Some(x == y),
                _ => {
                    // Disjoint ranges can still decide inequality.
                    if a.max_element() < b.min_element() || b.max_element() < a.min_element() {
                        Some(false)
                    } else {
                        None
                    }
                }
            }
        }
        (String(a), String(b)) => Some(a == b),
        (SingletonObject(a), SingletonObject(b)) => Some(a == b),
        // A known object against null.
        (v, SignedConstant(s)) | (SignedConstant(s), v) if v.is_object_like() => {
            if s.get_constant() == Some(0) {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}
