//! Whole-program constant state
//!
//! Flow-insensitive summaries of static field values and method return
//! values, built in two phases: class initializers are analyzed first
//! with only the encoded static values as input, then every method in
//! the scope is walked to join the values stored by each sput (outside
//! its declaring class's clinit) and returned by each return.
//!
//! The summaries live in partitions -- a binding is the *join* over all
//! execution paths reaching the stores/returns -- so a method that never
//! returns stays at bottom without dragging anything else down. The
//! state is read-only once built; outer interprocedural iterations build
//! a fresh one and compare with `leq`.

use crate::analyzer::InstructionAnalyzerCombiner;
use crate::domain::{ConstantEnvironment, ConstantValue};
use crate::intra::{collect_return_state, IntraFixpointIterator};
use dexopt_analysis::domains::{AbstractDomain, HashedAbstractPartition};
use dexopt_ir::cfg::Cfg;
use dexopt_ir::refs::{self, FieldId, MethodId};
use dexopt_ir::scope::{is_clinit, Scope};
use dexopt_ir::Opcode;
use hashbrown::{HashMap, HashSet};
use rayon::prelude::*;

type FieldPartition = HashedAbstractPartition<FieldId, ConstantValue>;
type MethodPartition = HashedAbstractPartition<MethodId, ConstantValue>;

pub struct WholeProgramState {
    field_partition: FieldPartition,
    method_partition: MethodPartition,
    // Fields and methods outside these sets are unknown and read as top.
    known_fields: HashSet<FieldId>,
    known_methods: HashSet<MethodId>,
}

impl WholeProgramState {
    /// A state that knows nothing; every query returns top.
    pub fn unknown() -> Self {
        Self {
            field_partition: FieldPartition::top(),
            method_partition: MethodPartition::top(),
            known_fields: HashSet::new(),
            known_methods: HashSet::new(),
        }
    }

    /// Builds the two-phase state over the scope. `cfgs` maps each method
    /// with a body to its built CFG.
    pub fn build(scope: &Scope, cfgs: &HashMap<MethodId, Cfg>) -> Self {
        Self::build_with_args(scope, cfgs, None, None)
    }

    /// Like [`Self::build`], but analyzing each method under its known
    /// argument summary and with the previous outer iteration's state
    /// available to the analyzers. This is what the interprocedural
    /// iterator calls on every outer round.
    pub fn build_with_args(
        scope: &Scope,
        cfgs: &HashMap<MethodId, Cfg>,
        args: Option<&HashMap<MethodId, crate::domain::ArgumentDomain>>,
        previous: Option<&WholeProgramState>,
    ) -> Self {
        let mut state = Self {
            field_partition: FieldPartition::bottom(),
            method_partition: MethodPartition::bottom(),
            known_fields: HashSet::new(),
            known_methods: HashSet::new(),
        };
        state.set_fields_with_encoded_values(scope);
        state.analyze_clinits(scope, cfgs);
        state.collect(scope, cfgs, args, previous);
        state
    }

    /// Phase 1a: every static field starts from its encoded value.
    /// Primitive statics without one are zero-initialized by the runtime.
    fn set_fields_with_encoded_values(&mut self, scope: &Scope) {
        for class in &scope.classes {
            for field in &class.sfields {
                self.known_fields.insert(field.id);
                let value = ConstantValue::constant(field.encoded_value.unwrap_or(0));
                self.field_partition.set(field.id, value);
            }
        }
    }

    /// Phase 1b: run each class initializer and overwrite its own static
    /// fields with the values they hold when the initializer finishes.
    fn analyze_clinits(&mut self, scope: &Scope, cfgs: &HashMap<MethodId, Cfg>) {
        for class in &scope.classes {
            let Some(clinit) = class.clinit() else { continue };
            let Some(cfg) = cfgs.get(&clinit.id) else { continue };

            let combiner =
                InstructionAnalyzerCombiner::default_chain(Some(class.class_type), None, None);
            let mut fixpoint = IntraFixpointIterator::new(cfg, combiner);
            let mut init = ConstantEnvironment::top();
            for field in &class.sfields {
                init.set_field(
                    field.id,
                    ConstantValue::constant(field.encoded_value.unwrap_or(0)),
                );
            }
            fixpoint.run(init);

            // The field state at each return-void is what the rest of the
            // program can observe.
            let mut exit_env: Option<ConstantEnvironment> = None;
            for b in cfg.block_ids() {
                let mut env = fixpoint.entry_state_at(b);
                for id in cfg.block(b).items.insn_ids(&cfg.arena) {
                    let insn = cfg.arena.insn(id);
                    if insn.opcode().is_return() && !env.is_bottom() {
                        match &mut exit_env {
                            None => exit_env = Some(env.clone()),
                            Some(acc) => acc.join_with(&env),
                        }
                    }
                    fixpoint.analyze_instruction(id, insn, &mut env);
                }
            }
            if let Some(env) = exit_env {
                for field in &class.sfields {
                    self.field_partition.set(field.id, env.get_field(field.id));
                }
            }
        }
    }

    /// Phase 2: walk every method, joining sput values and return values
    /// into the cross-program partitions. Methods are analyzed in
    /// parallel; the joins are reduced afterwards.
    fn collect(
        &mut self,
        scope: &Scope,
        cfgs: &HashMap<MethodId, Cfg>,
        args: Option<&HashMap<MethodId, crate::domain::ArgumentDomain>>,
        previous: Option<&WholeProgramState>,
    ) {
        let methods: Vec<_> = scope.methods().collect();
        for m in &methods {
            self.known_methods.insert(m.id);
        }

        let results: Vec<(Vec<(FieldId, ConstantValue)>, Option<(MethodId, ConstantValue)>)> =
            methods
                .par_iter()
                .filter_map(|m| {
                    let cfg = cfgs.get(&m.id)?;
                    let declaring = refs::method(m.id).class;
                    let in_clinit = is_clinit(m.id);
                    let combiner = InstructionAnalyzerCombiner::default_chain(
                        in_clinit.then_some(declaring),
                        None,
                        previous,
                    );
                    let mut fixpoint = IntraFixpointIterator::new(cfg, combiner);
                    let init = match args.and_then(|a| a.get(&m.id)) {
                        Some(arg_env) => crate::intra::env_with_params(cfg, arg_env),
                        None => ConstantEnvironment::top(),
                    };
                    fixpoint.run(init);

                    let mut field_joins = Vec::new();
                    for b in cfg.block_ids() {
                        let mut env = fixpoint.entry_state_at(b);
                        for id in cfg.block(b).items.insn_ids(&cfg.arena) {
                            let insn = cfg.arena.insn(id);
                            if insn.opcode().group() == dexopt_ir::OpcodeGroup::Sput
                                && !env.is_bottom()
                            {
                                let field = insn.field();
                                // Stores inside the declaring clinit were
                                // already accounted for in phase 1.
                                if !(in_clinit && refs::field(field).class == declaring) {
                                    field_joins.push((field, env.get(insn.src(0))));
                                }
                            }
                            fixpoint.analyze_instruction(id, insn, &mut env);
                        }
                    }
                    let return_state = if returns_value(cfg) {
                        Some((m.id, collect_return_state(cfg, &fixpoint)))
                    } else {
                        None
                    };
                    Some((field_joins, return_state))
                })
                .collect();

        for (field_joins, return_state) in results {
            for (field, value) in field_joins {
                self.known_fields.insert(field);
                self.field_partition.join_at(&field, &value);
            }
            if let Some((method, value)) = return_state {
                self.method_partition.join_at(&method, &value);
            }
        }
    }

    /// Our best approximation of the field's value program-wide. Never
    /// bottom; top for unknown fields.
    pub fn get_field_value(&self, field: FieldId) -> ConstantValue {
        if !self.known_fields.contains(&field) {
            return ConstantValue::top();
        }
        self.field_partition.get(&field)
    }

    /// Our best approximation of the method's return value. May be
    /// bottom, meaning the method never returns (throws or loops).
    pub fn get_return_value(&self, method: MethodId) -> ConstantValue {
        if !self.known_methods.contains(&method) {
            return ConstantValue::top();
        }
        self.method_partition.get(&method)
    }

    /// The outer interprocedural loop monotonically improves the state;
    /// convergence is `new.leq(old)`.
    pub fn leq(&self, other: &WholeProgramState) -> bool {
        self.field_partition.leq(&other.field_partition)
            && self.method_partition.leq(&other.method_partition)
    }
}

fn returns_value(cfg: &Cfg) -> bool {
    cfg.instructions().iter().any(|(_, id)| {
        let op = cfg.arena.insn(*id).opcode();
        op.is_return() && op != Opcode::ReturnVoid
    })
}

/// Builds a CFG for every method body in the scope, taking the bodies
/// out of their methods. The inverse direction (linearizing back) goes
/// through [`Cfg::linearize`] per method.
pub fn take_cfgs(scope: &mut Scope) -> HashMap<MethodId, Cfg> {
    let mut cfgs = HashMap::new();
    for class in &mut scope.classes {
        for method in class.methods_mut() {
            if let Some(code) = method.code.take() {
                cfgs.insert(method.id, Cfg::build(code));
            }
        }
    }
    cfgs
}
