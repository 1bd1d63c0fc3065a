//! Interprocedural constant propagation over the call graph
//!
//! The per-method domain is a partition keyed by call site: at method
//! entry it holds one binding -- the label `None` mapped to the argument
//! summary flowing into the method -- and after the method is analyzed it
//! additionally binds every invoke instruction to the arguments passed at
//! that site. Traversing a call edge projects the callee's entry summary
//! out of the caller's exit partition.
//!
//! The outer loop alternates this iteration with a rebuild of the
//! whole-program state; each round uses only the previous round's state,
//! and the sequence converges because every step is monotone.

use crate::analyzer::InstructionAnalyzerCombiner;
use crate::domain::ArgumentDomain;
use crate::intra::{env_with_params, IntraFixpointIterator};
use crate::whole_program::WholeProgramState;
use dexopt_analysis::domains::{AbstractDomain, HashedAbstractPartition};
use dexopt_analysis::{FixpointTransfer, MonotonicFixpointIterator};
use dexopt_ir::call_graph::CallGraph;
use dexopt_ir::cfg::Cfg;
use dexopt_ir::refs::MethodId;
use dexopt_ir::scope::{is_clinit, is_init, Scope};
use dexopt_ir::ItemId;
use hashbrown::HashMap;

/// `None` labels the summary of the arguments at the current method's
/// entry; `Some(item)` labels the arguments passed at that invoke.
pub type CallsiteLabel = Option<ItemId>;

pub type Domain = HashedAbstractPartition<CallsiteLabel, ArgumentDomain>;

pub struct IpTransfer<'s> {
    cfgs: &'s HashMap<MethodId, Cfg>,
    wps: &'s WholeProgramState,
}

impl IpTransfer<'_> {
    fn combiner_for(&self, method: MethodId) -> InstructionAnalyzerCombiner<'_> {
        let declaring = dexopt_ir::refs::method(method).class;
        InstructionAnalyzerCombiner::default_chain(
            is_clinit(method).then_some(declaring),
            is_init(method).then_some(declaring),
            Some(self.wps),
        )
    }
}

impl FixpointTransfer<CallGraph, Domain> for IpTransfer<'_> {
    fn analyze_node(&self, _graph: &CallGraph, node: Option<MethodId>, state: &mut Domain) {
        let Some(method) = node else {
            // The synthetic entry node constrains nothing.
            return;
        };
        let Some(cfg) = self.cfgs.get(&method) else {
            return;
        };
        let entry_args = state.get(&None);
        let mut fixpoint = IntraFixpointIterator::new(cfg, self.combiner_for(method));
        fixpoint.run(env_with_params(cfg, &entry_args));

        // Bind each call site to the arguments observed there.
        for b in cfg.block_ids() {
            let mut env = fixpoint.entry_state_at(b);
            for id in cfg.block(b).items.insn_ids(&cfg.arena) {
                let insn = cfg.arena.insn(id);
                if insn.opcode().is_invoke() && !env.is_bottom() {
                    let mut args = ArgumentDomain::top();
                    for (i, &src) in insn.srcs().iter().enumerate() {
                        args.set(i as u32, env.get(src));
                    }
                    state.set(Some(id), args);
                }
                fixpoint.analyze_instruction(id, insn, &mut env);
            }
        }
    }

    fn analyze_edge(
        &self,
        graph: &CallGraph,
        edge: &usize,
        exit_state_at_source: &Domain,
    ) -> Domain {
        let call = graph.edge(*edge);
        let mut callee_entry = Domain::bottom();
        let args = match call.invoke {
            // Edges out of the synthetic entry carry unknown arguments.
            None => ArgumentDomain::top(),
            Some(invoke) => exit_state_at_source.get(&Some(invoke)),
        };
        callee_entry.set(None, args);
        callee_entry
    }
}

/// The result of the interprocedural analysis: the converged
/// whole-program state plus the per-method argument summaries.
pub struct InterproceduralAnalysis {
    pub wps: WholeProgramState,
    pub args: HashMap<MethodId, ArgumentDomain>,
}

/// Runs interprocedural constant propagation: an inner fixpoint over the
/// call graph to refine argument summaries, and an outer loop that
/// rebuilds the whole-program state from them. Each outer round reads
/// only the previous round's state; the state improves monotonically and
/// the loop stops at a fixpoint or after `max_outer_iterations`.
pub fn analyze(
    scope: &Scope,
    cfgs: &HashMap<MethodId, Cfg>,
    max_outer_iterations: usize,
) -> InterproceduralAnalysis {
    let graph = CallGraph::build(scope);
    let mut wps = WholeProgramState::build(scope, cfgs);
    let mut args: HashMap<MethodId, ArgumentDomain> = HashMap::new();

    for round in 0..max_outer_iterations {
        let mut fixpoint = MonotonicFixpointIterator::new(
            &graph,
            IpTransfer { cfgs, wps: &wps },
        );
        let mut init = Domain::bottom();
        init.set(None, ArgumentDomain::top());
        fixpoint.run(init);

        args = scope
            .method_ids()
            .into_iter()
            .map(|m| (m, fixpoint.entry_state_at(Some(m)).get(&None)))
            .collect();

        let new_wps = WholeProgramState::build_with_args(scope, cfgs, Some(&args), Some(&wps));
        // Each round's state refines the last; we're done when nothing
        // improved any further.
        let converged = wps.leq(&new_wps);
        wps = new_wps;
        if converged {
            log::debug!("interprocedural state converged after {} rounds", round + 1);
            break;
        }
    }
    InterproceduralAnalysis { wps, args }
}
