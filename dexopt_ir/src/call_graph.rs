//! Call graph over unambiguous invokes
//!
//! An edge is added from caller to callee only when the callee an invoke
//! refers to is exactly resolvable: static and direct invokes always
//! qualify, virtual (and interface/super) invokes qualify when override
//! resolution yields a single target. This keeps the graph small and
//! easy to analyze; ambiguous calls simply stay invisible, which is sound
//! for analyses that treat unknown callees as top.
//!
//! A distinguished entry node (the `None` method) dominates all roots so
//! the graph plugs into the fixpoint iterator as-is.

use crate::item::ItemId;
use crate::refs::MethodId;
use crate::scope::Scope;
use dexopt_analysis::GraphInterface;
use hashbrown::HashSet;
use indexmap::IndexMap;

/// A call site: the calling method, the resolved callee, and the invoke
/// instruction item inside the caller's body. Edges out of the synthetic
/// entry node carry no caller or invoke.
#[derive(Debug, Clone)]
pub struct CallEdge {
    pub caller: Option<MethodId>,
    pub callee: MethodId,
    pub invoke: Option<ItemId>,
}

#[derive(Debug, Default)]
struct Node {
    callers: Vec<usize>,
    callees: Vec<usize>,
}

/// The call graph. Nodes are methods; the entry node is `None`.
/// Node order is insertion order, so iteration is deterministic.
#[derive(Debug, Default)]
pub struct CallGraph {
    nodes: IndexMap<Option<MethodId>, Node>,
    edges: Vec<CallEdge>,
}

impl CallGraph {
    /// Builds the graph for every method body in the scope.
    pub fn build(scope: &Scope) -> CallGraph {
        let mut graph = CallGraph::default();
        graph.nodes.entry(None).or_default();
        for m in scope.methods() {
            graph.nodes.entry(Some(m.id)).or_default();
        }

        for m in scope.methods() {
            let Some(code) = &m.code else { continue };
            for item in code.insn_ids() {
                let insn = code.arena.insn(item);
                if !insn.opcode().is_invoke() {
                    continue;
                }
                if let Some(callee) = resolve_callee(scope, insn.opcode(), insn.method()) {
                    graph.add_edge(Some(m.id), callee, Some(item));
                }
            }
        }

        // The entry node reaches every method nobody calls, which makes
        // it dominate all roots of the graph.
        let called: HashSet<MethodId> = graph.edges.iter().map(|e| e.callee).collect();
        for m in scope.methods() {
            if !called.contains(&m.id) {
                graph.add_edge(None, m.id, None);
            }
        }
        graph
    }

    fn add_edge(&mut self, caller: Option<MethodId>, callee: MethodId, invoke: Option<ItemId>) {
        let idx = self.edges.len();
        self.edges.push(CallEdge { caller, callee, invoke });
        self.nodes.entry(caller).or_default().callees.push(idx);
        self.nodes.entry(Some(callee)).or_default().callers.push(idx);
    }

    pub fn edge(&self, idx: usize) -> &CallEdge {
        &self.edges[idx]
    }

    /// The call sites targeting `m`.
    pub fn callers(&self, m: MethodId) -> Vec<&CallEdge> {
        match self.nodes.get(&Some(m)) {
            None => Vec::new(),
            Some(node) => node.callers.iter().map(|i| &self.edges[*i]).collect(),
        }
    }

    /// The call sites inside `m`.
    pub fn callees(&self, m: MethodId) -> Vec<&CallEdge> {
        match self.nodes.get(&Some(m)) {
            None => Vec::new(),
            Some(node) => node.callees.iter().map(|i| &self.edges[*i]).collect(),
        }
    }
}

fn resolve_callee(
    scope: &Scope,
    opcode: crate::opcode::Opcode,
    callee: MethodId,
) -> Option<MethodId> {
    use crate::opcode::Opcode::*;
    match opcode {
        InvokeStatic | InvokeDirect => scope.method(callee).map(|m| m.id),
        InvokeVirtual | InvokeInterface | InvokeSuper => scope.resolve_unique_virtual(callee),
        _ => None,
    }
}

impl GraphInterface for CallGraph {
    type NodeId = Option<MethodId>;
    type EdgeId = usize;

    fn entry(&self) -> Option<MethodId> {
        None
    }

    fn predecessors(&self, node: Option<MethodId>) -> Vec<usize> {
        self.nodes.get(&node).map(|n| n.callers.clone()).unwrap_or_default()
    }

    fn successors(&self, node: Option<MethodId>) -> Vec<usize> {
        self.nodes.get(&node).map(|n| n.callees.clone()).unwrap_or_default()
    }

    fn source(&self, edge: &usize) -> Option<MethodId> {
        self.edges[*edge].caller
    }

    fn target(&self, edge: &usize) -> Option<MethodId> {
        Some(self.edges[*edge].callee)
    }
}
