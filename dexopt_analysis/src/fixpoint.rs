//! Monotonic fixpoint iteration over a graph
//!
//! This is a monotonically increasing chaotic fixpoint iteration sequence
//! with widening, using the recursive iteration strategy induced by a weak
//! topological ordering of the graph nodes. A detailed exposition of
//! chaotic fixpoint iteration and its use in abstract interpretation can be
//! found in:
//!
//!   Patrick Cousot & Radhia Cousot. Abstract interpretation and
//!   application to logic programs. Journal of Logic Programming,
//!   13(2-3):103-179, 1992.
//!
//! The recursive iteration strategy is described in Bourdoncle's paper on
//! weak topological orderings.

use crate::domains::AbstractDomain;
use crate::wto::{WeakTopologicalOrdering, WtoComponentRef};
use hashbrown::HashMap;
use std::hash::Hash;

/// The shape of a graph as seen by the fixpoint iterator: an entry node,
/// edge-valued successor and predecessor functions, and edge endpoints.
/// Edges carry identity so that `analyze_edge` can give different semantics
/// to, say, the two arms of a conditional branch.
pub trait GraphInterface {
    type NodeId: Copy + Eq + Hash;
    type EdgeId: Clone;

    fn entry(&self) -> Self::NodeId;
    fn predecessors(&self, node: Self::NodeId) -> Vec<Self::EdgeId>;
    fn successors(&self, node: Self::NodeId) -> Vec<Self::EdgeId>;
    fn source(&self, edge: &Self::EdgeId) -> Self::NodeId;
    fn target(&self, edge: &Self::EdgeId) -> Self::NodeId;
}

/// Adapter that runs an analysis against the reverse of a graph. Backward
/// analyses (liveness) instantiate the iterator over this wrapper with the
/// exit block as the entry point.
pub struct BackwardsGraph<'a, G: GraphInterface> {
    graph: &'a G,
    exit: G::NodeId,
}

impl<'a, G: GraphInterface> BackwardsGraph<'a, G> {
    pub fn new(graph: &'a G, exit: G::NodeId) -> Self {
        Self { graph, exit }
    }

    pub fn forward_graph(&self) -> &'a G {
        self.graph
    }
}

impl<G: GraphInterface> GraphInterface for BackwardsGraph<'_, G> {
    type NodeId = G::NodeId;
    type EdgeId = G::EdgeId;

    fn entry(&self) -> Self::NodeId {
        self.exit
    }

    fn predecessors(&self, node: Self::NodeId) -> Vec<Self::EdgeId> {
        self.graph.successors(node)
    }

    fn successors(&self, node: Self::NodeId) -> Vec<Self::EdgeId> {
        self.graph.predecessors(node)
    }

    fn source(&self, edge: &Self::EdgeId) -> Self::NodeId {
        self.graph.target(edge)
    }

    fn target(&self, edge: &Self::EdgeId) -> Self::NodeId {
        self.graph.source(edge)
    }
}

/// State of an in-progress fixpoint iteration, handed to `extrapolate` so
/// clients can decide when to switch from join to widening. For each SCC
/// head, the context records how many times the node has been analyzed
/// overall and how many times since the iterator re-entered the component.
pub struct FixpointContext<N: Copy + Eq + Hash, D> {
    init: D,
    global_iterations: HashMap<N, u32>,
    local_iterations: HashMap<N, u32>,
}

impl<N: Copy + Eq + Hash, D> FixpointContext<N, D> {
    fn new(init: D) -> Self {
        Self {
            init,
            global_iterations: HashMap::new(),
            local_iterations: HashMap::new(),
        }
    }

    pub fn local_iterations_for(&self, node: N) -> u32 {
        self.local_iterations.get(&node).copied().unwrap_or(0)
    }

    pub fn global_iterations_for(&self, node: N) -> u32 {
        self.global_iterations.get(&node).copied().unwrap_or(0)
    }

    fn initial_value(&self) -> &D {
        &self.init
    }

    fn increase_iteration_count_for(&mut self, node: N) {
        *self.local_iterations.entry(node).or_insert(0) += 1;
        *self.global_iterations.entry(node).or_insert(0) += 1;
    }

    fn reset_local_iteration_count_for(&mut self, node: N) {
        self.local_iterations.remove(&node);
    }
}

/// The semantic transformers supplied by an analysis client.
pub trait FixpointTransfer<G: GraphInterface, D: AbstractDomain> {
    /// Transforms the state of the program across one node. The transformer
    /// operates by mutating `current_state`, which holds the entry state
    /// when the method is invoked and must hold the exit state when it
    /// returns. When a node is a basic block, the same value is threaded
    /// through all its instructions, avoiding copies between instructions.
    ///
    /// Node transformers are required to be monotonic.
    fn analyze_node(&self, graph: &G, node: G::NodeId, current_state: &mut D);

    /// Describes the effect of traversing an outgoing edge on the state of
    /// the program when control is transferred from the edge's source to
    /// its target (conditional branch refinement, exception semantics).
    ///
    /// Edge transformers are required to be monotonic. The default is the
    /// identity.
    fn analyze_edge(&self, _graph: &G, _edge: &G::EdgeId, exit_state_at_source: &D) -> D {
        exit_state_at_source.clone()
    }

    /// Invoked on the head of an SCC whenever the newly computed entry
    /// state is not subsumed by the current one. The widening operator
    /// must be applied infinitely often for convergence, but the order and
    /// frequency at which it is applied can significantly affect precision.
    /// The default strategy joins at the first local iteration and widens
    /// at all subsequent ones.
    fn extrapolate(
        &self,
        context: &FixpointContext<G::NodeId, D>,
        node: G::NodeId,
        current_state: &mut D,
        new_state: &D,
    ) {
        if context.local_iterations_for(node) == 0 {
            current_state.join_with(new_state);
        } else {
            current_state.widen_with(new_state);
        }
    }
}

struct States<N: Copy + Eq + Hash, D> {
    entry: HashMap<N, D>,
    exit: HashMap<N, D>,
}

/// The fixpoint iterator itself: owns the WTO of the graph and the
/// per-node entry/exit states. One iterator instance is bound to one graph
/// and is single-threaded; run many iterators in parallel across methods
/// instead of sharing one.
pub struct MonotonicFixpointIterator<'g, G, D, T>
where
    G: GraphInterface,
    D: AbstractDomain,
    T: FixpointTransfer<G, D>,
{
    graph: &'g G,
    transfer: T,
    wto: WeakTopologicalOrdering<G::NodeId>,
    states: States<G::NodeId, D>,
}

impl<'g, G, D, T> MonotonicFixpointIterator<'g, G, D, T>
where
    G: GraphInterface,
    D: AbstractDomain,
    T: FixpointTransfer<G, D>,
{
    pub fn new(graph: &'g G, transfer: T) -> Self {
        let root = graph.entry();
        let wto = WeakTopologicalOrdering::new(root, |n| {
            graph.successors(n).iter().map(|e| graph.target(e)).collect()
        });
        Self {
            graph,
            transfer,
            wto,
            states: States { entry: HashMap::new(), exit: HashMap::new() },
        }
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn graph(&self) -> &'g G {
        self.graph
    }

    /// Executes the iteration starting from `init` as the state at the
    /// entry node. May be invoked multiple times with different values to
    /// analyze the program under different initial conditions; each run
    /// discards previous results.
    pub fn run(&mut self, init: D) {
        self.states.entry.clear();
        self.states.exit.clear();
        let mut context = FixpointContext::new(init);
        let mut engine = Engine {
            graph: self.graph,
            transfer: &self.transfer,
            states: &mut self.states,
        };
        for component in self.wto.components() {
            engine.analyze_component(&mut context, component);
        }
    }

    /// The invariant computed at a node entry; bottom if the node was
    /// never visited.
    pub fn entry_state_at(&self, node: G::NodeId) -> D {
        self.states.entry.get(&node).cloned().unwrap_or_else(D::bottom)
    }

    /// The invariant computed at a node exit; bottom if the node was
    /// never visited.
    pub fn exit_state_at(&self, node: G::NodeId) -> D {
        self.states.exit.get(&node).cloned().unwrap_or_else(D::bottom)
    }
}

/// The recursive worker for one `run`. Splitting this off the iterator
/// keeps the WTO borrow disjoint from the state tables.
struct Engine<'a, 'g, G, D, T>
where
    G: GraphInterface,
    D: AbstractDomain,
{
    graph: &'g G,
    transfer: &'a T,
    states: &'a mut States<G::NodeId, D>,
}

impl<G, D, T> Engine<'_, '_, G, D, T>
where
    G: GraphInterface,
    D: AbstractDomain,
    T: FixpointTransfer<G, D>,
{
    fn exit_state_at(&self, node: G::NodeId) -> D {
        self.states.exit.get(&node).cloned().unwrap_or_else(D::bottom)
    }

    fn compute_entry_state(&self, context: &FixpointContext<G::NodeId, D>, node: G::NodeId) -> D {
        let mut state = D::bottom();
        if node == self.graph.entry() {
            state.join_with(context.initial_value());
        }
        for pred in self.graph.predecessors(node) {
            let source_exit = self.exit_state_at(self.graph.source(&pred));
            state.join_with(&self.transfer.analyze_edge(self.graph, &pred, &source_exit));
        }
        state
    }

    fn analyze_component(
        &mut self,
        context: &mut FixpointContext<G::NodeId, D>,
        component: WtoComponentRef<'_, G::NodeId>,
    ) {
        if component.is_vertex() {
            self.analyze_vertex(context, component.head_node());
        } else {
            self.analyze_scc(context, component);
        }
    }

    fn analyze_vertex(&mut self, context: &mut FixpointContext<G::NodeId, D>, node: G::NodeId) {
        let entry_state = self.compute_entry_state(context, node);
        let mut exit_state = entry_state.clone();
        self.transfer.analyze_node(self.graph, node, &mut exit_state);
        self.states.entry.insert(node, entry_state);
        self.states.exit.insert(node, exit_state);
    }

    fn analyze_scc(
        &mut self,
        context: &mut FixpointContext<G::NodeId, D>,
        scc: WtoComponentRef<'_, G::NodeId>,
    ) {
        let head = scc.head_node();
        context.reset_local_iteration_count_for(head);
        loop {
            self.analyze_vertex(context, head);
            for component in scc.subcomponents() {
                self.analyze_component(context, component);
            }
            let new_state = self.compute_entry_state(context, head);
            let current_state = self
                .states
                .entry
                .get_mut(&head)
                .expect("SCC head must have an entry state");
            if new_state.leq(current_state) {
                // The monotonic iteration sequence has converged and
                // current_state is a post-fixpoint. Since all transformers
                // are monotonic, new_state is also a post-fixpoint and may
                // be more precise, so we keep it as the final result.
                *current_state = new_state;
                return;
            }
            self.transfer.extrapolate(context, head, current_state, &new_state);
            context.increase_iteration_count_for(head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::powerset::PowersetDomain;

    /// A miniature flow graph for testing: nodes are indices, edges are
    /// (src, tgt) pairs identified by their position in the edge list.
    struct TestGraph {
        entry: u32,
        edges: Vec<(u32, u32)>,
    }

    impl GraphInterface for TestGraph {
        type NodeId = u32;
        type EdgeId = usize;

        fn entry(&self) -> u32 {
            self.entry
        }

        fn predecessors(&self, node: u32) -> Vec<usize> {
            (0..self.edges.len()).filter(|&i| self.edges[i].1 == node).collect()
        }

        fn successors(&self, node: u32) -> Vec<usize> {
            (0..self.edges.len()).filter(|&i| self.edges[i].0 == node).collect()
        }

        fn source(&self, edge: &usize) -> u32 {
            self.edges[*edge].0
        }

        fn target(&self, edge: &usize) -> u32 {
            self.edges[*edge].1
        }
    }

    /// Collects every node reachable along the iteration: the exit state of
    /// each node is the set of nodes on some path from the entry to it,
    /// inclusive. A classic monotonic transformer.
    struct PathCollector;

    impl FixpointTransfer<TestGraph, PowersetDomain<u32>> for PathCollector {
        fn analyze_node(&self, _g: &TestGraph, node: u32, state: &mut PowersetDomain<u32>) {
            state.add(node);
        }
    }

    #[test]
    fn test_diamond() {
        //    0
        //   / \
        //  1   2
        //   \ /
        //    3
        let graph = TestGraph { entry: 0, edges: vec![(0, 1), (0, 2), (1, 3), (2, 3)] };
        let mut iter = MonotonicFixpointIterator::new(&graph, PathCollector);
        iter.run(PowersetDomain::value([]));

        assert_eq!(iter.entry_state_at(0), PowersetDomain::value([]));
        assert_eq!(iter.exit_state_at(0), PowersetDomain::value([0]));
        assert_eq!(iter.exit_state_at(1), PowersetDomain::value([0, 1]));
        assert_eq!(iter.exit_state_at(2), PowersetDomain::value([0, 2]));
        // The join at node 3 unions both paths.
        assert_eq!(iter.entry_state_at(3), PowersetDomain::value([0, 1, 2]));
        assert_eq!(iter.exit_state_at(3), PowersetDomain::value([0, 1, 2, 3]));
    }

    #[test]
    fn test_loop_converges() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let graph = TestGraph { entry: 0, edges: vec![(0, 1), (1, 2), (2, 1), (2, 3)] };
        let mut iter = MonotonicFixpointIterator::new(&graph, PathCollector);
        iter.run(PowersetDomain::value([]));

        // Everything inside the loop sees the loop body in its entry state
        // once the SCC stabilizes.
        assert_eq!(iter.entry_state_at(1), PowersetDomain::value([0, 1, 2]));
        assert_eq!(iter.exit_state_at(3), PowersetDomain::value([0, 1, 2, 3]));
    }

    #[test]
    fn test_backwards_adapter_flips_edges() {
        let graph = TestGraph { entry: 0, edges: vec![(0, 1), (1, 2)] };
        let backwards = BackwardsGraph::new(&graph, 2);
        assert_eq!(backwards.entry(), 2);
        let succs = backwards.successors(2);
        assert_eq!(succs.len(), 1);
        assert_eq!(backwards.target(&succs[0]), 1);
    }

    #[test]
    fn test_unreachable_node_is_bottom() {
        let graph = TestGraph { entry: 0, edges: vec![(0, 1), (7, 8)] };
        let mut iter = MonotonicFixpointIterator::new(&graph, PathCollector);
        iter.run(PowersetDomain::value([]));
        assert!(iter.entry_state_at(8).is_bottom());
    }

    #[test]
    fn test_idempotent_rerun() {
        let graph = TestGraph { entry: 0, edges: vec![(0, 1), (1, 2), (2, 1), (2, 3)] };
        let mut iter = MonotonicFixpointIterator::new(&graph, PathCollector);
        iter.run(PowersetDomain::value([]));
        let first: Vec<_> = (0..4).map(|n| iter.exit_state_at(n)).collect();
        iter.run(PowersetDomain::value([]));
        let second: Vec<_> = (0..4).map(|n| iter.exit_state_at(n)).collect();
        assert_eq!(first, second);
    }
}
