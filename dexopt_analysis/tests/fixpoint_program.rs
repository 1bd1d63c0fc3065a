//! End-to-end exercise of the fixpoint iterator: liveness over a tiny
//! statement graph, the classic textbook example.

use dexopt_analysis::domains::PowersetDomain;
use dexopt_analysis::{
    BackwardsGraph, FixpointTransfer, GraphInterface, MonotonicFixpointIterator,
};
use pretty_assertions::assert_eq;

/// One statement: the variables it defines and the variables it uses.
#[derive(Debug, Clone)]
struct Statement {
    defs: Vec<&'static str>,
    uses: Vec<&'static str>,
}

struct Program {
    statements: Vec<Statement>,
    edges: Vec<(usize, usize)>,
    entry: usize,
    exit: usize,
}

impl GraphInterface for Program {
    type NodeId = usize;
    type EdgeId = (usize, usize);

    fn entry(&self) -> usize {
        self.entry
    }

    fn predecessors(&self, node: usize) -> Vec<(usize, usize)> {
        self.edges.iter().copied().filter(|&(_, t)| t == node).collect()
    }

    fn successors(&self, node: usize) -> Vec<(usize, usize)> {
        self.edges.iter().copied().filter(|&(s, _)| s == node).collect()
    }

    fn source(&self, edge: &(usize, usize)) -> usize {
        edge.0
    }

    fn target(&self, edge: &(usize, usize)) -> usize {
        edge.1
    }
}

type VarSet = PowersetDomain<&'static str>;

struct LivenessTransfer;

impl<'a> FixpointTransfer<BackwardsGraph<'a, Program>, VarSet> for LivenessTransfer {
    fn analyze_node(&self, graph: &BackwardsGraph<'a, Program>, node: usize, state: &mut VarSet) {
        let statement = &graph.forward_graph().statements[node];
        for def in &statement.defs {
            state.remove(def);
        }
        for used in &statement.uses {
            state.add(used);
        }
    }
}

fn vars(names: impl IntoIterator<Item = &'static str>) -> VarSet {
    PowersetDomain::value(names)
}

#[test]
fn test_liveness_of_gcd_like_program() {
    // 0: x := input
    // 1: y := input
    // 2: while (x != y)      [uses x, y]
    // 3:   if (x > y)        [uses x, y]
    // 4:     x := x - y      [defines x, uses x, y]
    // 5:   else y := y - x   [defines y, uses x, y]
    // 6: return x            [uses x]
    let program = Program {
        statements: vec![
            Statement { defs: vec!["x"], uses: vec![] },
            Statement { defs: vec!["y"], uses: vec![] },
            Statement { defs: vec![], uses: vec!["x", "y"] },
            Statement { defs: vec![], uses: vec!["x", "y"] },
            Statement { defs: vec!["x"], uses: vec!["x", "y"] },
            Statement { defs: vec!["y"], uses: vec!["x", "y"] },
            Statement { defs: vec![], uses: vec!["x"] },
        ],
        edges: vec![(0, 1), (1, 2), (2, 3), (2, 6), (3, 4), (3, 5), (4, 2), (5, 2)],
        entry: 0,
        exit: 6,
    };

    let backwards = BackwardsGraph::new(&program, program.exit);
    let mut fixpoint = MonotonicFixpointIterator::new(&backwards, LivenessTransfer);
    fixpoint.run(VarSet::value([]));

    // In the backward formulation, the "exit" state of a node is the set of
    // variables live on entry to the statement.
    let live_in = |node: usize| fixpoint.exit_state_at(node);
    let live_out = |node: usize| fixpoint.entry_state_at(node);

    assert_eq!(live_in(0), vars([]));
    assert_eq!(live_out(0), vars(["x"]));
    assert_eq!(live_in(1), vars(["x"]));
    // Around the loop everything keeps x and y alive.
    assert_eq!(live_in(2), vars(["x", "y"]));
    assert_eq!(live_in(3), vars(["x", "y"]));
    assert_eq!(live_in(4), vars(["x", "y"]));
    assert_eq!(live_in(5), vars(["x", "y"]));
    // Only x is needed at the return.
    assert_eq!(live_in(6), vars(["x"]));
    assert_eq!(live_out(6), vars([]));
}

#[test]
fn test_dead_definition_is_not_live() {
    // 0: a := 1   (dead: never used)
    // 1: b := 2
    // 2: return b
    let program = Program {
        statements: vec![
            Statement { defs: vec!["a"], uses: vec![] },
            Statement { defs: vec!["b"], uses: vec![] },
            Statement { defs: vec![], uses: vec!["b"] },
        ],
        edges: vec![(0, 1), (1, 2)],
        entry: 0,
        exit: 2,
    };

    let backwards = BackwardsGraph::new(&program, program.exit);
    let mut fixpoint = MonotonicFixpointIterator::new(&backwards, LivenessTransfer);
    fixpoint.run(VarSet::value([]));

    // a is dead everywhere.
    for node in 0..3 {
        assert!(!fixpoint.entry_state_at(node).contains(&"a"));
        assert!(!fixpoint.exit_state_at(node).contains(&"a"));
    }
    assert_eq!(fixpoint.exit_state_at(1), vars(["b"]));
}
