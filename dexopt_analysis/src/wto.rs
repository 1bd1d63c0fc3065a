//! Weak topological ordering of a rooted directed graph
//!
//! Implementation of the decomposition of a rooted directed graph into a
//! weak topological ordering (WTO), as described in Bourdoncle's original
//! paper:
//!
//!   F. Bourdoncle. Efficient chaotic iteration strategies with widenings.
//!   In Formal Methods in Programming and Their Applications, pp 128-141.
//!
//! State-of-the-art fixpoint iteration algorithms use weak topological
//! orderings as the underlying structure for high performance. We primarily
//! use WTOs on the control-flow graph of a method, but they also come in
//! handy when manipulating call graphs or chain graphs during block
//! reordering, hence the parametric definition.

use hashbrown::HashMap;
use std::fmt;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Vertex,
    /// A strongly connected component with a distinguished head. `has_body`
    /// is false when the component consists of the head alone (a vertex
    /// with a self-loop).
    Scc { has_body: bool },
}

#[derive(Debug, Clone)]
struct WtoComponent<N> {
    node: N,
    kind: Kind,
    /// All components of a WTO are stored linearly inside one vector, in
    /// reverse order. The subcomponents of an SCC are stored between the
    /// head node and the next component of the enclosing sequence, so
    /// adjacent components are addressed by relative offsets. An offset of
    /// 0 means this is the last component of its enclosing sequence.
    next_component_offset: usize,
}

/// A borrowed view of one component inside a [`WeakTopologicalOrdering`]:
/// either a single vertex, or an SCC with a head and nested subcomponents.
#[derive(Clone, Copy)]
pub struct WtoComponentRef<'a, N> {
    space: &'a [WtoComponent<N>],
    idx: usize,
}

impl<'a, N: Copy> WtoComponentRef<'a, N> {
    /// The single node of a vertex component, or the head of an SCC.
    pub fn head_node(&self) -> N {
        self.space[self.idx].node
    }

    pub fn is_vertex(&self) -> bool {
        self.space[self.idx].kind == Kind::Vertex
    }

    pub fn is_scc(&self) -> bool {
        matches!(self.space[self.idx].kind, Kind::Scc { .. })
    }

    /// Iterates over the subcomponents of an SCC (head node excluded).
    pub fn subcomponents(&self) -> WtoComponentIter<'a, N> {
        match self.space[self.idx].kind {
            Kind::Scc { has_body: true } => {
                WtoComponentIter { space: self.space, next: Some(self.idx - 1) }
            }
            Kind::Scc { has_body: false } => WtoComponentIter { space: self.space, next: None },
            Kind::Vertex => panic!("subcomponents() called on a vertex component"),
        }
    }
}

/// Iterator over the components of one sequence, leftmost first.
pub struct WtoComponentIter<'a, N> {
    space: &'a [WtoComponent<N>],
    next: Option<usize>,
}

impl<'a, N: Copy> Iterator for WtoComponentIter<'a, N> {
    type Item = WtoComponentRef<'a, N>;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let offset = self.space[idx].next_component_offset;
        self.next = if offset == 0 { None } else { Some(idx - offset) };
        Some(WtoComponentRef { space: self.space, idx })
    }
}

/// Weak topological ordering of the graph reachable from a root vertex.
///
/// Construction only needs the root and the successor function. Nodes are
/// simple copyable identifiers (block ids, interned method ids).
pub struct WeakTopologicalOrdering<N> {
    // Components are stored inside one vector rather than allocated
    // individually, which keeps traversal cache-friendly when the WTO is
    // walked repeatedly during a fixpoint iteration.
    space: Vec<WtoComponent<N>>,
}

impl<N: Copy + Eq + Hash> WeakTopologicalOrdering<N> {
    pub fn new<F>(root: N, successors: F) -> Self
    where
        F: Fn(N) -> Vec<N>,
    {
        let mut builder = Builder {
            successors,
            space: Vec::new(),
            dfn: HashMap::new(),
            stack: Vec::new(),
            num: 0,
        };
        let mut partition: i64 = -1;
        builder.visit(root, &mut partition);
        WeakTopologicalOrdering { space: builder.space }
    }

    /// Iterates over the top-level components, leftmost first.
    pub fn components(&self) -> WtoComponentIter<'_, N> {
        if self.space.is_empty() {
            WtoComponentIter { space: &self.space, next: None }
        } else {
            WtoComponentIter { space: &self.space, next: Some(self.space.len() - 1) }
        }
    }
}

struct Builder<N, F> {
    successors: F,
    space: Vec<WtoComponent<N>>,
    // Auxiliary structures from Bourdoncle's algorithm. A missing entry in
    // the depth-first numbering stands for the value 0 in the paper; the
    // special value +oo is encoded as u32::MAX.
    dfn: HashMap<N, u32>,
    stack: Vec<N>,
    num: u32,
}

impl<N: Copy + Eq + Hash, F: Fn(N) -> Vec<N>> Builder<N, F> {
    fn get_dfn(&self, node: N) -> u32 {
        self.dfn.get(&node).copied().unwrap_or(0)
    }

    fn set_dfn(&mut self, node: N, number: u32) -> u32 {
        if number == 0 {
            self.dfn.remove(&node);
        } else {
            self.dfn.insert(node, number);
        }
        number
    }

    // We keep the notations used by Bourdoncle in the paper.
    fn visit(&mut self, vertex: N, partition: &mut i64) -> u32 {
        self.stack.push(vertex);
        self.num += 1;
        let mut head = self.set_dfn(vertex, self.num);
        let mut loop_detected = false;
        for succ in (self.successors)(vertex) {
            let succ_dfn = self.get_dfn(succ);
            let min = if succ_dfn == 0 { self.visit(succ, partition) } else { succ_dfn };
            if min <= head {
                head = min;
                loop_detected = true;
            }
        }
        if head == self.get_dfn(vertex) {
            self.set_dfn(vertex, u32::MAX);
            let mut element = self.stack.pop().expect("DFS stack underflow");
            let kind = if loop_detected {
                while element != vertex {
                    self.set_dfn(element, 0);
                    element = self.stack.pop().expect("DFS stack underflow");
                }
                // Re-visit the SCC members (their numbering was cleared
                // above) to build the nested ordering of the body.
                let body_start = self.space.len();
                self.push_component(vertex);
                Kind::Scc { has_body: self.space.len() > body_start }
            } else {
                Kind::Vertex
            };
            let position = self.space.len() as i64;
            let next_component_offset =
                if *partition == -1 { 0 } else { (position - *partition) as usize };
            self.space.push(WtoComponent { node: vertex, kind, next_component_offset });
            *partition = position;
        }
        head
    }

    fn push_component(&mut self, vertex: N) {
        let mut partition: i64 = -1;
        for succ in (self.successors)(vertex) {
            if self.get_dfn(succ) == 0 {
                self.visit(succ, &mut partition);
            }
        }
    }
}

impl<N: Copy + fmt::Display> fmt::Display for WtoComponentRef<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_scc() {
            write!(f, "({}", self.head_node())?;
            for sub in self.subcomponents() {
                write!(f, " {}", sub)?;
            }
            write!(f, ")")
        } else {
            write!(f, "{}", self.head_node())
        }
    }
}

impl<N: Copy + fmt::Display + Eq + Hash> fmt::Display for WeakTopologicalOrdering<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for component in self.components() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}", component)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn wto_string(edges: &[(u32, u32)], root: u32) -> String {
        let mut succs: HashMap<u32, Vec<u32>> = HashMap::new();
        for &(u, v) in edges {
            succs.entry(u).or_default().push(v);
        }
        let wto = WeakTopologicalOrdering::new(root, move |n| {
            succs.get(&n).cloned().unwrap_or_default()
        });
        wto.to_string()
    }

    #[test]
    fn test_straight_line() {
        assert_eq!(wto_string(&[(1, 2), (2, 3), (3, 4)], 1), "1 2 3 4");
    }

    #[test]
    fn test_bourdoncle_figure() {
        // The running example from Bourdoncle's paper, with an extra
        // self-loop on the final node.
        let edges = [
            (1, 2),
            (2, 3),
            (3, 4),
            (4, 5),
            (4, 7),
            (5, 6),
            (6, 5),
            (6, 7),
            (7, 3),
            (7, 8),
            (8, 8),
        ];
        assert_eq!(wto_string(&edges, 1), "1 2 (3 4 (5 6) 7) (8)");
    }

    #[test]
    fn test_self_loop() {
        assert_eq!(wto_string(&[(1, 1)], 1), "(1)");
    }

    #[test]
    fn test_simple_loop_head() {
        // For any non-recursive edge u -> v, u comes before v; the loop
        // 2 <-> 3 forms an SCC headed by 2.
        assert_eq!(wto_string(&[(1, 2), (2, 3), (3, 2), (3, 4)], 1), "1 (2 3) 4");
    }

    #[test]
    fn test_unreachable_nodes_are_ignored() {
        assert_eq!(wto_string(&[(1, 2), (5, 6)], 1), "1 2");
    }

    #[test]
    fn test_nested_components_are_addressable() {
        let mut succs: HashMap<u32, Vec<u32>> = HashMap::new();
        for (u, v) in [(1, 2), (2, 3), (3, 2), (2, 4)] {
            succs.entry(u).or_default().push(v);
        }
        let wto = WeakTopologicalOrdering::new(1u32, move |n| {
            succs.get(&n).cloned().unwrap_or_default()
        });
        let components: Vec<_> = wto.components().collect();
        assert_eq!(components.len(), 3);
        assert!(components[0].is_vertex());
        assert_eq!(components[0].head_node(), 1);
        assert!(components[1].is_scc());
        assert_eq!(components[1].head_node(), 2);
        let body: Vec<_> = components[1].subcomponents().map(|c| c.head_node()).collect();
        assert_eq!(body, vec![3]);
        assert_eq!(components[2].head_node(), 4);
    }
}
