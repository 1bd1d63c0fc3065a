//! Benchmarks for the fixpoint iterator and the patricia-tree maps

use criterion::{criterion_group, criterion_main, Criterion};
use dexopt_analysis::domains::{AbstractDomain, PatriciaTreeMap, PowersetDomain};
use dexopt_analysis::{FixpointTransfer, GraphInterface, MonotonicFixpointIterator};

/// A ladder of diamonds with a back-edge every 8 nodes, a rough stand-in
/// for the loop structure of real method bodies.
struct LadderGraph {
    nodes: usize,
}

impl GraphInterface for LadderGraph {
    type NodeId = usize;
    type EdgeId = (usize, usize);

    fn entry(&self) -> usize {
        0
    }

    fn predecessors(&self, node: usize) -> Vec<(usize, usize)> {
        let mut preds = Vec::new();
        if node > 0 {
            preds.push((node - 1, node));
        }
        if node % 8 == 0 && node + 7 < self.nodes {
            preds.push((node + 7, node));
        }
        preds
    }

    fn successors(&self, node: usize) -> Vec<(usize, usize)> {
        let mut succs = Vec::new();
        if node + 1 < self.nodes {
            succs.push((node, node + 1));
        }
        if node % 8 == 7 && node >= 7 {
            succs.push((node, node - 7));
        }
        succs
    }

    fn source(&self, edge: &(usize, usize)) -> usize {
        edge.0
    }

    fn target(&self, edge: &(usize, usize)) -> usize {
        edge.1
    }
}

struct Collector;

impl FixpointTransfer<LadderGraph, PowersetDomain<usize>> for Collector {
    fn analyze_node(&self, _g: &LadderGraph, node: usize, state: &mut PowersetDomain<usize>) {
        state.add(node % 16);
    }
}

fn bench_fixpoint(c: &mut Criterion) {
    let graph = LadderGraph { nodes: 256 };
    c.bench_function("fixpoint_ladder_256", |b| {
        b.iter(|| {
            let mut iter = MonotonicFixpointIterator::new(&graph, Collector);
            iter.run(PowersetDomain::value([]));
            iter.exit_state_at(255)
        })
    });
}

fn bench_patricia_insert(c: &mut Criterion) {
    c.bench_function("patricia_insert_1k", |b| {
        b.iter(|| {
            let mut map = PatriciaTreeMap::new();
            for i in 0..1000u32 {
                map.insert(i.wrapping_mul(2654435761), i);
            }
            map.len()
        })
    });
}

criterion_group!(benches, bench_fixpoint, bench_patricia_insert);
criterion_main!(benches);
