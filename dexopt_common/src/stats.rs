//! Statistics reported by transform passes
//!
//! Every pass that rewrites code records what it did so the metrics
//! collector can harvest the counters after a run. Counters accumulate
//! with `+=` so per-method results can be reduced into a per-pass total.

use serde::Serialize;
use std::ops::AddAssign;

/// Counters recorded by the optimization passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    // Constant propagation
    pub branches_removed: usize,
    pub branches_forwarded: usize,
    pub materialized_consts: usize,
    pub throws_synthesized: usize,
    pub null_checks_removed: usize,
    pub redundant_puts_removed: usize,
    pub unreachable_instructions_removed: usize,

    // Register allocation
    pub reiteration_count: usize,
    pub param_spill_moves: usize,
    pub range_spill_moves: usize,
    pub global_spill_moves: usize,
    pub split_moves: usize,
    pub moves_coalesced: usize,
    pub params_spill_early: usize,

    // Instruction selection
    pub to_2addr: usize,
    pub move_for_check_cast: usize,
}

impl PassStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of moves inserted by the register allocator.
    pub fn moves_inserted(&self) -> usize {
        self.param_spill_moves
            + self.range_spill_moves
            + self.global_spill_moves
            + self.split_moves
    }

    /// Moves inserted minus moves removed by coalescing. Can be negative
    /// when coalescing wins.
    pub fn net_moves(&self) -> isize {
        self.moves_inserted() as isize - self.moves_coalesced as isize
    }
}

impl AddAssign for PassStats {
    fn add_assign(&mut self, that: Self) {
        self.branches_removed += that.branches_removed;
        self.branches_forwarded += that.branches_forwarded;
        self.materialized_consts += that.materialized_consts;
        self.throws_synthesized += that.throws_synthesized;
        self.null_checks_removed += that.null_checks_removed;
        self.redundant_puts_removed += that.redundant_puts_removed;
        self.unreachable_instructions_removed += that.unreachable_instructions_removed;
        self.reiteration_count += that.reiteration_count;
        self.param_spill_moves += that.param_spill_moves;
        self.range_spill_moves += that.range_spill_moves;
        self.global_spill_moves += that.global_spill_moves;
        self.split_moves += that.split_moves;
        self.moves_coalesced += that.moves_coalesced;
        self.params_spill_early += that.params_spill_early;
        self.to_2addr += that.to_2addr;
        self.move_for_check_cast += that.move_for_check_cast;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accumulation() {
        let mut a = PassStats::new();
        a.branches_removed = 2;
        a.global_spill_moves = 3;

        let mut b = PassStats::new();
        b.branches_removed = 1;
        b.moves_coalesced = 5;

        a += b;
        assert_eq!(a.branches_removed, 3);
        assert_eq!(a.moves_inserted(), 3);
        assert_eq!(a.net_moves(), -2);
    }

    #[test]
    fn test_stats_serialize_for_metrics() {
        let mut stats = PassStats::new();
        stats.materialized_consts = 4;
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["materialized_consts"], 4);
        assert_eq!(json["branches_removed"], 0);
    }
}
