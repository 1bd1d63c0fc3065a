//! Batched CFG mutation
//!
//! Transform passes walk the graph read-only, queue up their rewrites
//! anchored to instruction items, and apply everything at once afterward.
//! This keeps the analysis results valid for the whole walk and lets the
//! pass stay oblivious to the block splits its own insertions cause.

use super::{BlockId, Cfg};
use crate::instruction::IrInstruction;
use crate::item::ItemId;
use hashbrown::HashMap;

enum Change {
    InsertBefore(ItemId, Vec<IrInstruction>),
    InsertAfter(ItemId, Vec<IrInstruction>),
    Replace(ItemId, Vec<IrInstruction>),
    Remove(ItemId),
}

/// A queue of instruction-level changes to apply to a [`Cfg`] in one
/// sweep.
#[derive(Default)]
pub struct CfgMutation {
    changes: Vec<Change>,
}

impl CfgMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_before(&mut self, anchor: ItemId, insns: Vec<IrInstruction>) {
        self.changes.push(Change::InsertBefore(anchor, insns));
    }

    pub fn insert_after(&mut self, anchor: ItemId, insns: Vec<IrInstruction>) {
        self.changes.push(Change::InsertAfter(anchor, insns));
    }

    /// Replaces the anchor instruction (and its move-result-pseudo, if it
    /// has one) with the given instructions.
    pub fn replace(&mut self, anchor: ItemId, insns: Vec<IrInstruction>) {
        self.changes.push(Change::Replace(anchor, insns));
    }

    pub fn remove(&mut self, anchor: ItemId) {
        self.changes.push(Change::Remove(anchor));
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Applies all queued changes. Anchors are re-located after any
    /// change that restructures blocks, so earlier changes cannot
    /// invalidate later ones.
    pub fn apply(self, cfg: &mut Cfg) {
        let mut locations = locate_items(cfg);
        for change in self.changes {
            match change {
                Change::InsertBefore(anchor, insns) => {
                    let block = locations[&anchor];
                    if cfg.insert_before(block, anchor, insns) {
                        locations = locate_items(cfg);
                    }
                }
                Change::InsertAfter(anchor, insns) => {
                    let block = locations[&anchor];
                    if cfg.insert_after(block, anchor, insns) {
                        locations = locate_items(cfg);
                    }
                }
                Change::Replace(anchor, insns) => {
                    let block = locations[&anchor];
                    let invalidated = cfg.insert_before(block, anchor, insns);
                    let block = if invalidated {
                        locations = locate_items(cfg);
                        locations[&anchor]
                    } else {
                        block
                    };
                    cfg.remove_insn(block, anchor);
                    locations = locate_items(cfg);
                }
                Change::Remove(anchor) => {
                    let block = locations[&anchor];
                    cfg.remove_insn(block, anchor);
                    locations = locate_items(cfg);
                }
            }
        }
    }
}

fn locate_items(cfg: &Cfg) -> HashMap<ItemId, BlockId> {
    cfg.instructions().into_iter().map(|(b, id)| (id, b)).collect()
}
