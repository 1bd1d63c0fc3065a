//! The method item stream
//!
//! A method body is an ordered, doubly-linked list of items: instructions,
//! branch targets, try/catch markers, source positions, debug ops and
//! fallthrough placeholders. Items are identity objects -- a branch target
//! points back to its source branch by identity, a catch entry points to
//! the next catch in its chain, a position points to its inlining parent.
//!
//! Because the graph of items is cyclic, items live in an arena keyed by
//! stable 32-bit ids and every reference is an id. Cloning a list rewrites
//! ids through a translation map built in a first pass. Several lists can
//! share one arena; this is how CFG blocks each own a slice of the method
//! body without moving items in memory.

use crate::instruction::IrInstruction;
use crate::refs::{FieldId, MethodId, StringId, TypeId};
use crate::Reg;
use hashbrown::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item#{}", self.0)
    }
}

/// A branch target at the head of a block. `src` is the branch
/// instruction item this target belongs to; multi-way (switch) targets
/// carry their case key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTarget {
    pub src: ItemId,
    pub case_key: Option<i32>,
}

/// A try-region marker. `catch_start` is the first catch entry of the
/// handler chain guarding the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryMarker {
    pub catch_start: ItemId,
}

/// One catch handler: its guarded exception type (None for a catch-all)
/// and the next handler consulted when the type does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchEntry {
    pub catch_type: Option<TypeId>,
    pub next: Option<ItemId>,
}

/// A source position. Positions apply to every following instruction
/// until the next position item. `parent` chains inlined frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub file: StringId,
    pub line: u32,
    pub method: Option<MethodId>,
    pub parent: Option<ItemId>,
}

/// Local-variable debug info ops, carried through transformations
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugOp {
    StartLocal { reg: Reg, name: StringId },
    EndLocal { reg: Reg },
    RestartLocal { reg: Reg },
    SetPrologueEnd,
    SetEpilogueBegin,
}

#[derive(Debug, Clone)]
pub enum ItemKind {
    Insn(IrInstruction),
    Target(BranchTarget),
    TryStart(TryMarker),
    TryEnd(TryMarker),
    Catch(CatchEntry),
    Position(Position),
    Debug(DebugOp),
    Fallthrough,
}

#[derive(Debug, Clone)]
pub struct Item {
    pub kind: ItemKind,
    prev: Option<ItemId>,
    next: Option<ItemId>,
}

/// The slab all items of one method live in. Freed slots are never
/// reused, so ids stay stable for the lifetime of the method body.
#[derive(Debug, Default, Clone)]
pub struct ItemArena {
    slots: Vec<Option<Item>>,
}

impl ItemArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, kind: ItemKind) -> ItemId {
        let id = ItemId(self.slots.len() as u32);
        self.slots.push(Some(Item { kind, prev: None, next: None }));
        id
    }

    pub fn free(&mut self, id: ItemId) {
        let slot = &mut self.slots[id.0 as usize];
        assert!(slot.is_some(), "double free of {}", id);
        *slot = None;
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.slots
            .get(id.0 as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, id: ItemId) -> &Item {
        self.slots[id.0 as usize].as_ref().expect("use of freed item")
    }

    fn get_mut(&mut self, id: ItemId) -> &mut Item {
        self.slots[id.0 as usize].as_mut().expect("use of freed item")
    }

    pub fn kind(&self, id: ItemId) -> &ItemKind {
        &self.get(id).kind
    }

    pub fn kind_mut(&mut self, id: ItemId) -> &mut ItemKind {
        &mut self.get_mut(id).kind
    }

    pub fn next(&self, id: ItemId) -> Option<ItemId> {
        self.get(id).next
    }

    pub fn prev(&self, id: ItemId) -> Option<ItemId> {
        self.get(id).prev
    }

    pub fn is_insn(&self, id: ItemId) -> bool {
        matches!(self.kind(id), ItemKind::Insn(_))
    }

    pub fn insn(&self, id: ItemId) -> &IrInstruction {
        match self.kind(id) {
            ItemKind::Insn(insn) => insn,
            other => panic!("{} is not an instruction: {:?}", id, other),
        }
    }

    pub fn insn_mut(&mut self, id: ItemId) -> &mut IrInstruction {
        match self.kind_mut(id) {
            ItemKind::Insn(insn) => insn,
            other => panic!("{} is not an instruction: {:?}", id, other),
        }
    }
}

/// A doubly-linked list of items inside a shared arena. The list itself
/// is just a pair of endpoints; all structure lives in the items.
#[derive(Debug, Default, Clone, Copy)]
pub struct IrList {
    head: Option<ItemId>,
    tail: Option<ItemId>,
}

impl IrList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<ItemId> {
        self.head
    }

    pub fn tail(&self) -> Option<ItemId> {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_back(&mut self, arena: &mut ItemArena, kind: ItemKind) -> ItemId {
        let id = arena.alloc(kind);
        self.link_back(arena, id);
        id
    }

    pub fn push_front(&mut self, arena: &mut ItemArena, kind: ItemKind) -> ItemId {
        let id = arena.alloc(kind);
        self.link_front(arena, id);
        id
    }

    pub fn insert_before(&mut self, arena: &mut ItemArena, pos: ItemId, kind: ItemKind) -> ItemId {
        let id = arena.alloc(kind);
        self.link_before(arena, pos, id);
        id
    }

    pub fn insert_after(&mut self, arena: &mut ItemArena, pos: ItemId, kind: ItemKind) -> ItemId {
        let id = arena.alloc(kind);
        self.link_after(arena, pos, id);
        id
    }

    /// Links a free-floating item at the end.
    pub fn link_back(&mut self, arena: &mut ItemArena, id: ItemId) {
        match self.tail {
            None => {
                self.head = Some(id);
                self.tail = Some(id);
            }
            Some(tail) => {
                arena.get_mut(tail).next = Some(id);
                arena.get_mut(id).prev = Some(tail);
                self.tail = Some(id);
            }
        }
    }

    /// Links a free-floating item at the front.
    pub fn link_front(&mut self, arena: &mut ItemArena, id: ItemId) {
        match self.head {
            None => {
                self.head = Some(id);
                self.tail = Some(id);
            }
            Some(head) => {
                arena.get_mut(head).prev = Some(id);
                arena.get_mut(id).next = Some(head);
                self.head = Some(id);
            }
        }
    }

    pub fn link_before(&mut self, arena: &mut ItemArena, pos: ItemId, id: ItemId) {
        let prev = arena.get(pos).prev;
        arena.get_mut(id).prev = prev;
        arena.get_mut(id).next = Some(pos);
        arena.get_mut(pos).prev = Some(id);
        match prev {
            None => self.head = Some(id),
            Some(p) => arena.get_mut(p).next = Some(id),
        }
    }

    pub fn link_after(&mut self, arena: &mut ItemArena, pos: ItemId, id: ItemId) {
        let next = arena.get(pos).next;
        arena.get_mut(id).next = next;
        arena.get_mut(id).prev = Some(pos);
        arena.get_mut(pos).next = Some(id);
        match next {
            None => self.tail = Some(id),
            Some(n) => arena.get_mut(n).prev = Some(id),
        }
    }

    /// Unlinks `id` from the list without freeing it; returns the item
    /// that followed it.
    pub fn unlink(&mut self, arena: &mut ItemArena, id: ItemId) -> Option<ItemId> {
        let (prev, next) = {
            let item = arena.get(id);
            (item.prev, item.next)
        };
        match prev {
            None => self.head = next,
            Some(p) => arena.get_mut(p).next = next,
        }
        match next {
            None => self.tail = prev,
            Some(n) => arena.get_mut(n).prev = prev,
        }
        let item = arena.get_mut(id);
        item.prev = None;
        item.next = None;
        next
    }

    /// Unlinks and frees `id`; returns the item that followed it.
    pub fn erase(&mut self, arena: &mut ItemArena, id: ItemId) -> Option<ItemId> {
        let next = self.unlink(arena, id);
        arena.free(id);
        next
    }

    /// Moves every item of `other` to the end of `self`.
    pub fn splice_back(&mut self, arena: &mut ItemArena, other: &mut IrList) {
        let (Some(other_head), Some(other_tail)) = (other.head, other.tail) else {
            return;
        };
        match self.tail {
            None => self.head = Some(other_head),
            Some(tail) => {
                arena.get_mut(tail).next = Some(other_head);
                arena.get_mut(other_head).prev = Some(tail);
            }
        }
        self.tail = Some(other_tail);
        other.head = None;
        other.tail = None;
    }

    /// Unlinks the inclusive range `[first, last]` and returns it as a
    /// list of its own. The range must be well-formed within `self`.
    pub fn steal_range(&mut self, arena: &mut ItemArena, first: ItemId, last: ItemId) -> IrList {
        let prev = arena.get(first).prev;
        let next = arena.get(last).next;
        match prev {
            None => self.head = next,
            Some(p) => arena.get_mut(p).next = next,
        }
        match next {
            None => self.tail = prev,
            Some(n) => arena.get_mut(n).prev = prev,
        }
        arena.get_mut(first).prev = None;
        arena.get_mut(last).next = None;
        IrList { head: Some(first), tail: Some(last) }
    }

    /// Item ids in order. Collecting up front keeps mutation during the
    /// walk sound; use `arena.next()` cursors for cheap read-only scans.
    pub fn ids(&self, arena: &ItemArena) -> Vec<ItemId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = arena.next(id);
        }
        out
    }

    /// Ids of instruction items, in order.
    pub fn insn_ids(&self, arena: &ItemArena) -> Vec<ItemId> {
        self.ids(arena)
            .into_iter()
            .filter(|id| arena.is_insn(*id))
            .collect()
    }

    pub fn len(&self, arena: &ItemArena) -> usize {
        self.ids(arena).len()
    }

    /// The first instruction item, skipping non-opcode items.
    pub fn first_insn(&self, arena: &ItemArena) -> Option<ItemId> {
        let mut cur = self.head;
        while let Some(id) = cur {
            if arena.is_insn(id) {
                return Some(id);
            }
            cur = arena.next(id);
        }
        None
    }

    /// The last instruction item, skipping non-opcode items.
    pub fn last_insn(&self, arena: &ItemArena) -> Option<ItemId> {
        let mut cur = self.tail;
        while let Some(id) = cur {
            if arena.is_insn(id) {
                return Some(id);
            }
            cur = arena.prev(id);
        }
        None
    }

    pub fn count_opcodes(&self, arena: &ItemArena) -> usize {
        self.insn_ids(arena).len()
    }

    pub fn sum_opcode_sizes(&self, arena: &ItemArena) -> u32 {
        self.insn_ids(arena)
            .iter()
            .map(|id| arena.insn(*id).size_estimate() as u32)
            .sum()
    }

    /// The leading load-param instructions of a method body.
    pub fn param_insns(&self, arena: &ItemArena) -> Vec<ItemId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            match arena.kind(id) {
                ItemKind::Insn(insn) if insn.opcode().is_load_param() => out.push(id),
                ItemKind::Insn(_) => break,
                _ => {}
            }
            cur = arena.next(id);
        }
        out
    }

    pub fn gather_strings(&self, arena: &ItemArena, out: &mut Vec<StringId>) {
        for id in self.ids(arena) {
            match arena.kind(id) {
                ItemKind::Insn(insn) => insn.gather_strings(out),
                ItemKind::Position(pos) => out.push(pos.file),
                ItemKind::Debug(DebugOp::StartLocal { name, .. }) => out.push(*name),
                _ => {}
            }
        }
    }

    pub fn gather_types(&self, arena: &ItemArena, out: &mut Vec<TypeId>) {
        for id in self.ids(arena) {
            match arena.kind(id) {
                ItemKind::Insn(insn) => insn.gather_types(out),
                ItemKind::Catch(entry) => {
                    if let Some(t) = entry.catch_type {
                        out.push(t);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn gather_fields(&self, arena: &ItemArena, out: &mut Vec<FieldId>) {
        for id in self.insn_ids(arena) {
            arena.insn(id).gather_fields(out);
        }
    }

    pub fn gather_methods(&self, arena: &ItemArena, out: &mut Vec<MethodId>) {
        for id in self.ids(arena) {
            match arena.kind(id) {
                ItemKind::Insn(insn) => insn.gather_methods(out),
                ItemKind::Position(pos) => {
                    if let Some(m) = pos.method {
                        out.push(m);
                    }
                }
                _ => {}
            }
        }
    }

    /// Deep-clones this list into `arena`, fixing up every identity
    /// back-pointer (target -> branch, catch -> next catch, position ->
    /// parent) through a translation map built in a first pass.
    pub fn deep_clone(&self, arena: &mut ItemArena) -> IrList {
        let ids = self.ids(arena);
        let mut translation: HashMap<ItemId, ItemId> = HashMap::with_capacity(ids.len());
        let mut clone = IrList::new();
        for &id in &ids {
            let kind = arena.kind(id).clone();
            let new_id = clone.push_back(arena, kind);
            translation.insert(id, new_id);
        }
        // Second pass: retarget ids through the translation map. A
        // reference that stays untranslated points outside the cloned
        // range (e.g. a position parent in a caller) and is kept as-is.
        for &id in &ids {
            let new_id = translation[&id];
            match &mut arena.get_mut(new_id).kind {
                ItemKind::Target(target) => {
                    if let Some(t) = translation.get(&target.src) {
                        target.src = *t;
                    }
                }
                ItemKind::TryStart(marker) | ItemKind::TryEnd(marker) => {
                    if let Some(t) = translation.get(&marker.catch_start) {
                        marker.catch_start = *t;
                    }
                }
                ItemKind::Catch(entry) => {
                    if let Some(next) = entry.next {
                        if let Some(t) = translation.get(&next) {
                            entry.next = Some(*t);
                        }
                    }
                }
                ItemKind::Position(pos) => {
                    if let Some(parent) = pos.parent {
                        if let Some(t) = translation.get(&parent) {
                            pos.parent = Some(*t);
                        }
                    }
                }
                _ => {}
            }
        }
        clone
    }
}

/// A method body: the register count plus the item stream and its arena.
#[derive(Debug, Default, Clone)]
pub struct IrCode {
    pub registers_size: u32,
    pub arena: ItemArena,
    pub list: IrList,
}

impl IrCode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instruction and returns its item id.
    pub fn push(&mut self, insn: IrInstruction) -> ItemId {
        self.list.push_back(&mut self.arena, ItemKind::Insn(insn))
    }

    pub fn push_item(&mut self, kind: ItemKind) -> ItemId {
        self.list.push_back(&mut self.arena, kind)
    }

    pub fn insn_ids(&self) -> Vec<ItemId> {
        self.list.insn_ids(&self.arena)
    }
}

impl fmt::Display for IrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.list.ids(&self.arena) {
            match self.arena.kind(id) {
                ItemKind::Insn(insn) => writeln!(f, "  {}", insn)?,
                ItemKind::Target(t) => writeln!(
                    f,
                    "  TARGET{} <- {}",
                    t.case_key.map(|k| format!("[{}]", k)).unwrap_or_default(),
                    t.src
                )?,
                ItemKind::TryStart(m) => writeln!(f, "  TRY_START {}", m.catch_start)?,
                ItemKind::TryEnd(m) => writeln!(f, "  TRY_END {}", m.catch_start)?,
                ItemKind::Catch(c) => writeln!(f, "  CATCH {:?} next={:?}", c.catch_type, c.next)?,
                ItemKind::Position(p) => writeln!(f, "  .pos line={}", p.line)?,
                ItemKind::Debug(d) => writeln!(f, "  .debug {:?}", d)?,
                ItemKind::Fallthrough => writeln!(f, "  FALLTHROUGH")?,
            }
        }
        Ok(())
    }
}
