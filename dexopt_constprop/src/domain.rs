//! The abstract values of constant propagation
//!
//! A register holds one of several kinds of compile-time value: a signed
//! integer approximation, an interned string or class literal, a
//! singleton object named by the unique static field that holds it, an
//! object freshly created at a known instruction, or an abstract pointer
//! into the local heap of non-escaped arrays. The disjoint union of those
//! cells forms [`ConstantValue`]; the reduced product of the register
//! environment, the field environment and the array heap forms
//! [`ConstantEnvironment`].

use dexopt_analysis::domains::{
    AbstractDomain, PatriciaTreeMapEnvironment, SignedConstantDomain,
};
use dexopt_ir::{ItemId, Reg, TypeId};
use dexopt_ir::refs::{FieldId, StringId};
use std::fmt;

/// An object (class instance or array) created at one particular
/// instruction: the creating instruction's identity, the created type,
/// and, for arrays, the length constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObjectDomain {
    pub insn: ItemId,
    pub object_type: TypeId,
    pub array_length: SignedConstantDomain,
}

impl NewObjectDomain {
    pub fn new(insn: ItemId, object_type: TypeId) -> Self {
        Self { insn, object_type, array_length: SignedConstantDomain::top() }
    }

    pub fn with_length(insn: ItemId, object_type: TypeId, length: SignedConstantDomain) -> Self {
        Self { insn, object_type, array_length: length }
    }
}

/// The disjoint union of all value cells. The inner values of the
/// non-trivial variants are never top or bottom; construction and every
/// lattice operation normalize.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConstantValue {
    #[default]
    Top,
    Bottom,
    SignedConstant(SignedConstantDomain),
    String(StringId),
    Class(TypeId),
    /// An object uniquely referenced by a single static field, so two of
    /// these compare equal exactly when the fields match.
    SingletonObject(FieldId),
    NewObject(NewObjectDomain),
    /// A pointer to a non-escaped array in the abstract heap, named by
    /// its new-array instruction.
    HeapPointer(ItemId),
}

impl ConstantValue {
    pub fn signed(v: SignedConstantDomain) -> Self {
        if v.is_top() {
            ConstantValue::Top
        } else if v.is_bottom() {
            ConstantValue::Bottom
        } else {
            ConstantValue::SignedConstant(v)
        }
    }

    pub fn constant(v: i64) -> Self {
        ConstantValue::SignedConstant(SignedConstantDomain::new(v))
    }

    /// The signed-constant view of this value: exact for the signed cell,
    /// top for any object-like cell (whose bit pattern is unknown).
    pub fn as_signed(&self) -> SignedConstantDomain {
        match self {
            ConstantValue::Bottom => SignedConstantDomain::bottom(),
            ConstantValue::SignedConstant(s) => *s,
            // Objects are non-null references; their numeric comparison
            // against zero is decided, everything else is not.
            ConstantValue::String(_)
            | ConstantValue::Class(_)
            | ConstantValue::SingletonObject(_)
            | ConstantValue::NewObject(_)
            | ConstantValue::HeapPointer(_) => SignedConstantDomain::nez(),
            ConstantValue::Top => SignedConstantDomain::top(),
        }
    }

    pub fn get_constant(&self) -> Option<i64> {
        match self {
            ConstantValue::SignedConstant(s) => s.get_constant(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<StringId> {
        match self {
            ConstantValue::String(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<TypeId> {
        match self {
            ConstantValue::Class(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_heap_pointer(&self) -> Option<ItemId> {
        match self {
            ConstantValue::HeapPointer(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_new_object(&self) -> Option<&NewObjectDomain> {
        match self {
            ConstantValue::NewObject(n) => Some(n),
            _ => None,
        }
    }

    /// Whether this value is known to be a non-null reference.
    pub fn is_object_like(&self) -> bool {
        matches!(
            self,
            ConstantValue::String(_)
                | ConstantValue::Class(_)
                | ConstantValue::SingletonObject(_)
                | ConstantValue::NewObject(_)
                | ConstantValue::HeapPointer(_)
        )
    }
}

impl AbstractDomain for ConstantValue {
    fn bottom() -> Self {
        ConstantValue::Bottom
    }

    fn top() -> Self {
        ConstantValue::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, ConstantValue::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, ConstantValue::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        use ConstantValue::*;
        match (self, other) {
            (Bottom, _) => true,
            (_, Top) => true,
            (Top, _) => false,
            (_, Bottom) => false,
            (SignedConstant(a), SignedConstant(b)) => a.leq(b),
            (String(a), String(b)) => a == b,
            (Class(a), Class(b)) => a == b,
            (SingletonObject(a), SingletonObject(b)) => a == b,
            (HeapPointer(a), HeapPointer(b)) => a == b,
            (NewObject(a), NewObject(b)) => {
                a.insn == b.insn
                    && a.object_type == b.object_type
                    && a.array_length.leq(&b.array_length)
            }
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        use ConstantValue::*;
        let result = match (&*self, other) {
            (_, Bottom) => return,
            (Bottom, _) => other.clone(),
            (Top, _) | (_, Top) => Top,
            (SignedConstant(a), SignedConstant(b)) => ConstantValue::signed(a.join(b)),
            (String(a), String(b)) if a == b => return,
            (Class(a), Class(b)) if a == b => return,
            (SingletonObject(a), SingletonObject(b)) if a == b => return,
            (HeapPointer(a), HeapPointer(b)) if a == b => return,
            (NewObject(a), NewObject(b)) if a.insn == b.insn && a.object_type == b.object_type => {
                NewObject(NewObjectDomain {
                    insn: a.insn,
                    object_type: a.object_type,
                    array_length: a.array_length.join(&b.array_length),
                })
            }
            _ => Top,
        };
        *self = result;
    }

    fn widen_with(&mut self, other: &Self) {
        use ConstantValue::*;
        // Only the signed cell has infinite ascending chains.
        if let (SignedConstant(a), SignedConstant(b)) = (&*self, other) {
            let mut widened = *a;
            widened.widen_with(b);
            *self = ConstantValue::signed(widened);
        } else {
            self.join_with(other);
        }
    }

    fn meet_with(&mut self, other: &Self) {
        use ConstantValue::*;
        let result = match (&*self, other) {
            (_, Top) => return,
            (Top, _) => other.clone(),
            (Bottom, _) | (_, Bottom) => Bottom,
            (SignedConstant(a), SignedConstant(b)) => ConstantValue::signed(a.meet(b)),
            (String(a), String(b)) if a == b => return,
            (Class(a), Class(b)) if a == b => return,
            (SingletonObject(a), SingletonObject(b)) if a == b => return,
            (HeapPointer(a), HeapPointer(b)) if a == b => return,
            (NewObject(a), NewObject(b)) if a.insn == b.insn && a.object_type == b.object_type => {
                let length = a.array_length.meet(&b.array_length);
                if length.is_bottom() {
                    Bottom
                } else {
                    NewObject(NewObjectDomain {
                        insn: a.insn,
                        object_type: a.object_type,
                        array_length: length,
                    })
                }
            }
            // Cross-cell reduction: a signed-constant constraint meeting
            // an object-like value keeps the object when the constraint
            // admits non-null, and collapses to bottom when the
            // constraint pins the value to null.
            (SignedConstant(s), v) if v.is_object_like() => {
                if s.get_constant() == Some(0) {
                    Bottom
                } else {
                    other.clone()
                }
            }
            (v, SignedConstant(s)) if v.is_object_like() => {
                if s.get_constant() == Some(0) {
                    Bottom
                } else {
                    return;
                }
            }
            _ => Bottom,
        };
        *self = result;
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Top => write!(f, "T"),
            ConstantValue::Bottom => write!(f, "_|_"),
            ConstantValue::SignedConstant(s) => write!(f, "{}", s),
            ConstantValue::String(s) => write!(f, "\"{}\"", dexopt_ir::refs::string(*s)),
            ConstantValue::Class(t) => write!(f, "{}", dexopt_ir::refs::type_descriptor(*t)),
            ConstantValue::SingletonObject(fi) => {
                write!(f, "singleton({})", dexopt_ir::refs::show_field(*fi))
            }
            ConstantValue::NewObject(n) => write!(f, "new@{}", n.insn),
            ConstantValue::HeapPointer(p) => write!(f, "ptr@{}", p),
        }
    }
}

/// An array of statically known size in the local heap. Reads out of
/// bounds yield bottom; writes out of bounds poison the whole array; an
/// array of unknown length can't be reasoned about at all and is top.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConstantArrayDomain {
    #[default]
    Top,
    Bottom,
    Array {
        length: u32,
        values: PatriciaTreeMapEnvironment<SignedConstantDomain>,
    },
}

impl ConstantArrayDomain {
    /// A fresh array: Java arrays are zero-initialized.
    pub fn new(length: u32) -> Self {
        let mut values = PatriciaTreeMapEnvironment::top();
        for i in 0..length {
            values.set(i, SignedConstantDomain::new(0));
        }
        ConstantArrayDomain::Array { length, values }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, ConstantArrayDomain::Array { .. })
    }

    pub fn length(&self) -> Option<u32> {
        match self {
            ConstantArrayDomain::Array { length, .. } => Some(*length),
            _ => None,
        }
    }

    pub fn get(&self, idx: u32) -> SignedConstantDomain {
        match self {
            ConstantArrayDomain::Top => SignedConstantDomain::top(),
            ConstantArrayDomain::Bottom => SignedConstantDomain::bottom(),
            ConstantArrayDomain::Array { length, values } => {
                if idx < *length {
                    values.get(idx)
                } else {
                    SignedConstantDomain::bottom()
                }
            }
        }
    }

    pub fn set(&mut self, idx: u32, value: SignedConstantDomain) {
        if let ConstantArrayDomain::Array { length, values } = self {
            if idx < *length {
                values.set(idx, value);
            } else {
                *self = ConstantArrayDomain::Bottom;
            }
        }
    }
}

impl AbstractDomain for ConstantArrayDomain {
    fn bottom() -> Self {
        ConstantArrayDomain::Bottom
    }

    fn top() -> Self {
        ConstantArrayDomain::Top
    }

    fn is_bottom(&self) -> bool {
        matches!(self, ConstantArrayDomain::Bottom)
    }

    fn is_top(&self) -> bool {
        matches!(self, ConstantArrayDomain::Top)
    }

    fn leq(&self, other: &Self) -> bool {
        use ConstantArrayDomain::*;
        match (self, other) {
            (Bottom, _) => true,
            (_, Top) => true,
            (Top, _) => false,
            (_, Bottom) => false,
            (Array { length: l1, values: v1 }, Array { length: l2, values: v2 }) => {
                l1 == l2 && v1.leq(v2)
            }
        }
    }

    fn join_with(&mut self, other: &Self) {
        use ConstantArrayDomain::*;
        match (&mut *self, other) {
            (_, Bottom) => {}
            (Bottom, _) => *self = other.clone(),
            (Top, _) => {}
            (_, Top) => *self = Top,
            (Array { length: l1, values: v1 }, Array { length: l2, values: v2 }) => {
                // Joining arrays of different lengths loses the length,
                // and an unknown length forces all values to top.
                if l1 != l2 {
                    *self = Top;
                } else {
                    v1.join_with(v2);
                }
            }
        }
    }

    fn widen_with(&mut self, other: &Self) {
        use ConstantArrayDomain::*;
        match (&mut *self, other) {
            (_, Bottom) => {}
            (Bottom, _) => *self = other.clone(),
            (Top, _) => {}
            (_, Top) => *self = Top,
            (Array { length: l1, values: v1 }, Array { length: l2, values: v2 }) => {
                if l1 != l2 {
                    *self = Top;
                } else {
                    v1.widen_with(v2);
                }
            }
        }
    }

    fn meet_with(&mut self, other: &Self) {
        use ConstantArrayDomain::*;
        match (&mut *self, other) {
            (_, Top) => {}
            (Top, _) => *self = other.clone(),
            (Bottom, _) => {}
            (_, Bottom) => *self = Bottom,
            (Array { length: l1, values: v1 }, Array { length: l2, values: v2 }) => {
                if l1 != l2 {
                    *self = Bottom;
                } else {
                    v1.meet_with(v2);
                    if v1.is_bottom() {
                        *self = Bottom;
                    }
                }
            }
        }
    }
}

/// The register that models the pending result of an invoke,
/// filled-new-array, or any instruction split with a move-result-pseudo.
pub use dexopt_ir::RESULT_REGISTER;

/// The constant-valued arguments at a call boundary: a binding from
/// parameter *index* (not register) to value. Structurally this is the
/// same environment shape as the register map, but the two should never
/// be confused.
pub type ArgumentDomain = PatriciaTreeMapEnvironment<ConstantValue>;

type ValueEnvironment = PatriciaTreeMapEnvironment<ConstantValue>;
type HeapEnvironment = PatriciaTreeMapEnvironment<ConstantArrayDomain>;

/// The combined model of registers, fields and the local array heap.
/// A reduced product: any component at bottom takes the whole
/// environment down with it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstantEnvironment {
    regs: ValueEnvironment,
    fields: ValueEnvironment,
    heap: HeapEnvironment,
}

impl ConstantEnvironment {
    pub fn get(&self, reg: Reg) -> ConstantValue {
        self.regs.get(reg)
    }

    pub fn set(&mut self, reg: Reg, value: ConstantValue) {
        self.regs.set(reg, value);
        self.reduce();
    }

    pub fn get_field(&self, field: FieldId) -> ConstantValue {
        self.fields.get(field.0)
    }

    pub fn set_field(&mut self, field: FieldId, value: ConstantValue) {
        self.fields.set(field.0, value);
        self.reduce();
    }

    pub fn clear_field_environment(&mut self) {
        if !self.is_bottom() {
            self.fields = ValueEnvironment::top();
        }
    }

    /// Binds `reg` to a fresh heap pointer created by the instruction at
    /// `ptr`, pointing at `array`.
    pub fn set_array(&mut self, reg: Reg, ptr: ItemId, array: ConstantArrayDomain) {
        self.regs.set(reg, ConstantValue::HeapPointer(ptr));
        self.heap.set(ptr.0, array);
        self.reduce();
    }

    /// The array pointed to by the pointer in `reg`.
    pub fn get_array(&self, reg: Reg) -> ConstantArrayDomain {
        match self.get(reg) {
            ConstantValue::HeapPointer(ptr) => self.heap.get(ptr.0),
            ConstantValue::Bottom => ConstantArrayDomain::bottom(),
            _ => ConstantArrayDomain::top(),
        }
    }

    /// Binds arr[idx] where arr is the array referenced by `reg`. A write
    /// through an unknown pointer is a no-op (the heap is already top
    /// there).
    pub fn set_array_binding(&mut self, reg: Reg, idx: u32, value: SignedConstantDomain) {
        if let ConstantValue::HeapPointer(ptr) = self.get(reg) {
            let mut array = self.heap.get(ptr.0);
            array.set(idx, value);
            self.heap.set(ptr.0, array);
            self.reduce();
        }
    }

    /// Drops all knowledge about the array behind `reg` (it escaped).
    pub fn escape_array(&mut self, reg: Reg) {
        if let ConstantValue::HeapPointer(ptr) = self.get(reg) {
            self.heap.set(ptr.0, ConstantArrayDomain::top());
        }
        self.regs.set(reg, ConstantValue::Top);
    }

    fn reduce(&mut self) {
        if self.regs.is_bottom() || self.fields.is_bottom() || self.heap.is_bottom() {
            *self = Self::bottom();
        }
    }
}

impl AbstractDomain for ConstantEnvironment {
    fn bottom() -> Self {
        ConstantEnvironment {
            regs: ValueEnvironment::bottom(),
            fields: ValueEnvironment::bottom(),
            heap: HeapEnvironment::bottom(),
        }
    }

    fn top() -> Self {
        ConstantEnvironment::default()
    }

    fn is_bottom(&self) -> bool {
        self.regs.is_bottom()
    }

    fn is_top(&self) -> bool {
        self.regs.is_top() && self.fields.is_top() && self.heap.is_top()
    }

    fn leq(&self, other: &Self) -> bool {
        self.regs.leq(&other.regs)
            && self.fields.leq(&other.fields)
            && self.heap.leq(&other.heap)
    }

    fn join_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = other.clone();
            return;
        }
        self.regs.join_with(&other.regs);
        self.fields.join_with(&other.fields);
        self.heap.join_with(&other.heap);
    }

    fn widen_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = other.clone();
            return;
        }
        self.regs.widen_with(&other.regs);
        self.fields.widen_with(&other.fields);
        self.heap.widen_with(&other.heap);
    }

    fn meet_with(&mut self, other: &Self) {
        self.regs.meet_with(&other.regs);
        self.fields.meet_with(&other.fields);
        self.heap.meet_with(&other.heap);
        self.reduce();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexopt_ir::refs::{make_field_desc, make_string};

    #[test]
    fn test_disjoint_union_join() {
        let a = ConstantValue::constant(1);
        let b = ConstantValue::constant(3);
        let joined = a.clone().join(&b);
        assert_eq!(joined.as_signed().min_element(), 1);
        assert_eq!(joined.as_signed().max_element(), 3);

        // Joining different cells goes to top.
        let s = ConstantValue::String(make_string("x"));
        assert!(a.join(&s).is_top());
    }

    #[test]
    fn test_nez_meet_keeps_object() {
        let obj = ConstantValue::SingletonObject(make_field_desc("LB;.TRUE:LB;"));
        let nez = ConstantValue::signed(SignedConstantDomain::nez());
        assert_eq!(nez.meet(&obj), obj);
        assert_eq!(obj.clone().meet(&ConstantValue::signed(SignedConstantDomain::nez())), obj);
        // A null constraint on a known object is a contradiction.
        let null = ConstantValue::constant(0);
        assert!(obj.meet(&null).is_bottom());
    }

    #[test]
    fn test_object_values_are_nonnull() {
        let obj = ConstantValue::String(make_string("s"));
        assert!(obj.as_signed().is_nez());
    }

    #[test]
    fn test_array_out_of_bounds() {
        let mut array = ConstantArrayDomain::new(2);
        array.set(0, SignedConstantDomain::new(7));
        assert_eq!(array.get(0).get_constant(), Some(7));
        // Reads are zero-initialized in bounds, bottom out of bounds.
        assert_eq!(array.get(1).get_constant(), Some(0));
        assert!(array.get(5).is_bottom());
        // An out-of-bounds write poisons the array.
        array.set(5, SignedConstantDomain::new(1));
        assert!(array.is_bottom());
    }

    #[test]
    fn test_array_join_mismatched_lengths_is_top() {
        let a = ConstantArrayDomain::new(2);
        let b = ConstantArrayDomain::new(3);
        assert!(a.join(&b).is_top());
    }

    #[test]
    fn test_environment_array_plumbing() {
        let mut env = ConstantEnvironment::top();
        let ptr = ItemId(42);
        env.set_array(0, ptr, ConstantArrayDomain::new(2));
        env.set_array_binding(0, 1, SignedConstantDomain::new(9));
        assert_eq!(env.get_array(0).get(1).get_constant(), Some(9));
        assert_eq!(env.get_array(0).get(0).get_constant(), Some(0));

        // A move of the pointer aliases the same array.
        let value = env.get(0);
        env.set(1, value);
        assert_eq!(env.get_array(1).get(1).get_constant(), Some(9));

        env.escape_array(0);
        assert!(env.get_array(1).is_top());
    }

    #[test]
    fn test_environment_bottom_reduction() {
        let mut env = ConstantEnvironment::top();
        env.set(0, ConstantValue::Bottom);
        assert!(env.is_bottom());
        assert!(env.get(5).is_bottom());
    }
}
