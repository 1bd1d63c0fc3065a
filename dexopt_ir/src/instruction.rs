//! The IR instruction
//!
//! An opcode plus at most one destination register, a variable-length
//! source list (invokes make this essential), and at most one payload:
//! a 64-bit literal or an interned string/type/field/method reference or
//! a fill-array-data table.

use crate::opcode::{Opcode, OpcodeGroup, RefKind};
use crate::refs::{self, FieldId, MethodId, StringId, TypeId};
use crate::Reg;
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The payload table of a fill-array-data instruction: raw element values
/// at the given element width.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FillArrayData {
    pub element_width: u16,
    pub values: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Payload {
    None,
    Literal(i64),
    String(StringId),
    Type(TypeId),
    Field(FieldId),
    Method(MethodId),
    Data(Arc<FillArrayData>),
}

#[derive(Debug, Clone)]
pub struct IrInstruction {
    opcode: Opcode,
    dest: Reg,
    srcs: SmallVec<[Reg; 4]>,
    payload: Payload,
}

impl IrInstruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            dest: 0,
            srcs: SmallVec::new(),
            payload: Payload::None,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode;
    }

    pub fn has_dest(&self) -> bool {
        self.opcode.has_dest()
    }

    pub fn dest(&self) -> Reg {
        assert!(self.opcode.has_dest(), "no dest for {:?}", self.opcode);
        self.dest
    }

    pub fn set_dest(&mut self, reg: Reg) {
        assert!(self.opcode.has_dest(), "no dest for {:?}", self.opcode);
        self.dest = reg;
    }

    pub fn with_dest(mut self, reg: Reg) -> Self {
        self.set_dest(reg);
        self
    }

    pub fn srcs(&self) -> &[Reg] {
        &self.srcs
    }

    pub fn srcs_size(&self) -> usize {
        self.srcs.len()
    }

    pub fn src(&self, i: usize) -> Reg {
        self.srcs[i]
    }

    pub fn set_src(&mut self, i: usize, reg: Reg) {
        self.srcs[i] = reg;
    }

    pub fn set_srcs(&mut self, srcs: impl IntoIterator<Item = Reg>) {
        self.srcs = srcs.into_iter().collect();
    }

    pub fn with_srcs(mut self, srcs: impl IntoIterator<Item = Reg>) -> Self {
        self.set_srcs(srcs);
        self
    }

    pub fn with_src(mut self, reg: Reg) -> Self {
        self.srcs.push(reg);
        self
    }

    pub fn has_literal(&self) -> bool {
        self.opcode.ref_kind() == RefKind::Literal
    }

    pub fn literal(&self) -> i64 {
        match &self.payload {
            Payload::Literal(v) => *v,
            _ => panic!("no literal on {:?}", self.opcode),
        }
    }

    pub fn set_literal(&mut self, v: i64) {
        assert!(self.has_literal(), "no literal on {:?}", self.opcode);
        self.payload = Payload::Literal(v);
    }

    pub fn with_literal(mut self, v: i64) -> Self {
        self.set_literal(v);
        self
    }

    pub fn has_string(&self) -> bool {
        self.opcode.ref_kind() == RefKind::String
    }

    pub fn string(&self) -> StringId {
        match &self.payload {
            Payload::String(s) => *s,
            _ => panic!("no string on {:?}", self.opcode),
        }
    }

    pub fn with_string(mut self, s: StringId) -> Self {
        assert!(self.has_string(), "no string on {:?}", self.opcode);
        self.payload = Payload::String(s);
        self
    }

    pub fn has_type(&self) -> bool {
        self.opcode.ref_kind() == RefKind::Type
    }

    pub fn type_ref(&self) -> TypeId {
        match &self.payload {
            Payload::Type(t) => *t,
            _ => panic!("no type on {:?}", self.opcode),
        }
    }

    pub fn with_type(mut self, t: TypeId) -> Self {
        assert!(self.has_type(), "no type on {:?}", self.opcode);
        self.payload = Payload::Type(t);
        self
    }

    pub fn has_field(&self) -> bool {
        self.opcode.ref_kind() == RefKind::Field
    }

    pub fn field(&self) -> FieldId {
        match &self.payload {
            Payload::Field(fi) => *fi,
            _ => panic!("no field on {:?}", self.opcode),
        }
    }

    pub fn with_field(mut self, fi: FieldId) -> Self {
        assert!(self.has_field(), "no field on {:?}", self.opcode);
        self.payload = Payload::Field(fi);
        self
    }

    pub fn has_method(&self) -> bool {
        self.opcode.ref_kind() == RefKind::Method
    }

    pub fn method(&self) -> MethodId {
        match &self.payload {
            Payload::Method(m) => *m,
            _ => panic!("no method on {:?}", self.opcode),
        }
    }

    pub fn with_method(mut self, m: MethodId) -> Self {
        assert!(self.has_method(), "no method on {:?}", self.opcode);
        self.payload = Payload::Method(m);
        self
    }

    pub fn has_data(&self) -> bool {
        self.opcode.ref_kind() == RefKind::Data
    }

    pub fn data(&self) -> &Arc<FillArrayData> {
        match &self.payload {
            Payload::Data(d) => d,
            _ => panic!("no data on {:?}", self.opcode),
        }
    }

    pub fn with_data(mut self, d: FillArrayData) -> Self {
        assert!(self.has_data(), "no data on {:?}", self.opcode);
        self.payload = Payload::Data(Arc::new(d));
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn dest_is_wide(&self) -> bool {
        self.opcode.dest_is_wide()
    }

    /// Whether source position `i` names the low half of a wide pair. For
    /// invokes the answer comes from the callee signature applied to the
    /// normalized argument list.
    pub fn src_is_wide(&self, i: usize) -> bool {
        if self.opcode.is_invoke() {
            self.invoke_arg_is_wide(i)
        } else {
            self.opcode.src_is_wide_at(i)
        }
    }

    pub fn is_wide(&self) -> bool {
        (0..self.srcs_size()).any(|i| self.src_is_wide(i))
            || (self.has_dest() && self.dest_is_wide())
    }

    fn invoke_arg_types(&self) -> Vec<Option<TypeId>> {
        // None stands for the receiver, which is never wide.
        let proto = refs::proto(refs::method(self.method()).proto);
        let mut types: Vec<Option<TypeId>> = Vec::new();
        if self.opcode != Opcode::InvokeStatic {
            types.push(None);
        }
        types.extend(proto.args.iter().map(|t| Some(*t)));
        types
    }

    fn invoke_arg_is_wide(&self, i: usize) -> bool {
        match self.invoke_arg_types().get(i) {
            Some(Some(t)) => refs::type_info(*t).is_wide,
            _ => false,
        }
    }

    /// Rewrites an invoke's source list so that each wide argument is
    /// mentioned once, by its low register only. Analyses always see this
    /// form.
    pub fn normalize_registers(&mut self) {
        if !self.opcode.is_invoke() {
            return;
        }
        let types = self.invoke_arg_types();
        let mut normalized: SmallVec<[Reg; 4]> = SmallVec::new();
        let mut raw = self.srcs.iter().copied();
        for ty in &types {
            let low = raw.next().expect("invoke src list too short for signature");
            normalized.push(low);
            if matches!(ty, Some(t) if refs::type_info(*t).is_wide) {
                let high = raw.next().expect("wide argument missing its high half");
                assert!(high == low + 1, "wide pair {} / {} is not contiguous", low, high);
            }
        }
        assert!(raw.next().is_none(), "invoke src list too long for signature");
        self.srcs = normalized;
    }

    /// The inverse of [`Self::normalize_registers`]: mentions both halves
    /// of each wide argument, as the wire format requires.
    pub fn denormalize_registers(&mut self) {
        if !self.opcode.is_invoke() {
            return;
        }
        let types = self.invoke_arg_types();
        assert_eq!(types.len(), self.srcs.len(), "invoke is not in normalized form");
        let mut denormalized: SmallVec<[Reg; 4]> = SmallVec::new();
        for (ty, &low) in types.iter().zip(self.srcs.iter()) {
            denormalized.push(low);
            if matches!(ty, Some(t) if refs::type_info(*t).is_wide) {
                denormalized.push(low + 1);
            }
        }
        self.srcs = denormalized;
    }

    /// The tightest encodable register index for the destination.
    pub fn dest_bit_width(&self) -> u8 {
        self.opcode.dest_bit_width()
    }

    /// The tightest encodable register index for source `i`.
    pub fn src_bit_width(&self, i: usize) -> u8 {
        self.opcode.src_bit_width(i)
    }

    pub fn gather_strings(&self, out: &mut Vec<StringId>) {
        if let Payload::String(s) = &self.payload {
            out.push(*s);
        }
    }

    pub fn gather_types(&self, out: &mut Vec<TypeId>) {
        if let Payload::Type(t) = &self.payload {
            out.push(*t);
        }
    }

    pub fn gather_fields(&self, out: &mut Vec<FieldId>) {
        if let Payload::Field(fi) = &self.payload {
            out.push(*fi);
        }
    }

    pub fn gather_methods(&self, out: &mut Vec<MethodId>) {
        if let Payload::Method(m) = &self.payload {
            out.push(*m);
        }
    }

    /// Estimated number of 16-bit code units needed to encode this
    /// instruction. The exact encoding is only determined at lowering
    /// time, so this is an upper-ish estimate used for layout decisions.
    pub fn size_estimate(&self) -> u16 {
        match self.opcode.group() {
            OpcodeGroup::LoadParam => 0,
            OpcodeGroup::Nop => 1,
            OpcodeGroup::Move => {
                // move / move-from16 / move-16
                let d = self.dest;
                let s = self.srcs[0];
                if d <= 0xf && s <= 0xf {
                    1
                } else if d <= 0xff {
                    2
                } else {
                    3
                }
            }
            OpcodeGroup::MoveResult if self.opcode.is_move_result_pseudo() => 0,
            OpcodeGroup::MoveResult | OpcodeGroup::MoveException => 1,
            OpcodeGroup::Return | OpcodeGroup::Monitor | OpcodeGroup::Throw => 1,
            OpcodeGroup::Goto => 1,
            OpcodeGroup::Const => {
                let literal = self.literal();
                if self.opcode == Opcode::ConstWide {
                    if fits_signed(literal, 16) {
                        2
                    } else if fits_signed(literal, 32) {
                        3
                    } else {
                        5
                    }
                } else if self.dest <= 0xf && fits_signed(literal, 4) {
                    1
                } else if fits_signed(literal, 16) {
                    2
                } else {
                    3
                }
            }
            OpcodeGroup::ConstString | OpcodeGroup::ConstClass => 2,
            OpcodeGroup::CheckCast
            | OpcodeGroup::InstanceOf
            | OpcodeGroup::NewInstance
            | OpcodeGroup::NewArray
            | OpcodeGroup::Iget
            | OpcodeGroup::Iput
            | OpcodeGroup::Sget
            | OpcodeGroup::Sput => 2,
            OpcodeGroup::ArrayLength => 1,
            OpcodeGroup::FilledNewArray | OpcodeGroup::Invoke => 3,
            OpcodeGroup::FillArrayData => 3,
            OpcodeGroup::Switch => 3,
            OpcodeGroup::Cmp => 2,
            OpcodeGroup::If => 2,
            OpcodeGroup::Aget | OpcodeGroup::Aput => 2,
            OpcodeGroup::Unop => 1,
            OpcodeGroup::Binop => 2,
            OpcodeGroup::BinopLit => 2,
        }
    }

    /// A stable structural hash, usable for instruction deduplication.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

fn fits_signed(v: i64, bits: u32) -> bool {
    let shift = 64 - bits;
    (v << shift) >> shift == v
}

impl PartialEq for IrInstruction {
    fn eq(&self, other: &Self) -> bool {
        self.opcode == other.opcode
            && self.srcs == other.srcs
            && self.payload == other.payload
            && (!self.has_dest() || self.dest == other.dest)
    }
}

impl Eq for IrInstruction {}

impl Hash for IrInstruction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.opcode.hash(state);
        if self.has_dest() {
            self.dest.hash(state);
        }
        self.srcs.hash(state);
        self.payload.hash(state);
    }
}

impl fmt::Display for IrInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.opcode)?;
        if self.has_dest() {
            write!(f, " v{}", self.dest)?;
        }
        for (i, src) in self.srcs.iter().enumerate() {
            if i == 0 && !self.has_dest() {
                write!(f, " v{}", src)?;
            } else {
                write!(f, ", v{}", src)?;
            }
        }
        match &self.payload {
            Payload::None => {}
            Payload::Literal(v) => write!(f, ", #{}", v)?,
            Payload::String(s) => write!(f, ", \"{}\"", refs::string(*s))?,
            Payload::Type(t) => write!(f, ", {}", refs::type_descriptor(*t))?,
            Payload::Field(fi) => write!(f, ", {}", refs::show_field(*fi))?,
            Payload::Method(m) => write!(f, ", {}", refs::show_method(*m))?,
            Payload::Data(d) => write!(f, ", data[{}x{}]", d.values.len(), d.element_width)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::make_method_desc;

    #[test]
    fn test_basic_accessors() {
        let insn = IrInstruction::new(Opcode::Const).with_dest(3).with_literal(42);
        assert_eq!(insn.dest(), 3);
        assert_eq!(insn.literal(), 42);
        assert!(insn.has_literal());
        assert!(!insn.has_string());
    }

    #[test]
    #[should_panic(expected = "no dest")]
    fn test_dest_asserts_on_destless_opcode() {
        let insn = IrInstruction::new(Opcode::Throw).with_src(0);
        let _ = insn.dest();
    }

    #[test]
    fn test_normalize_denormalize_roundtrip() {
        // LBar;.baz:(JI)J called on a receiver: args are (this, J, I).
        let m = make_method_desc("LBar;.baz:(JI)J");
        let mut insn = IrInstruction::new(Opcode::InvokeVirtual)
            .with_method(m)
            .with_srcs([0, 1, 2, 3]); // this=v0, wide v1/v2, int v3

        insn.normalize_registers();
        assert_eq!(insn.srcs(), &[0, 1, 3]);
        assert!(insn.src_is_wide(1));
        assert!(!insn.src_is_wide(0));
        assert!(!insn.src_is_wide(2));

        insn.denormalize_registers();
        assert_eq!(insn.srcs(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_structural_equality_and_hash() {
        let a = IrInstruction::new(Opcode::AddInt).with_dest(0).with_srcs([1, 2]);
        let b = IrInstruction::new(Opcode::AddInt).with_dest(0).with_srcs([1, 2]);
        let c = IrInstruction::new(Opcode::AddInt).with_dest(0).with_srcs([2, 1]);
        assert_eq!(a, b);
        assert_eq!(a.stable_hash(), b.stable_hash());
        assert_ne!(a, c);
    }

    #[test]
    fn test_size_estimates() {
        let small_const = IrInstruction::new(Opcode::Const).with_dest(1).with_literal(7);
        assert_eq!(small_const.size_estimate(), 1);
        let big_const = IrInstruction::new(Opcode::Const).with_dest(1).with_literal(1 << 20);
        assert_eq!(big_const.size_estimate(), 3);
        let wide = IrInstruction::new(Opcode::ConstWide).with_dest(0).with_literal(i64::MAX);
        assert_eq!(wide.size_estimate(), 5);
        let mv = IrInstruction::new(Opcode::Move).with_dest(300).with_src(2);
        assert_eq!(mv.size_estimate(), 3);
    }

    #[test]
    fn test_gather() {
        let m = make_method_desc("LFoo;.f:()V");
        let insn = IrInstruction::new(Opcode::InvokeStatic).with_method(m);
        let mut methods = Vec::new();
        insn.gather_methods(&mut methods);
        assert_eq!(methods, vec![m]);
        let mut strings = Vec::new();
        insn.gather_strings(&mut strings);
        assert!(strings.is_empty());
    }
}
