//! Classes, fields, methods and the scope under optimization
//!
//! The DEX parser (an external collaborator) hands us a list of classes;
//! each class owns its fields (with encoded static values) and its
//! methods, and each method may own a code body. Reference identity lives
//! in the interning tables of [`crate::refs`]; these structures attach
//! the mutable payload -- most importantly the IR code -- to those ids.

use crate::item::IrCode;
use crate::refs::{self, FieldId, MethodId, TypeId};
use hashbrown::HashMap;

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub id: FieldId,
    pub is_static: bool,
    /// The encoded value from the DEX static-values array, when present.
    /// Only primitive encodings matter to the analyses here.
    pub encoded_value: Option<i64>,
}

#[derive(Debug)]
pub struct MethodDef {
    pub id: MethodId,
    pub is_static: bool,
    pub code: Option<IrCode>,
}

#[derive(Debug)]
pub struct DexClass {
    pub class_type: TypeId,
    pub sfields: Vec<FieldDef>,
    pub ifields: Vec<FieldDef>,
    /// Direct methods: constructors, private and static methods.
    pub dmethods: Vec<MethodDef>,
    /// Virtual methods.
    pub vmethods: Vec<MethodDef>,
}

impl DexClass {
    pub fn new(class_type: TypeId) -> Self {
        Self {
            class_type,
            sfields: Vec::new(),
            ifields: Vec::new(),
            dmethods: Vec::new(),
            vmethods: Vec::new(),
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.dmethods.iter().chain(self.vmethods.iter())
    }

    pub fn methods_mut(&mut self) -> impl Iterator<Item = &mut MethodDef> {
        self.dmethods.iter_mut().chain(self.vmethods.iter_mut())
    }

    /// The class initializer, if the class has one.
    pub fn clinit(&self) -> Option<&MethodDef> {
        self.dmethods.iter().find(|m| is_clinit(m.id))
    }
}

pub fn is_clinit(method: MethodId) -> bool {
    &*refs::string(refs::method(method).name) == "<clinit>"
}

pub fn is_init(method: MethodId) -> bool {
    &*refs::string(refs::method(method).name) == "<init>"
}

/// The set of classes a pass operates over.
#[derive(Debug, Default)]
pub struct Scope {
    pub classes: Vec<DexClass>,
}

impl Scope {
    pub fn new(classes: Vec<DexClass>) -> Self {
        Self { classes }
    }

    pub fn class_of(&self, class_type: TypeId) -> Option<&DexClass> {
        self.classes.iter().find(|c| c.class_type == class_type)
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodDef> {
        self.classes.iter().flat_map(|c| c.methods()).find(|m| m.id == id)
    }

    pub fn method_mut(&mut self, id: MethodId) -> Option<&mut MethodDef> {
        self.classes
            .iter_mut()
            .flat_map(|c| c.methods_mut())
            .find(|m| m.id == id)
    }

    pub fn field_def(&self, id: FieldId) -> Option<&FieldDef> {
        self.classes
            .iter()
            .flat_map(|c| c.sfields.iter().chain(c.ifields.iter()))
            .find(|f| f.id == id)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.classes.iter().flat_map(|c| c.methods())
    }

    pub fn method_ids(&self) -> Vec<MethodId> {
        self.methods().map(|m| m.id).collect()
    }

    /// Resolves a virtual call target when it is unambiguous within this
    /// scope: exactly one definition with a matching name and prototype.
    /// Full class-hierarchy override resolution is the job of an external
    /// collaborator; a unique signature match is the conservative core of
    /// it.
    pub fn resolve_unique_virtual(&self, callee: MethodId) -> Option<MethodId> {
        let target = refs::method(callee);
        let mut found = None;
        for class in &self.classes {
            for m in &class.vmethods {
                let mref = refs::method(m.id);
                if mref.name == target.name && mref.proto == target.proto {
                    if found.is_some() {
                        return None;
                    }
                    found = Some(m.id);
                }
            }
        }
        found
    }

    /// A map from method id to its definition index, for passes that need
    /// random access without repeated scans.
    pub fn method_index(&self) -> HashMap<MethodId, (usize, bool, usize)> {
        let mut index = HashMap::new();
        for (ci, class) in self.classes.iter().enumerate() {
            for (mi, m) in class.dmethods.iter().enumerate() {
                index.insert(m.id, (ci, true, mi));
            }
            for (mi, m) in class.vmethods.iter().enumerate() {
                index.insert(m.id, (ci, false, mi));
            }
        }
        index
    }
}
