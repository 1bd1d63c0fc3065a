//! Interned identifier tables
//!
//! Strings, type descriptors, prototypes, field references and method
//! references are interned process-wide: equal descriptors always yield
//! the same id, so identity comparison of ids is semantic equality. The
//! tables are append-only behind a mutex and safe for concurrent readers
//! once a pass starts; no entry is ever removed or mutated.

use hashbrown::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

macro_rules! ref_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

ref_id!(StringId);
ref_id!(TypeId);
ref_id!(ProtoId);
ref_id!(FieldId);
ref_id!(MethodId);

/// Properties of a type, precomputed from its descriptor at intern time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    /// J (long) and D (double) occupy a register pair.
    pub is_wide: bool,
    /// Class types (`Lpkg/Name;`) and arrays (`[...`).
    pub is_object: bool,
    /// V, for return types only.
    pub is_void: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proto {
    pub return_type: TypeId,
    pub args: Vec<TypeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub class: TypeId,
    pub name: StringId,
    pub field_type: TypeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub class: TypeId,
    pub name: StringId,
    pub proto: ProtoId,
}

struct Interner<T: Clone + Eq + std::hash::Hash> {
    values: Vec<T>,
    ids: HashMap<T, u32>,
}

impl<T: Clone + Eq + std::hash::Hash> Interner<T> {
    fn new() -> Self {
        Self { values: Vec::new(), ids: HashMap::new() }
    }

    fn intern(&mut self, value: T) -> u32 {
        if let Some(&id) = self.ids.get(&value) {
            return id;
        }
        let id = self.values.len() as u32;
        self.values.push(value.clone());
        self.ids.insert(value, id);
        id
    }

    fn get(&self, id: u32) -> &T {
        &self.values[id as usize]
    }
}

struct Tables {
    strings: Mutex<Interner<Arc<str>>>,
    types: Mutex<(Interner<Arc<str>>, Vec<TypeInfo>)>,
    protos: Mutex<Interner<Proto>>,
    fields: Mutex<Interner<FieldRef>>,
    methods: Mutex<Interner<MethodRef>>,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| Tables {
        strings: Mutex::new(Interner::new()),
        types: Mutex::new((Interner::new(), Vec::new())),
        protos: Mutex::new(Interner::new()),
        fields: Mutex::new(Interner::new()),
        methods: Mutex::new(Interner::new()),
    })
}

pub fn make_string(s: &str) -> StringId {
    StringId(tables().strings.lock().unwrap().intern(Arc::from(s)))
}

pub fn string(id: StringId) -> Arc<str> {
    tables().strings.lock().unwrap().get(id.0).clone()
}

/// Interns a type by its JVM descriptor (`I`, `J`, `Ljava/lang/Object;`,
/// `[I`, ...).
pub fn make_type(descriptor: &str) -> TypeId {
    let mut guard = tables().types.lock().unwrap();
    let (interner, infos) = &mut *guard;
    let before = interner.values.len();
    let id = interner.intern(Arc::from(descriptor));
    if interner.values.len() > before {
        let first = descriptor.as_bytes().first().copied().unwrap_or(b'V');
        infos.push(TypeInfo {
            is_wide: first == b'J' || first == b'D',
            is_object: first == b'L' || first == b'[',
            is_void: first == b'V',
        });
    }
    TypeId(id)
}

pub fn type_descriptor(id: TypeId) -> Arc<str> {
    tables().types.lock().unwrap().0.get(id.0).clone()
}

pub fn type_info(id: TypeId) -> TypeInfo {
    tables().types.lock().unwrap().1[id.0 as usize]
}

pub fn make_proto(return_type: TypeId, args: Vec<TypeId>) -> ProtoId {
    ProtoId(tables().protos.lock().unwrap().intern(Proto { return_type, args }))
}

pub fn proto(id: ProtoId) -> Proto {
    tables().protos.lock().unwrap().get(id.0).clone()
}

pub fn make_field(class: TypeId, name: StringId, field_type: TypeId) -> FieldId {
    FieldId(tables().fields.lock().unwrap().intern(FieldRef { class, name, field_type }))
}

pub fn field(id: FieldId) -> FieldRef {
    *tables().fields.lock().unwrap().get(id.0)
}

pub fn make_method(class: TypeId, name: StringId, proto: ProtoId) -> MethodId {
    MethodId(tables().methods.lock().unwrap().intern(MethodRef { class, name, proto }))
}

pub fn method(id: MethodId) -> MethodRef {
    *tables().methods.lock().unwrap().get(id.0)
}

/// Convenience constructor taking a full dotted form:
/// `Lcls;.name:(args)ret`, with argument descriptors concatenated.
pub fn make_method_desc(desc: &str) -> MethodId {
    let (class_part, rest) = desc.split_once(";.").expect("malformed method descriptor");
    let class = make_type(&format!("{};", class_part));
    let (name_part, proto_part) = rest.split_once(':').expect("malformed method descriptor");
    let name = make_string(name_part);
    let args_and_ret = proto_part
        .strip_prefix('(')
        .expect("malformed method descriptor");
    let (args_part, ret_part) = args_and_ret.split_once(')').expect("malformed method descriptor");
    let args = parse_type_list(args_part);
    let proto = make_proto(make_type(ret_part), args);
    make_method(class, name, proto)
}

/// Convenience constructor: `Lcls;.name:type`.
pub fn make_field_desc(desc: &str) -> FieldId {
    let (class_part, rest) = desc.split_once(";.").expect("malformed field descriptor");
    let class = make_type(&format!("{};", class_part));
    let (name_part, type_part) = rest.split_once(':').expect("malformed field descriptor");
    make_field(class, make_string(name_part), make_type(type_part))
}

fn parse_type_list(mut s: &str) -> Vec<TypeId> {
    let mut result = Vec::new();
    while !s.is_empty() {
        let len = type_descriptor_len(s);
        result.push(make_type(&s[..len]));
        s = &s[len..];
    }
    result
}

fn type_descriptor_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    match bytes[0] {
        b'[' => 1 + type_descriptor_len(&s[1..]),
        b'L' => s.find(';').expect("unterminated class descriptor") + 1,
        _ => 1,
    }
}

/// Human-readable rendering for diagnostics.
pub fn show_method(id: MethodId) -> String {
    let m = method(id);
    let p = proto(m.proto);
    let args: Vec<String> = p.args.iter().map(|t| type_descriptor(*t).to_string()).collect();
    format!(
        "{}.{}:({}){}",
        type_descriptor(m.class),
        string(m.name),
        args.join(""),
        type_descriptor(p.return_type)
    )
}

pub fn show_field(id: FieldId) -> String {
    let f = field(id);
    format!(
        "{}.{}:{}",
        type_descriptor(f.class),
        string(f.name),
        type_descriptor(f.field_type)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_idempotent() {
        let a = make_string("hello");
        let b = make_string("hello");
        let c = make_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&*string(a), "hello");
    }

    #[test]
    fn test_type_info() {
        assert!(make_type("J") == make_type("J"));
        assert!(type_info(make_type("J")).is_wide);
        assert!(type_info(make_type("D")).is_wide);
        assert!(!type_info(make_type("I")).is_wide);
        assert!(type_info(make_type("Ljava/lang/String;")).is_object);
        assert!(type_info(make_type("[I")).is_object);
        assert!(type_info(make_type("V")).is_void);
    }

    #[test]
    fn test_method_descriptor_parsing() {
        let m = make_method_desc("Ljava/lang/NullPointerException;.<init>:(Ljava/lang/String;)V");
        let mref = method(m);
        assert_eq!(&*type_descriptor(mref.class), "Ljava/lang/NullPointerException;");
        assert_eq!(&*string(mref.name), "<init>");
        let p = proto(mref.proto);
        assert_eq!(p.args.len(), 1);
        assert!(type_info(p.return_type).is_void);
        assert_eq!(
            show_method(m),
            "Ljava/lang/NullPointerException;.<init>:(Ljava/lang/String;)V"
        );
    }

    #[test]
    fn test_mixed_arg_descriptor_parsing() {
        let m = make_method_desc("LFoo;.bar:(I[JLjava/lang/Object;D)J");
        let p = proto(method(m).proto);
        let descs: Vec<String> =
            p.args.iter().map(|t| type_descriptor(*t).to_string()).collect();
        assert_eq!(descs, vec!["I", "[J", "Ljava/lang/Object;", "D"]);
        assert!(type_info(p.return_type).is_wide);
    }

    #[test]
    fn test_field_descriptor_parsing() {
        let f = make_field_desc("LFoo;.count:I");
        let fref = field(f);
        assert_eq!(&*string(fref.name), "count");
        assert_eq!(show_field(f), "LFoo;.count:I");
    }
}
