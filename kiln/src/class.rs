//! The resolved runtime class model: plain and array classes, method and
//! field tables, the load/link/verify status machine, and the class table
//! with lazy array-class synthesis.
//!
//! Classes are created raw on first name lookup and are never individually
//! freed; a failed load rolls the class back to raw instead.

use std::sync::Arc;

use bitflags::bitflags;

use crate::pool::ConstantPool;
use crate::symbols::{SymbolId, Symbols};
use crate::threads::ThreadId;
use crate::value::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub class: ClassId,
    pub index: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FieldId {
    pub class: ClassId,
    pub index: u16,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct AccessFlags: u16 {
        const PUBLIC       = 0x0001;
        const PRIVATE      = 0x0002;
        const PROTECTED    = 0x0004;
        const STATIC       = 0x0008;
        const FINAL        = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const NATIVE       = 0x0100;
        const INTERFACE    = 0x0200;
        const ABSTRACT     = 0x0400;
    }
}

/// Load/link/verify state machine. Only ever advances, except for the
/// explicit rollback in [`ClassTable::revert_to_raw`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClassStatus {
    Raw,
    Loading,
    Loaded,
    Linked,
    Verified,
    Ready,
    Error,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PrimType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
}

impl PrimType {
    pub fn descriptor(self) -> char {
        match self {
            PrimType::Boolean => 'Z',
            PrimType::Byte => 'B',
            PrimType::Char => 'C',
            PrimType::Short => 'S',
            PrimType::Int => 'I',
            PrimType::Long => 'J',
        }
    }

    /// Logical element width in bytes.
    pub fn element_size(self) -> u8 {
        match self {
            PrimType::Boolean | PrimType::Byte => 1,
            PrimType::Char | PrimType::Short => 2,
            PrimType::Int => 4,
            PrimType::Long => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Class(ClassId),
    Prim(PrimType),
}

/// One entry of a method's exception handler table. `class_index` is a
/// constant pool index, 0 meaning the wildcard "any" entry.
#[derive(Debug, Copy, Clone)]
pub struct Handler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub class_index: u16,
    pub target: u16,
}

#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub bytes: Arc<[u8]>,
    pub handlers: Arc<[Handler]>,
    /// Opaque verifier input, carried but never interpreted here.
    pub stack_map: Box<[u8]>,
}

#[derive(Debug, Clone)]
pub enum MethodBody {
    Code(CodeBlock),
    Native,
    Abstract,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: SymbolId,
    pub sig: SymbolId,
    pub access: AccessFlags,
    /// Argument cells popped at a call site, receiver included for
    /// instance methods. Precomputed at link time.
    pub arg_cells: u8,
    pub returns_value: bool,
    pub max_locals: u16,
    pub max_stack: u16,
    pub body: MethodBody,
}

impl Method {
    pub fn frame_cells(&self) -> usize {
        self.max_locals as usize + self.max_stack as usize
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn is_synchronized(&self) -> bool {
        self.access.contains(AccessFlags::SYNCHRONIZED)
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: SymbolId,
    pub sig: SymbolId,
    pub access: AccessFlags,
    /// Instance field cell (inherited fields included) or statics index.
    pub offset: u16,
}

impl Field {
    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

#[derive(Debug)]
pub struct PlainClass {
    pub super_class: Option<ClassId>,
    pub pool: ConstantPool,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub interfaces: Vec<ClassId>,
    pub statics: Vec<Value>,
    /// Instance field cells including every superclass.
    pub instance_field_cells: u16,
    /// Set while `<clinit>` runs, enabling reentrant self-use.
    pub initializing: Option<ThreadId>,
}

impl PlainClass {
    fn empty() -> Self {
        Self {
            super_class: None,
            pool: ConstantPool::empty(),
            fields: Vec::new(),
            methods: Vec::new(),
            interfaces: Vec::new(),
            statics: Vec::new(),
            instance_field_cells: 0,
            initializing: None,
        }
    }
}

#[derive(Debug)]
pub struct ArrayClass {
    /// Direct element of this array type.
    pub element: ElementKind,
    /// Ultimate non-array element, cache key together with `depth`.
    pub base: ElementKind,
    pub depth: u8,
    pub element_size: u8,
}

#[derive(Debug)]
pub enum ClassKind {
    Plain(PlainClass),
    Array(ArrayClass),
}

#[derive(Debug)]
pub struct Class {
    pub package: SymbolId,
    pub base: SymbolId,
    pub access: AccessFlags,
    pub status: ClassStatus,
    /// Short key for fast type-identity checks; array keys pack depth and
    /// base element key.
    pub key: u16,
    pub kind: ClassKind,
}

impl Class {
    pub fn plain(&self) -> &PlainClass {
        match &self.kind {
            ClassKind::Plain(p) => p,
            ClassKind::Array(_) => panic!("array class where plain class expected"),
        }
    }

    pub fn plain_mut(&mut self) -> &mut PlainClass {
        match &mut self.kind {
            ClassKind::Plain(p) => p,
            ClassKind::Array(_) => panic!("array class where plain class expected"),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::Array(_))
    }

    pub fn is_interface(&self) -> bool {
        self.access.contains(AccessFlags::INTERFACE)
    }
}

const ARRAY_KEY_FLAG: u16 = 0x8000;
const ARRAY_KEY_DEPTH_SHIFT: u16 = 12;
const ARRAY_KEY_BASE_MASK: u16 = 0x0FFF;

#[derive(Debug, Default)]
pub struct ClassTable {
    classes: Vec<Class>,
    by_name: ahash::AHashMap<(SymbolId, SymbolId), ClassId>,
    arrays: ahash::AHashMap<(u8, ElementKind), ClassId>,
    next_key: u16,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ClassId) -> &Class {
        &self.classes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ClassId> + use<> {
        (0..self.classes.len() as u32).map(ClassId)
    }

    pub fn find(&self, package: SymbolId, base: SymbolId) -> Option<ClassId> {
        self.by_name.get(&(package, base)).copied()
    }

    /// Look a class up by name, creating a raw entry on first sight.
    pub fn lookup_or_create(&mut self, package: SymbolId, base: SymbolId) -> ClassId {
        if let Some(id) = self.find(package, base) {
            return id;
        }
        self.next_key += 1;
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(Class {
            package,
            base,
            access: AccessFlags::empty(),
            status: ClassStatus::Raw,
            key: self.next_key,
            kind: ClassKind::Plain(PlainClass::empty()),
        });
        self.by_name.insert((package, base), id);
        id
    }

    /// Advance the status machine. Moving backwards (other than through
    /// [`Self::revert_to_raw`]) is engine corruption.
    pub fn advance_status(&mut self, id: ClassId, to: ClassStatus) {
        let class = self.get_mut(id);
        assert!(
            to >= class.status,
            "class status may only advance: {:?} -> {to:?}",
            class.status
        );
        class.status = to;
    }

    /// Roll a half-loaded class back so a retry or alternate resolution
    /// can start over.
    pub fn revert_to_raw(&mut self, id: ClassId) {
        let class = self.get_mut(id);
        class.status = ClassStatus::Raw;
        class.access = AccessFlags::empty();
        class.kind = ClassKind::Plain(PlainClass::empty());
    }

    /// A class may be instantiated once ready, or while the asking thread
    /// itself is running the class's `<clinit>`.
    pub fn instantiable(&self, id: ClassId, by: ThreadId) -> bool {
        let class = self.get(id);
        match class.status {
            ClassStatus::Ready => true,
            ClassStatus::Verified => match &class.kind {
                ClassKind::Plain(p) => p.initializing == Some(by),
                ClassKind::Array(_) => false,
            },
            _ => false,
        }
    }

    /// Lazily synthesize the array class for `element`, cached by the
    /// (depth, base element) pair.
    pub fn array_class_of(&mut self, element: ElementKind, syms: &mut Symbols) -> ClassId {
        let (depth, base) = match element {
            ElementKind::Class(c) => match &self.get(c).kind {
                ClassKind::Array(a) => (a.depth + 1, a.base),
                ClassKind::Plain(_) => (1, element),
            },
            ElementKind::Prim(_) => (1, element),
        };
        if let Some(&id) = self.arrays.get(&(depth, base)) {
            return id;
        }

        let (package, descriptor, element_size, base_key) = match base {
            ElementKind::Prim(p) => (
                syms.intern(""),
                format!("{}{}", "[".repeat(depth as usize), p.descriptor()),
                p.element_size(),
                0,
            ),
            ElementKind::Class(c) => {
                let cls = self.get(c);
                let name = format!(
                    "{}[L{};",
                    "[".repeat(depth as usize),
                    syms.resolve(cls.base)
                );
                (cls.package, name, 8, cls.key)
            }
        };
        let base_sym = syms.intern(&descriptor);
        let key = ARRAY_KEY_FLAG
            | ((depth as u16) << ARRAY_KEY_DEPTH_SHIFT)
            | (base_key & ARRAY_KEY_BASE_MASK);

        let id = ClassId(self.classes.len() as u32);
        self.classes.push(Class {
            package,
            base: base_sym,
            access: AccessFlags::PUBLIC | AccessFlags::FINAL,
            status: ClassStatus::Ready,
            key,
            kind: ClassKind::Array(ArrayClass {
                element,
                base,
                depth,
                element_size,
            }),
        });
        self.by_name.insert((package, base_sym), id);
        self.arrays.insert((depth, base), id);
        id
    }

    /// Virtual lookup: walk the superclass chain for a name+signature match.
    pub fn find_method(&self, class: ClassId, name: SymbolId, sig: SymbolId) -> Option<MethodId> {
        let mut at = Some(class);
        while let Some(id) = at {
            let c = self.get(id);
            let plain = match &c.kind {
                ClassKind::Plain(p) => p,
                // Arrays dispatch through Object.
                ClassKind::Array(_) => {
                    at = self.object_class();
                    continue;
                }
            };
            for (i, m) in plain.methods.iter().enumerate() {
                if m.name == name && m.sig == sig {
                    return Some(MethodId {
                        class: id,
                        index: i as u16,
                    });
                }
            }
            at = plain.super_class;
        }
        None
    }

    /// Interface lookup: superclass chain first, then every declared
    /// interface transitively.
    pub fn find_interface_method(
        &self,
        class: ClassId,
        name: SymbolId,
        sig: SymbolId,
    ) -> Option<MethodId> {
        if let Some(m) = self.find_method(class, name, sig) {
            return Some(m);
        }
        let mut at = Some(class);
        while let Some(id) = at {
            let plain = match &self.get(id).kind {
                ClassKind::Plain(p) => p,
                ClassKind::Array(_) => return None,
            };
            for &iface in &plain.interfaces {
                if let Some(m) = self.find_interface_method(iface, name, sig) {
                    return Some(m);
                }
            }
            at = plain.super_class;
        }
        None
    }

    pub fn find_field(&self, class: ClassId, name: SymbolId, sig: SymbolId) -> Option<FieldId> {
        let mut at = Some(class);
        while let Some(id) = at {
            let plain = match &self.get(id).kind {
                ClassKind::Plain(p) => p,
                ClassKind::Array(_) => return None,
            };
            for (i, f) in plain.fields.iter().enumerate() {
                if f.name == name && f.sig == sig {
                    return Some(FieldId {
                        class: id,
                        index: i as u16,
                    });
                }
            }
            at = plain.super_class;
        }
        None
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.get(id.class).plain().methods[id.index as usize]
    }

    pub fn field(&self, id: FieldId) -> &Field {
        &self.get(id.class).plain().fields[id.index as usize]
    }

    /// `from` is assignable to `to` (widening reference conversion).
    pub fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        if from == to {
            return true;
        }
        let to_class = self.get(to);
        match (&self.get(from).kind, &to_class.kind) {
            (ClassKind::Array(a), ClassKind::Array(b)) => {
                if a.depth != b.depth {
                    return false;
                }
                match (a.base, b.base) {
                    (ElementKind::Prim(x), ElementKind::Prim(y)) => x == y,
                    (ElementKind::Class(x), ElementKind::Class(y)) => self.is_assignable(x, y),
                    _ => false,
                }
            }
            // Arrays are assignable to Object (and nothing else plain).
            (ClassKind::Array(_), ClassKind::Plain(_)) => Some(to) == self.object_class(),
            (ClassKind::Plain(_), ClassKind::Array(_)) => false,
            (ClassKind::Plain(_), ClassKind::Plain(_)) => {
                let mut at = Some(from);
                while let Some(id) = at {
                    if id == to {
                        return true;
                    }
                    let plain = self.get(id).plain();
                    if to_class.is_interface()
                        && plain.interfaces.iter().any(|&i| self.is_assignable(i, to))
                    {
                        return true;
                    }
                    at = plain.super_class;
                }
                false
            }
        }
    }

    /// The root of the hierarchy: the one plain class without a super.
    /// Class 0 by construction, the bootstrap creates it first.
    pub fn object_class(&self) -> Option<ClassId> {
        if self.classes.is_empty() {
            None
        } else {
            Some(ClassId(0))
        }
    }
}

/// Parse a method signature like `(II[Ljava/lang/String;)V` into the
/// number of argument cells (receiver excluded) and whether a value is
/// returned. Every type occupies one cell.
pub fn parse_signature(sig: &str) -> (u8, bool) {
    let bytes = sig.as_bytes();
    debug_assert_eq!(bytes.first(), Some(&b'('), "bad signature {sig}");
    let mut args = 0u8;
    let mut i = 1;
    while i < bytes.len() && bytes[i] != b')' {
        args += 1;
        while bytes[i] == b'[' {
            i += 1;
        }
        if bytes[i] == b'L' {
            while bytes[i] != b';' {
                i += 1;
            }
        }
        i += 1;
    }
    let returns_value = bytes.get(i + 1).is_some_and(|&b| b != b'V');
    (args, returns_value)
}

/// A field signature names a reference type if it is a class or array.
pub fn sig_is_reference(sig: &str) -> bool {
    matches!(sig.as_bytes().first(), Some(b'L') | Some(b'['))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_object(syms: &mut Symbols) -> (ClassTable, ClassId) {
        let mut table = ClassTable::new();
        let pkg = syms.intern("java/lang");
        let base = syms.intern("Object");
        let id = table.lookup_or_create(pkg, base);
        table.get_mut(id).status = ClassStatus::Ready;
        (table, id)
    }

    #[test]
    fn lookup_creates_raw_once() {
        let mut syms = Symbols::new();
        let mut table = ClassTable::new();
        let p = syms.intern("demo");
        let b = syms.intern("Thing");
        let a = table.lookup_or_create(p, b);
        let again = table.lookup_or_create(p, b);
        assert_eq!(a, again);
        assert_eq!(table.get(a).status, ClassStatus::Raw);
    }

    #[test]
    fn status_only_advances() {
        let mut syms = Symbols::new();
        let (mut table, obj) = table_with_object(&mut syms);
        let c = table.lookup_or_create(syms.intern("demo"), syms.intern("A"));
        table.advance_status(c, ClassStatus::Loading);
        table.advance_status(c, ClassStatus::Loaded);
        table.advance_status(c, ClassStatus::Linked);
        table.advance_status(c, ClassStatus::Verified);
        table.advance_status(c, ClassStatus::Ready);
        assert_eq!(table.get(c).status, ClassStatus::Ready);
        let _ = obj;
    }

    #[test]
    #[should_panic(expected = "status may only advance")]
    fn status_regression_is_fatal() {
        let mut syms = Symbols::new();
        let mut table = ClassTable::new();
        let c = table.lookup_or_create(syms.intern("demo"), syms.intern("A"));
        table.advance_status(c, ClassStatus::Linked);
        table.advance_status(c, ClassStatus::Loading);
    }

    #[test]
    fn revert_to_raw_is_the_one_allowed_rollback() {
        let mut syms = Symbols::new();
        let mut table = ClassTable::new();
        let c = table.lookup_or_create(syms.intern("demo"), syms.intern("A"));
        table.advance_status(c, ClassStatus::Loaded);
        table.revert_to_raw(c);
        assert_eq!(table.get(c).status, ClassStatus::Raw);
        // And the chain can be walked again.
        table.advance_status(c, ClassStatus::Loading);
    }

    #[test]
    fn array_classes_are_cached_by_depth_and_base() {
        let mut syms = Symbols::new();
        let (mut table, obj) = table_with_object(&mut syms);
        let int_arr = table.array_class_of(ElementKind::Prim(PrimType::Int), &mut syms);
        let int_arr2 = table.array_class_of(ElementKind::Prim(PrimType::Int), &mut syms);
        assert_eq!(int_arr, int_arr2, "same (depth, base) must share a class");

        let int_arr_arr = table.array_class_of(ElementKind::Class(int_arr), &mut syms);
        assert_ne!(int_arr, int_arr_arr);
        match &table.get(int_arr_arr).kind {
            ClassKind::Array(a) => {
                assert_eq!(a.depth, 2);
                assert_eq!(a.base, ElementKind::Prim(PrimType::Int));
            }
            _ => panic!("expected array class"),
        }

        let obj_arr = table.array_class_of(ElementKind::Class(obj), &mut syms);
        assert!(table.get(obj_arr).key & ARRAY_KEY_FLAG != 0);
        assert_eq!(syms.resolve(table.get(int_arr).base), "[I");
    }

    #[test]
    fn assignability_walks_supers_interfaces_and_arrays() {
        let mut syms = Symbols::new();
        let (mut table, obj) = table_with_object(&mut syms);
        let pkg = syms.intern("demo");
        let b = table.lookup_or_create(pkg, syms.intern("B"));
        table.get_mut(b).plain_mut().super_class = Some(obj);
        table.get_mut(b).status = ClassStatus::Ready;
        let a = table.lookup_or_create(pkg, syms.intern("A"));
        table.get_mut(a).plain_mut().super_class = Some(b);
        table.get_mut(a).status = ClassStatus::Ready;

        assert!(table.is_assignable(a, b));
        assert!(table.is_assignable(a, obj));
        assert!(!table.is_assignable(b, a));

        let a_arr = table.array_class_of(ElementKind::Class(a), &mut syms);
        let b_arr = table.array_class_of(ElementKind::Class(b), &mut syms);
        assert!(table.is_assignable(a_arr, b_arr), "arrays are covariant");
        assert!(!table.is_assignable(b_arr, a_arr));
        assert!(table.is_assignable(a_arr, obj), "arrays extend Object");

        let i_arr = table.array_class_of(ElementKind::Prim(PrimType::Int), &mut syms);
        let c_arr = table.array_class_of(ElementKind::Prim(PrimType::Char), &mut syms);
        assert!(!table.is_assignable(i_arr, c_arr));
    }

    #[test]
    fn method_lookup_walks_the_super_chain() {
        let mut syms = Symbols::new();
        let (mut table, obj) = table_with_object(&mut syms);
        let name = syms.intern("frob");
        let sig = syms.intern("()V");
        let pkg = syms.intern("demo");
        let b = table.lookup_or_create(pkg, syms.intern("B"));
        table.get_mut(b).plain_mut().super_class = Some(obj);
        table.get_mut(b).plain_mut().methods.push(Method {
            name,
            sig,
            access: AccessFlags::PUBLIC,
            arg_cells: 1,
            returns_value: false,
            max_locals: 1,
            max_stack: 0,
            body: MethodBody::Abstract,
        });
        let a = table.lookup_or_create(pkg, syms.intern("A"));
        table.get_mut(a).plain_mut().super_class = Some(b);

        let found = table.find_method(a, name, sig).expect("inherited method");
        assert_eq!(found.class, b);
        assert!(table.find_method(a, name, syms.intern("(I)V")).is_none());
    }

    #[test]
    fn signature_parsing_counts_cells() {
        assert_eq!(parse_signature("()V"), (0, false));
        assert_eq!(parse_signature("(I)I"), (1, true));
        assert_eq!(parse_signature("(IJ[B)V"), (3, false));
        assert_eq!(
            parse_signature("(Ljava/lang/String;[[ILjava/lang/Object;)J"),
            (3, true)
        );
        assert!(sig_is_reference("[I"));
        assert!(sig_is_reference("Ljava/lang/String;"));
        assert!(!sig_is_reference("I"));
    }
}
