//! Per-class constant pools. Entry 0 holds the pool length; a parallel tag
//! byte per entry records its kind, and the tag's high bit marks an entry
//! as resolved, at which point the entry body holds the direct id instead
//! of a symbolic reference. Resolution is idempotent and monotonic: once
//! cached, an entry is never re-resolved or un-cached.

use crate::class::{AccessFlags, ClassId, ElementKind, FieldId, MethodId, PrimType};
use crate::errors::{Throw, VmResult};
use crate::loader;
use crate::symbols::SymbolId;
use crate::value::Value;
use crate::vm::{ThrowableKind, Vm};

pub const TAG_UTF8: u8 = 1;
pub const TAG_INTEGER: u8 = 3;
pub const TAG_CLASS: u8 = 7;
pub const TAG_STRING: u8 = 8;
pub const TAG_FIELDREF: u8 = 9;
pub const TAG_METHODREF: u8 = 10;
pub const TAG_INTERFACEMETHODREF: u8 = 11;
pub const TAG_NAMEANDTYPE: u8 = 12;

/// High tag bit: entry already resolved.
pub const CACHE_BIT: u8 = 0x80;

#[derive(Debug, Clone)]
pub enum PoolEntry {
    /// Entry 0 only.
    Length(u16),
    Unused,
    Utf8(SymbolId),
    Integer(i64),
    /// Symbolic class reference, fully qualified name.
    Class(SymbolId),
    /// Resolved class reference.
    ClassRef(ClassId),
    Str(SymbolId),
    /// Resolved string literal, a heap reference the collector rewrites.
    StrRef(Value),
    /// Symbolic member reference: pool indices of class and name-and-type.
    Member { class: u16, name_and_type: u16 },
    MethodRef(MethodId),
    FieldRef(FieldId),
    NameAndType { name: SymbolId, sig: SymbolId },
}

#[derive(Debug)]
pub struct ConstantPool {
    entries: Vec<PoolEntry>,
    tags: Vec<u8>,
}

impl ConstantPool {
    pub fn empty() -> Self {
        Self::with_len(1)
    }

    pub fn with_len(len: u16) -> Self {
        let len = len.max(1);
        let mut entries = vec![PoolEntry::Unused; len as usize];
        entries[0] = PoolEntry::Length(len);
        let mut tags = vec![0u8; len as usize];
        tags[0] = 0;
        Self { entries, tags }
    }

    pub fn len(&self) -> u16 {
        match self.entries[0] {
            PoolEntry::Length(n) => n,
            _ => panic!("constant pool entry 0 does not hold the length"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn entry(&self, index: u16) -> &PoolEntry {
        &self.entries[index as usize]
    }

    pub fn tag(&self, index: u16) -> u8 {
        self.tags[index as usize]
    }

    pub fn kind(&self, index: u16) -> u8 {
        self.tags[index as usize] & !CACHE_BIT
    }

    pub fn is_cached(&self, index: u16) -> bool {
        self.tags[index as usize] & CACHE_BIT != 0
    }

    /// Install an unresolved entry (loader use).
    pub fn set(&mut self, index: u16, tag: u8, entry: PoolEntry) {
        debug_assert!(index != 0 && index < self.len());
        self.tags[index as usize] = tag;
        self.entries[index as usize] = entry;
    }

    /// Overwrite an entry with its resolved form. Monotonic: caching an
    /// already-cached entry indicates engine corruption.
    fn cache(&mut self, index: u16, entry: PoolEntry) {
        assert!(
            !self.is_cached(index),
            "constant pool entry {index} resolved twice"
        );
        self.entries[index as usize] = entry;
        self.tags[index as usize] |= CACHE_BIT;
    }

    /// Visit every resolved string literal; the collector marks and
    /// rewrites them through this.
    pub fn for_each_string_ref(&mut self, mut f: impl FnMut(&mut Value)) {
        for e in &mut self.entries {
            if let PoolEntry::StrRef(v) = e {
                f(v);
            }
        }
    }
}

/// What a member resolution site expects to find.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemberExpect {
    Field { is_static: bool },
    Method { is_static: bool },
    InterfaceMethod,
}

pub fn resolve_class(vm: &mut Vm, from: ClassId, index: u16) -> VmResult<ClassId> {
    if vm.classes.get(from).plain().pool.is_cached(index) {
        match vm.classes.get(from).plain().pool.entry(index) {
            PoolEntry::ClassRef(id) => return Ok(*id),
            other => panic!("cached class entry {index} holds {other:?}"),
        }
    }
    let sym = match vm.classes.get(from).plain().pool.entry(index) {
        PoolEntry::Class(sym) => *sym,
        other => panic!("class entry {index} holds {other:?}"),
    };
    let target = class_by_name(vm, sym)?;

    // The referencing class must be allowed to see the target at all.
    let access = vm.classes.get(target).access;
    if !access.contains(AccessFlags::PUBLIC) && !same_package(vm, from, target) {
        return Err(illegal_access(vm, from, target, sym));
    }
    vm.classes
        .get_mut(from)
        .plain_mut()
        .pool
        .cache(index, PoolEntry::ClassRef(target));
    Ok(target)
}

pub fn resolve_field(
    vm: &mut Vm,
    from: ClassId,
    index: u16,
    is_static: bool,
) -> VmResult<FieldId> {
    match resolve_member(vm, from, index, MemberExpect::Field { is_static })? {
        ResolvedMember::Field(f) => Ok(f),
        ResolvedMember::Method(_) => unreachable!(),
    }
}

pub fn resolve_method(
    vm: &mut Vm,
    from: ClassId,
    index: u16,
    expect: MemberExpect,
) -> VmResult<MethodId> {
    match resolve_member(vm, from, index, expect)? {
        ResolvedMember::Method(m) => Ok(m),
        ResolvedMember::Field(_) => unreachable!(),
    }
}

/// Resolve a string literal, allocating and interning it on first use.
pub fn resolve_string(vm: &mut Vm, from: ClassId, index: u16) -> VmResult<Value> {
    if vm.classes.get(from).plain().pool.is_cached(index) {
        match vm.classes.get(from).plain().pool.entry(index) {
            PoolEntry::StrRef(v) => return Ok(*v),
            other => panic!("cached string entry {index} holds {other:?}"),
        }
    }
    let sym = match vm.classes.get(from).plain().pool.entry(index) {
        PoolEntry::Str(sym) => *sym,
        other => panic!("string entry {index} holds {other:?}"),
    };
    let text = vm.symbols.resolve(sym).to_owned();
    let s = vm.intern_string(&text)?;
    vm.classes
        .get_mut(from)
        .plain_mut()
        .pool
        .cache(index, PoolEntry::StrRef(s));
    Ok(s)
}

pub fn resolve_integer(vm: &Vm, from: ClassId, index: u16) -> i64 {
    match vm.classes.get(from).plain().pool.entry(index) {
        PoolEntry::Integer(v) => *v,
        other => panic!("integer entry {index} holds {other:?}"),
    }
}

enum ResolvedMember {
    Field(FieldId),
    Method(MethodId),
}

fn resolve_member(
    vm: &mut Vm,
    from: ClassId,
    index: u16,
    expect: MemberExpect,
) -> VmResult<ResolvedMember> {
    let pool = &vm.classes.get(from).plain().pool;
    if pool.is_cached(index) {
        return Ok(match pool.entry(index) {
            PoolEntry::FieldRef(f) => ResolvedMember::Field(*f),
            PoolEntry::MethodRef(m) => ResolvedMember::Method(*m),
            other => panic!("cached member entry {index} holds {other:?}"),
        });
    }
    let (class_idx, nat_idx) = match pool.entry(index) {
        PoolEntry::Member { class, name_and_type } => (*class, *name_and_type),
        other => panic!("member entry {index} holds {other:?}"),
    };
    let (name, sig) = match vm.classes.get(from).plain().pool.entry(nat_idx) {
        PoolEntry::NameAndType { name, sig } => (*name, *sig),
        other => panic!("name-and-type entry {nat_idx} holds {other:?}"),
    };
    let target = resolve_class(vm, from, class_idx)?;

    let resolved = match expect {
        MemberExpect::Field { is_static } => {
            let Some(fid) = vm.classes.find_field(target, name, sig) else {
                // A method under the same key means the reference went
                // stale against a binary-incompatible change.
                return Err(if vm.classes.find_method(target, name, sig).is_some() {
                    member_error(vm, ThrowableKind::IncompatibleClassChange, name, sig)
                } else {
                    member_error(vm, ThrowableKind::NoSuchField, name, sig)
                });
            };
            let access = vm.classes.field(fid).access;
            if access.contains(AccessFlags::STATIC) != is_static {
                return Err(member_error(
                    vm,
                    ThrowableKind::IncompatibleClassChange,
                    name,
                    sig,
                ));
            }
            check_member_access(vm, from, fid.class, access, name, sig)?;
            ResolvedMember::Field(fid)
        }
        MemberExpect::Method { is_static } => {
            let Some(mid) = vm.classes.find_method(target, name, sig) else {
                return Err(if vm.classes.find_field(target, name, sig).is_some() {
                    member_error(vm, ThrowableKind::IncompatibleClassChange, name, sig)
                } else {
                    member_error(vm, ThrowableKind::NoSuchMethod, name, sig)
                });
            };
            let access = vm.classes.method(mid).access;
            if access.contains(AccessFlags::STATIC) != is_static {
                return Err(member_error(
                    vm,
                    ThrowableKind::IncompatibleClassChange,
                    name,
                    sig,
                ));
            }
            check_member_access(vm, from, mid.class, access, name, sig)?;
            ResolvedMember::Method(mid)
        }
        MemberExpect::InterfaceMethod => {
            let Some(mid) = vm.classes.find_interface_method(target, name, sig) else {
                return Err(member_error(vm, ThrowableKind::NoSuchMethod, name, sig));
            };
            let access = vm.classes.method(mid).access;
            check_member_access(vm, from, mid.class, access, name, sig)?;
            ResolvedMember::Method(mid)
        }
    };

    let entry = match &resolved {
        ResolvedMember::Field(f) => PoolEntry::FieldRef(*f),
        ResolvedMember::Method(m) => PoolEntry::MethodRef(*m),
    };
    vm.classes.get_mut(from).plain_mut().pool.cache(index, entry);
    Ok(resolved)
}

/// Visibility rules: public members are open; private members only to the
/// declaring class; protected to the same package or subclasses; default
/// to the same package.
fn check_member_access(
    vm: &mut Vm,
    from: ClassId,
    declaring: ClassId,
    access: AccessFlags,
    name: SymbolId,
    sig: SymbolId,
) -> VmResult<()> {
    let allowed = if access.contains(AccessFlags::PUBLIC) {
        true
    } else if access.contains(AccessFlags::PRIVATE) {
        from == declaring
    } else if access.contains(AccessFlags::PROTECTED) {
        same_package(vm, from, declaring) || vm.classes.is_assignable(from, declaring)
    } else {
        same_package(vm, from, declaring)
    };
    if allowed {
        Ok(())
    } else {
        Err(member_error(vm, ThrowableKind::IllegalAccess, name, sig))
    }
}

fn same_package(vm: &Vm, a: ClassId, b: ClassId) -> bool {
    vm.classes.get(a).package == vm.classes.get(b).package
}

/// Find or load a class by fully qualified name; `[`-prefixed names are
/// array descriptors and synthesize array classes.
pub fn class_by_name(vm: &mut Vm, sym: SymbolId) -> VmResult<ClassId> {
    let name = vm.symbols.resolve(sym).to_owned();
    if name.starts_with('[') {
        return class_for_array_descriptor(vm, &name);
    }
    let (package, base) = split_name(&name);
    let package = vm.symbols.intern(package);
    let base = vm.symbols.intern(base);
    loader::ensure_linked(vm, package, base)
}

fn class_for_array_descriptor(vm: &mut Vm, descriptor: &str) -> VmResult<ClassId> {
    let depth = descriptor.bytes().take_while(|b| *b == b'[').count();
    let rest = &descriptor[depth..];
    let base = match rest.as_bytes().first() {
        Some(b'L') if rest.ends_with(';') => {
            let name = &rest[1..rest.len() - 1];
            let (package, base) = split_name(name);
            let package = vm.symbols.intern(package);
            let base = vm.symbols.intern(base);
            ElementKind::Class(loader::ensure_linked(vm, package, base)?)
        }
        Some(b'Z') => ElementKind::Prim(PrimType::Boolean),
        Some(b'B') => ElementKind::Prim(PrimType::Byte),
        Some(b'C') => ElementKind::Prim(PrimType::Char),
        Some(b'S') => ElementKind::Prim(PrimType::Short),
        Some(b'I') => ElementKind::Prim(PrimType::Int),
        Some(b'J') => ElementKind::Prim(PrimType::Long),
        _ => {
            let msg = format!("bad array descriptor {descriptor}");
            return Err(vm.throw(ThrowableKind::NoClassDefFound, &msg));
        }
    };
    let mut id = vm.classes.array_class_of(base, &mut vm.symbols);
    for _ in 1..depth {
        id = vm.classes.array_class_of(ElementKind::Class(id), &mut vm.symbols);
    }
    Ok(id)
}

pub fn split_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('/') {
        Some((package, base)) => (package, base),
        None => ("", name),
    }
}

fn member_error(vm: &mut Vm, kind: ThrowableKind, name: SymbolId, sig: SymbolId) -> Throw {
    let msg = format!(
        "{}{}",
        vm.symbols.resolve(name),
        vm.symbols.resolve(sig)
    );
    vm.throw(kind, &msg)
}

fn illegal_access(vm: &mut Vm, from: ClassId, _target: ClassId, sym: SymbolId) -> Throw {
    let msg = format!(
        "{} not visible from {}",
        vm.symbols.resolve(sym),
        vm.symbols.resolve(vm.classes.get(from).base)
    );
    vm.throw(ThrowableKind::IllegalAccess, &msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::ByteStream;
    use crate::class::{AccessFlags, ClassKind};
    use crate::heap::HeapCreateInfo;
    use crate::loader::{ImageBuilder, load_class};
    use crate::vm::VmCreateInfo;

    fn test_vm() -> Vm {
        Vm::new(VmCreateInfo {
            heap: HeapCreateInfo { cells: 8 * 1024 },
            ..Default::default()
        })
    }

    fn load(vm: &mut Vm, image: &[u8]) -> ClassId {
        load_class(vm, &mut ByteStream::new(&image)).expect("image loads")
    }

    /// `t/B` with a public method, a private method, a package-private
    /// method and one static + one instance field.
    fn b_image() -> Vec<u8> {
        let mut b = ImageBuilder::new();
        let this = b.class("t/B");
        let object = b.class("java/lang/Object");
        b.this_class(this, AccessFlags::PUBLIC)
            .super_class(object)
            .field(AccessFlags::PUBLIC, "count", "I")
            .field(AccessFlags::PUBLIC | AccessFlags::STATIC, "shared", "I")
            .method(
                AccessFlags::PUBLIC,
                "greet",
                "()I",
                1,
                1,
                &[crate::bytecode::op::ICONST_1, crate::bytecode::op::IRETURN],
                &[],
            )
            .method(
                AccessFlags::PRIVATE,
                "secret",
                "()V",
                0,
                1,
                &[crate::bytecode::op::RETURN],
                &[],
            )
            .method(
                AccessFlags::empty(),
                "neighborly",
                "()V",
                0,
                1,
                &[crate::bytecode::op::RETURN],
                &[],
            );
        b.build()
    }

    /// `t/A extends t/B`, with pool references into B. Returns the image
    /// plus the interesting pool indices.
    struct AImage {
        image: Vec<u8>,
        greet: u16,
        secret: u16,
        field_as_method: u16,
        instance_as_static: u16,
    }

    fn a_image() -> AImage {
        let mut b = ImageBuilder::new();
        let this = b.class("t/A");
        let base = b.class("t/B");
        let greet = b.method_ref(base, "greet", "()I");
        let secret = b.method_ref(base, "secret", "()V");
        // A method reference whose name+signature actually names a field.
        let field_as_method = b.method_ref(base, "count", "I");
        let instance_as_static = b.field_ref(base, "count", "I");
        b.this_class(this, AccessFlags::PUBLIC).super_class(base);
        AImage {
            image: b.build(),
            greet,
            secret,
            field_as_method,
            instance_as_static,
        }
    }

    #[test]
    fn method_resolution_is_idempotent_and_caches_once() {
        let mut vm = test_vm();
        load(&mut vm, &b_image());
        let a = a_image();
        let a_id = load(&mut vm, &a.image);

        assert!(!vm.classes.get(a_id).plain().pool.is_cached(a.greet));
        let first = resolve_method(
            &mut vm,
            a_id,
            a.greet,
            MemberExpect::Method { is_static: false },
        )
        .expect("resolves");
        assert!(
            vm.classes.get(a_id).plain().pool.is_cached(a.greet),
            "cache bit transitions unset -> set on first resolution"
        );
        let second = resolve_method(
            &mut vm,
            a_id,
            a.greet,
            MemberExpect::Method { is_static: false },
        )
        .expect("cached");
        assert_eq!(first, second, "second resolution returns the identical id");
        assert_eq!(
            vm.class_display_name(first.class),
            "t/B",
            "the method resolved on the superclass"
        );
    }

    #[test]
    fn private_members_are_invisible_to_subclasses() {
        let mut vm = test_vm();
        load(&mut vm, &b_image());
        let a = a_image();
        let a_id = load(&mut vm, &a.image);

        let err = resolve_method(
            &mut vm,
            a_id,
            a.secret,
            MemberExpect::Method { is_static: false },
        )
        .unwrap_err();
        assert_eq!(
            vm.class_of(err.0),
            vm.core.throwable_class(ThrowableKind::IllegalAccess)
        );
        assert!(
            !vm.classes.get(a_id).plain().pool.is_cached(a.secret),
            "failed resolutions never cache"
        );
    }

    #[test]
    fn member_kind_mismatch_is_an_incompatible_change() {
        let mut vm = test_vm();
        load(&mut vm, &b_image());
        let a = a_image();
        let a_id = load(&mut vm, &a.image);

        // Method reference that resolves to a field.
        let err = resolve_method(
            &mut vm,
            a_id,
            a.field_as_method,
            MemberExpect::Method { is_static: false },
        )
        .unwrap_err();
        assert_eq!(
            vm.class_of(err.0),
            vm.core
                .throwable_class(ThrowableKind::IncompatibleClassChange)
        );

        // getstatic on an instance field.
        let err = resolve_field(&mut vm, a_id, a.instance_as_static, true).unwrap_err();
        assert_eq!(
            vm.class_of(err.0),
            vm.core
                .throwable_class(ThrowableKind::IncompatibleClassChange)
        );
    }

    #[test]
    fn package_private_members_stop_at_the_package_boundary() {
        let mut vm = test_vm();
        load(&mut vm, &b_image());

        let mut b = ImageBuilder::new();
        let this = b.class("other/C");
        let object = b.class("java/lang/Object");
        let target = b.class("t/B");
        let neighborly = b.method_ref(target, "neighborly", "()V");
        b.this_class(this, AccessFlags::PUBLIC).super_class(object);
        let c_id = load(&mut vm, &b.build());

        let err = resolve_method(
            &mut vm,
            c_id,
            neighborly,
            MemberExpect::Method { is_static: false },
        )
        .unwrap_err();
        assert_eq!(
            vm.class_of(err.0),
            vm.core.throwable_class(ThrowableKind::IllegalAccess)
        );
    }

    #[test]
    fn missing_members_raise_the_matching_error() {
        let mut vm = test_vm();
        load(&mut vm, &b_image());

        let mut b = ImageBuilder::new();
        let this = b.class("t/D");
        let base = b.class("t/B");
        let ghost_m = b.method_ref(base, "ghost", "()V");
        let ghost_f = b.field_ref(base, "ghost", "I");
        b.this_class(this, AccessFlags::PUBLIC).super_class(base);
        let d_id = load(&mut vm, &b.build());

        let err = resolve_method(
            &mut vm,
            d_id,
            ghost_m,
            MemberExpect::Method { is_static: false },
        )
        .unwrap_err();
        assert_eq!(
            vm.class_of(err.0),
            vm.core.throwable_class(ThrowableKind::NoSuchMethod)
        );
        let err = resolve_field(&mut vm, d_id, ghost_f, false).unwrap_err();
        assert_eq!(
            vm.class_of(err.0),
            vm.core.throwable_class(ThrowableKind::NoSuchField)
        );
    }

    #[test]
    fn unresolvable_class_raises_no_class_def_found() {
        let mut vm = test_vm();
        let mut b = ImageBuilder::new();
        let this = b.class("t/E");
        let object = b.class("java/lang/Object");
        let phantom = b.class("t/Phantom");
        b.this_class(this, AccessFlags::PUBLIC).super_class(object);
        let e_id = load(&mut vm, &b.build());

        let err = resolve_class(&mut vm, e_id, phantom).unwrap_err();
        assert_eq!(
            vm.class_of(err.0),
            vm.core.throwable_class(ThrowableKind::NoClassDefFound)
        );
    }

    #[test]
    fn string_literals_resolve_to_one_interned_object() {
        let mut vm = test_vm();
        let mut b = ImageBuilder::new();
        let this = b.class("t/S");
        let object = b.class("java/lang/Object");
        let lit = b.string("shared literal");
        b.this_class(this, AccessFlags::PUBLIC).super_class(object);
        let s_id = load(&mut vm, &b.build());

        let first = resolve_string(&mut vm, s_id, lit).expect("resolves");
        assert!(vm.classes.get(s_id).plain().pool.is_cached(lit));
        let second = resolve_string(&mut vm, s_id, lit).expect("cached");
        assert_eq!(first, second);
        assert_eq!(vm.read_string(first), "shared literal");
        let interned = vm.intern_string("shared literal").unwrap();
        assert_eq!(first, interned, "pool strings go through the intern table");
    }

    #[test]
    fn array_descriptor_entries_synthesize_array_classes() {
        let mut vm = test_vm();
        let mut b = ImageBuilder::new();
        let this = b.class("t/Arr");
        let object = b.class("java/lang/Object");
        let int_arr = b.class("[I");
        let obj_arr_arr = b.class("[[Ljava/lang/Object;");
        b.this_class(this, AccessFlags::PUBLIC).super_class(object);
        let id = load(&mut vm, &b.build());

        let c1 = resolve_class(&mut vm, id, int_arr).expect("[I resolves");
        assert!(vm.classes.get(c1).is_array());

        let c2 = resolve_class(&mut vm, id, obj_arr_arr).expect("[[L resolves");
        match &vm.classes.get(c2).kind {
            ClassKind::Array(a) => {
                assert_eq!(a.depth, 2);
                assert_eq!(a.base, ElementKind::Class(vm.core.object));
            }
            _ => panic!("expected array class"),
        }
    }
}
