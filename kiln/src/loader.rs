//! Class loading: reads a pre-validated class image through the
//! [`ClassFileStream`] boundary and drives the status machine
//! `Raw → Loading → Loaded → Linked → Verified`. Readying (`<clinit>`)
//! happens lazily from the interpreter on first active use. Any failure
//! rolls the class back to raw so a retry or alternate resolution can
//! start over.
//!
//! Image layout (all integers big-endian):
//!
//! ```text
//! u16 pool_count
//! pool entries 1..count: u8 tag + payload
//!   Utf8:    u16 len, bytes        Integer: u32 (two's complement)
//!   Class:   u16 utf8           String:  u16 utf8
//!   Field/Method/InterfaceMethodref: u16 class, u16 name_and_type
//!   NameAndType: u16 name_utf8, u16 sig_utf8
//! u16 access, u16 this_class, u16 super_class (0 for the root)
//! u16 iface_count, iface class-entry indices
//! u16 field_count:  { u16 access, u16 name_utf8, u16 sig_utf8 }
//! u16 method_count: { u16 access, u16 name_utf8, u16 sig_utf8,
//!                     u16 max_stack, u16 max_locals,
//!                     u32 code_len, code bytes,
//!                     u16 handler_count { u16 start, end, class, target },
//!                     u16 stack_map_len, bytes }
//! ```
//!
//! A `code_len` of 0 marks a native or abstract body.

use log::debug;

use crate::bindings::{ByteStream, ClassFileStream, PermissiveVerifier};
use crate::class::{
    AccessFlags, ClassId, ClassStatus, CodeBlock, Field, Handler, Method, MethodBody,
    parse_signature,
};
use crate::errors::{VmError, VmResult};
use crate::pool::{
    self, ConstantPool, PoolEntry, TAG_CLASS, TAG_FIELDREF, TAG_INTEGER,
    TAG_INTERFACEMETHODREF, TAG_METHODREF, TAG_NAMEANDTYPE, TAG_STRING, TAG_UTF8,
};
use crate::stack::CHUNK_CELLS;
use crate::symbols::SymbolId;
use crate::vm::{ThrowableKind, Vm, field_default};

/// Raw pool constants before cross-indexing.
enum RawConst {
    Absent,
    Utf8(SymbolId),
    Integer(i64),
    Class(u16),
    Str(u16),
    Member { tag: u8, class: u16, nat: u16 },
    NameAndType { name: u16, sig: u16 },
}

pub fn load_class(vm: &mut Vm, stream: &mut dyn ClassFileStream) -> Result<ClassId, VmError> {
    let raw = read_raw_pool(vm, stream)?;

    let access = AccessFlags::from_bits_truncate(stream.read_u16()?);
    let this_idx = stream.read_u16()?;
    let this_sym = class_sym(&raw, this_idx)?;
    let name = vm.symbols.resolve(this_sym).to_owned();
    let (package, base) = pool::split_name(&name);
    let package = vm.symbols.intern(package);
    let base = vm.symbols.intern(base);

    let id = vm.classes.lookup_or_create(package, base);
    if vm.classes.get(id).status > ClassStatus::Raw {
        return Err(VmError::DuplicateClass(name));
    }
    vm.classes.advance_status(id, ClassStatus::Loading);

    match load_rest(vm, stream, id, access, &raw) {
        Ok(()) => Ok(id),
        Err(e) => {
            // Structural failure: roll back so a retry can start over.
            vm.classes.revert_to_raw(id);
            Err(e)
        }
    }
}

fn load_rest(
    vm: &mut Vm,
    stream: &mut dyn ClassFileStream,
    id: ClassId,
    access: AccessFlags,
    raw: &[RawConst],
) -> Result<(), VmError> {
    // Superclass chain first; it must finish linking before this class.
    let super_idx = stream.read_u16()?;
    let super_class = if super_idx == 0 {
        None
    } else {
        Some(require_linked(vm, raw, super_idx)?)
    };

    let iface_count = stream.read_u16()?;
    let mut interfaces = Vec::with_capacity(iface_count as usize);
    for _ in 0..iface_count {
        let idx = stream.read_u16()?;
        interfaces.push(require_linked(vm, raw, idx)?);
    }

    // Fields: split into instance and static slots.
    let super_cells = super_class
        .map(|s| vm.classes.get(s).plain().instance_field_cells)
        .unwrap_or(0);
    let field_count = stream.read_u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    let mut statics = Vec::new();
    let mut instance_at = super_cells;
    for _ in 0..field_count {
        let f_access = AccessFlags::from_bits_truncate(stream.read_u16()?);
        let f_name = utf_sym(raw, stream.read_u16()?)?;
        let f_sig = utf_sym(raw, stream.read_u16()?)?;
        let offset = if f_access.contains(AccessFlags::STATIC) {
            let slot = statics.len() as u16;
            statics.push(field_default(vm.symbols.resolve(f_sig)));
            slot
        } else {
            let slot = instance_at;
            instance_at += 1;
            slot
        };
        fields.push(Field {
            name: f_name,
            sig: f_sig,
            access: f_access,
            offset,
        });
    }

    // Methods, with the frame ceiling enforced here at link time.
    let method_count = stream.read_u16()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        let m_access = AccessFlags::from_bits_truncate(stream.read_u16()?);
        let m_name = utf_sym(raw, stream.read_u16()?)?;
        let m_sig = utf_sym(raw, stream.read_u16()?)?;
        let max_stack = stream.read_u16()?;
        let max_locals = stream.read_u16()?;
        let code_len = stream.read_u32()? as usize;
        let body = if code_len > 0 {
            let bytes = stream.read_bytes(code_len)?;
            let handler_count = stream.read_u16()?;
            let mut handlers = Vec::with_capacity(handler_count as usize);
            for _ in 0..handler_count {
                handlers.push(Handler {
                    start_pc: stream.read_u16()?,
                    end_pc: stream.read_u16()?,
                    class_index: stream.read_u16()?,
                    target: stream.read_u16()?,
                });
            }
            let sm_len = stream.read_u16()? as usize;
            let stack_map = stream.read_bytes(sm_len)?.into_boxed_slice();
            MethodBody::Code(CodeBlock {
                bytes: bytes.into(),
                handlers: handlers.into(),
                stack_map,
            })
        } else if m_access.contains(AccessFlags::NATIVE) {
            MethodBody::Native
        } else {
            MethodBody::Abstract
        };

        let sig_text = vm.symbols.resolve(m_sig).to_owned();
        let (args, returns_value) = parse_signature(&sig_text);
        let arg_cells = args + if m_access.contains(AccessFlags::STATIC) { 0 } else { 1 };
        let method = Method {
            name: m_name,
            sig: m_sig,
            access: m_access,
            arg_cells,
            returns_value,
            max_locals,
            max_stack,
            body,
        };
        if method.frame_cells() > CHUNK_CELLS {
            return Err(VmError::FrameTooLarge {
                name: vm.symbols.resolve(m_name).to_owned(),
                sig: sig_text,
                cells: method.frame_cells(),
                limit: CHUNK_CELLS,
            });
        }
        methods.push(method);
    }

    // Commit the model and walk the status chain.
    let cp = build_pool(raw)?;
    {
        let class = vm.classes.get_mut(id);
        class.access = access;
        let plain = class.plain_mut();
        plain.super_class = super_class;
        plain.pool = cp;
        plain.interfaces = interfaces;
        plain.fields = fields;
        plain.statics = statics;
        plain.methods = methods;
        plain.instance_field_cells = instance_at;
    }
    vm.classes.advance_status(id, ClassStatus::Loaded);
    vm.classes.advance_status(id, ClassStatus::Linked);

    // Verification happens exactly once, here.
    let verifier = std::mem::replace(&mut vm.verifier, Box::new(PermissiveVerifier));
    let verdict = verifier.verify(vm, id);
    vm.verifier = verifier;
    match verdict {
        Ok(()) => {
            vm.classes.advance_status(id, ClassStatus::Verified);
            debug!("loaded {}", vm.class_display_name(id));
            Ok(())
        }
        Err(reason) => Err(VmError::Verify {
            class: vm.class_display_name(id),
            reason,
        }),
    }
}

fn read_raw_pool(
    vm: &mut Vm,
    stream: &mut dyn ClassFileStream,
) -> Result<Vec<RawConst>, VmError> {
    let count = stream.read_u16()?;
    let mut raw = Vec::with_capacity(count as usize);
    raw.push(RawConst::Absent);
    for _ in 1..count {
        let tag = stream.read_u8()?;
        let entry = match tag {
            TAG_UTF8 => {
                let len = stream.read_u16()? as usize;
                let bytes = stream.read_bytes(len)?;
                let text = String::from_utf8(bytes)
                    .map_err(|_| VmError::MalformedImage("utf8 pool entry"))?;
                RawConst::Utf8(vm.symbols.intern(&text))
            }
            TAG_INTEGER => RawConst::Integer(stream.read_u32()? as i32 as i64),
            TAG_CLASS => RawConst::Class(stream.read_u16()?),
            TAG_STRING => RawConst::Str(stream.read_u16()?),
            TAG_FIELDREF | TAG_METHODREF | TAG_INTERFACEMETHODREF => RawConst::Member {
                tag,
                class: stream.read_u16()?,
                nat: stream.read_u16()?,
            },
            TAG_NAMEANDTYPE => RawConst::NameAndType {
                name: stream.read_u16()?,
                sig: stream.read_u16()?,
            },
            other => return Err(VmError::UnsupportedPoolTag(other)),
        };
        raw.push(entry);
    }
    Ok(raw)
}

fn build_pool(raw: &[RawConst]) -> Result<ConstantPool, VmError> {
    let mut cp = ConstantPool::with_len(raw.len() as u16);
    for (i, entry) in raw.iter().enumerate().skip(1) {
        let i = i as u16;
        match entry {
            RawConst::Absent => {}
            RawConst::Utf8(sym) => cp.set(i, TAG_UTF8, PoolEntry::Utf8(*sym)),
            RawConst::Integer(v) => cp.set(i, TAG_INTEGER, PoolEntry::Integer(*v)),
            RawConst::Class(utf) => {
                cp.set(i, TAG_CLASS, PoolEntry::Class(utf_sym(raw, *utf)?))
            }
            RawConst::Str(utf) => cp.set(i, TAG_STRING, PoolEntry::Str(utf_sym(raw, *utf)?)),
            RawConst::Member { tag, class, nat } => cp.set(
                i,
                *tag,
                PoolEntry::Member {
                    class: *class,
                    name_and_type: *nat,
                },
            ),
            RawConst::NameAndType { name, sig } => cp.set(
                i,
                TAG_NAMEANDTYPE,
                PoolEntry::NameAndType {
                    name: utf_sym(raw, *name)?,
                    sig: utf_sym(raw, *sig)?,
                },
            ),
        }
    }
    Ok(cp)
}

fn utf_sym(raw: &[RawConst], index: u16) -> Result<SymbolId, VmError> {
    match raw.get(index as usize) {
        Some(RawConst::Utf8(sym)) => Ok(*sym),
        _ => Err(VmError::MalformedImage("index does not name a utf8 entry")),
    }
}

fn class_sym(raw: &[RawConst], index: u16) -> Result<SymbolId, VmError> {
    match raw.get(index as usize) {
        Some(RawConst::Class(utf)) => utf_sym(raw, *utf),
        _ => Err(VmError::MalformedImage("index does not name a class entry")),
    }
}

/// Resolve a pool class entry to an already-linked class, loading it
/// through the image provider if necessary (host-level path).
fn require_linked(vm: &mut Vm, raw: &[RawConst], index: u16) -> Result<ClassId, VmError> {
    let sym = class_sym(raw, index)?;
    let name = vm.symbols.resolve(sym).to_owned();
    let (package, base) = pool::split_name(&name);
    let package = vm.symbols.intern(package);
    let base = vm.symbols.intern(base);
    if let Some(id) = vm.classes.find(package, base) {
        match vm.classes.get(id).status {
            ClassStatus::Loading => return Err(VmError::CircularSuperclass(name)),
            s if s >= ClassStatus::Linked => return Ok(id),
            _ => {}
        }
    }
    load_by_provider(vm, &name).ok_or(VmError::MissingSuperclass(name))
}

fn load_by_provider(vm: &mut Vm, name: &str) -> Option<ClassId> {
    let image = vm.provider.as_ref()?.open(name)?;
    let mut stream = ByteStream::new(&image);
    match load_class(vm, &mut stream) {
        Ok(id) => Some(id),
        Err(e) => {
            debug!("provider image for {name} failed to load: {e}");
            None
        }
    }
}

/// Managed-path lookup used by constant pool resolution: the class must
/// end up at least linked, or a `NoClassDefFoundError` is raised.
pub fn ensure_linked(vm: &mut Vm, package: SymbolId, base: SymbolId) -> VmResult<ClassId> {
    if let Some(id) = vm.classes.find(package, base) {
        let status = vm.classes.get(id).status;
        if status >= ClassStatus::Linked && status != ClassStatus::Error {
            return Ok(id);
        }
    }
    let package_text = vm.symbols.resolve(package).to_owned();
    let base_text = vm.symbols.resolve(base).to_owned();
    let name = if package_text.is_empty() {
        base_text
    } else {
        format!("{package_text}/{base_text}")
    };
    match load_by_provider(vm, &name) {
        Some(id) => Ok(id),
        None => Err(vm.throw(ThrowableKind::NoClassDefFound, &name)),
    }
}

/// Builder for the image format above; the writer-side counterpart used
/// by tooling and tests.
#[derive(Debug, Default)]
pub struct ImageBuilder {
    pool: Vec<Vec<u8>>,
    access: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<u8>,
    field_count: u16,
    methods: Vec<u8>,
    method_count: u16,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_pool(&mut self, bytes: Vec<u8>) -> u16 {
        self.pool.push(bytes);
        self.pool.len() as u16
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        let mut e = vec![TAG_UTF8];
        e.extend_from_slice(&(text.len() as u16).to_be_bytes());
        e.extend_from_slice(text.as_bytes());
        self.push_pool(e)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut e = vec![TAG_INTEGER];
        e.extend_from_slice(&(value as u32).to_be_bytes());
        self.push_pool(e)
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let utf = self.utf8(name);
        let mut e = vec![TAG_CLASS];
        e.extend_from_slice(&utf.to_be_bytes());
        self.push_pool(e)
    }

    pub fn string(&mut self, text: &str) -> u16 {
        let utf = self.utf8(text);
        let mut e = vec![TAG_STRING];
        e.extend_from_slice(&utf.to_be_bytes());
        self.push_pool(e)
    }

    pub fn name_and_type(&mut self, name: &str, sig: &str) -> u16 {
        let n = self.utf8(name);
        let s = self.utf8(sig);
        let mut e = vec![TAG_NAMEANDTYPE];
        e.extend_from_slice(&n.to_be_bytes());
        e.extend_from_slice(&s.to_be_bytes());
        self.push_pool(e)
    }

    pub fn member(&mut self, tag: u8, class: u16, nat: u16) -> u16 {
        let mut e = vec![tag];
        e.extend_from_slice(&class.to_be_bytes());
        e.extend_from_slice(&nat.to_be_bytes());
        self.push_pool(e)
    }

    pub fn field_ref(&mut self, class: u16, name: &str, sig: &str) -> u16 {
        let nat = self.name_and_type(name, sig);
        self.member(TAG_FIELDREF, class, nat)
    }

    pub fn method_ref(&mut self, class: u16, name: &str, sig: &str) -> u16 {
        let nat = self.name_and_type(name, sig);
        self.member(TAG_METHODREF, class, nat)
    }

    pub fn interface_method_ref(&mut self, class: u16, name: &str, sig: &str) -> u16 {
        let nat = self.name_and_type(name, sig);
        self.member(TAG_INTERFACEMETHODREF, class, nat)
    }

    pub fn this_class(&mut self, entry: u16, access: AccessFlags) -> &mut Self {
        self.this_class = entry;
        self.access = access.bits();
        self
    }

    pub fn super_class(&mut self, entry: u16) -> &mut Self {
        self.super_class = entry;
        self
    }

    pub fn interface(&mut self, entry: u16) -> &mut Self {
        self.interfaces.push(entry);
        self
    }

    pub fn field(&mut self, access: AccessFlags, name: &str, sig: &str) -> &mut Self {
        let n = self.utf8(name);
        let s = self.utf8(sig);
        self.fields.extend_from_slice(&access.bits().to_be_bytes());
        self.fields.extend_from_slice(&n.to_be_bytes());
        self.fields.extend_from_slice(&s.to_be_bytes());
        self.field_count += 1;
        self
    }

    pub fn native_method(&mut self, access: AccessFlags, name: &str, sig: &str) -> &mut Self {
        self.raw_method(access | AccessFlags::NATIVE, name, sig, 0, 0, &[], &[], &[])
    }

    pub fn method(
        &mut self,
        access: AccessFlags,
        name: &str,
        sig: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
        handlers: &[Handler],
    ) -> &mut Self {
        self.raw_method(access, name, sig, max_stack, max_locals, code, handlers, &[])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn raw_method(
        &mut self,
        access: AccessFlags,
        name: &str,
        sig: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
        handlers: &[Handler],
        stack_map: &[u8],
    ) -> &mut Self {
        let n = self.utf8(name);
        let s = self.utf8(sig);
        let m = &mut self.methods;
        m.extend_from_slice(&access.bits().to_be_bytes());
        m.extend_from_slice(&n.to_be_bytes());
        m.extend_from_slice(&s.to_be_bytes());
        m.extend_from_slice(&max_stack.to_be_bytes());
        m.extend_from_slice(&max_locals.to_be_bytes());
        m.extend_from_slice(&(code.len() as u32).to_be_bytes());
        m.extend_from_slice(code);
        if !code.is_empty() {
            m.extend_from_slice(&(handlers.len() as u16).to_be_bytes());
            for h in handlers {
                m.extend_from_slice(&h.start_pc.to_be_bytes());
                m.extend_from_slice(&h.end_pc.to_be_bytes());
                m.extend_from_slice(&h.class_index.to_be_bytes());
                m.extend_from_slice(&h.target.to_be_bytes());
            }
            m.extend_from_slice(&(stack_map.len() as u16).to_be_bytes());
            m.extend_from_slice(stack_map);
        }
        self.method_count += 1;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((self.pool.len() + 1) as u16).to_be_bytes());
        for entry in &self.pool {
            out.extend_from_slice(entry);
        }
        out.extend_from_slice(&self.access.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for i in &self.interfaces {
            out.extend_from_slice(&i.to_be_bytes());
        }
        out.extend_from_slice(&self.field_count.to_be_bytes());
        out.extend_from_slice(&self.fields);
        out.extend_from_slice(&self.method_count.to_be_bytes());
        out.extend_from_slice(&self.methods);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op;
    use crate::heap::HeapCreateInfo;
    use crate::vm::VmCreateInfo;

    fn test_vm() -> Vm {
        Vm::new(VmCreateInfo {
            heap: HeapCreateInfo { cells: 4096 },
            ..Default::default()
        })
    }

    fn simple_class_image(name: &str) -> Vec<u8> {
        let mut b = ImageBuilder::new();
        let this = b.class(name);
        let sup = b.class("java/lang/Object");
        b.this_class(this, AccessFlags::PUBLIC)
            .super_class(sup)
            .field(AccessFlags::PUBLIC, "value", "I")
            .field(
                AccessFlags::PUBLIC | AccessFlags::STATIC,
                "shared",
                "Ljava/lang/Object;",
            )
            .method(
                AccessFlags::PUBLIC | AccessFlags::STATIC,
                "answer",
                "()I",
                1,
                0,
                &[op::BIPUSH, 42, op::IRETURN],
                &[],
            );
        b.build()
    }

    #[test]
    fn loads_a_class_to_verified() {
        let mut vm = test_vm();
        let image = simple_class_image("demo/Simple");
        let id = load_class(&mut vm, &mut ByteStream::new(&image)).expect("load");
        let class = vm.classes.get(id);
        assert_eq!(class.status, ClassStatus::Verified);
        assert_eq!(class.plain().super_class, Some(vm.core.object));
        assert_eq!(class.plain().instance_field_cells, 1);
        assert_eq!(class.plain().statics.len(), 1);
        assert!(
            class.plain().statics[0].is_null(),
            "reference statics default to null"
        );
        let m = &class.plain().methods[0];
        assert_eq!(m.arg_cells, 0);
        assert!(m.returns_value);
    }

    #[test]
    fn duplicate_load_is_rejected() {
        let mut vm = test_vm();
        let image = simple_class_image("demo/Simple");
        load_class(&mut vm, &mut ByteStream::new(&image)).expect("first load");
        let err = load_class(&mut vm, &mut ByteStream::new(&image)).unwrap_err();
        assert!(matches!(err, VmError::DuplicateClass(_)));
    }

    #[test]
    fn truncated_image_rolls_back_to_raw() {
        let mut vm = test_vm();
        let image = simple_class_image("demo/Broken");
        let cut = &image[..image.len() - 4];
        let err = load_class(&mut vm, &mut ByteStream::new(cut)).unwrap_err();
        assert!(matches!(err, VmError::UnexpectedEndOfStream));

        let pkg = vm.symbols.intern("demo");
        let base = vm.symbols.intern("Broken");
        let id = vm.classes.find(pkg, base).expect("raw entry exists");
        assert_eq!(
            vm.classes.get(id).status,
            ClassStatus::Raw,
            "failed load must revert the class to raw"
        );
        // And a complete retry succeeds.
        let id = load_class(&mut vm, &mut ByteStream::new(&image)).expect("retry");
        assert_eq!(vm.classes.get(id).status, ClassStatus::Verified);
    }

    #[test]
    fn verifier_failure_reverts_and_reports() {
        struct Rejecting;
        impl crate::bindings::Verifier for Rejecting {
            fn verify(&self, _vm: &Vm, _class: ClassId) -> Result<(), String> {
                Err("stack shape mismatch".into())
            }
        }
        let mut vm = test_vm();
        vm.verifier = Box::new(Rejecting);
        let image = simple_class_image("demo/Bad");
        let err = load_class(&mut vm, &mut ByteStream::new(&image)).unwrap_err();
        assert!(matches!(err, VmError::Verify { .. }));
        let pkg = vm.symbols.intern("demo");
        let base = vm.symbols.intern("Bad");
        let id = vm.classes.find(pkg, base).unwrap();
        assert_eq!(vm.classes.get(id).status, ClassStatus::Raw);
    }

    #[test]
    fn oversized_frame_is_rejected_at_link_time() {
        let mut vm = test_vm();
        let mut b = ImageBuilder::new();
        let this = b.class("demo/Huge");
        let sup = b.class("java/lang/Object");
        b.this_class(this, AccessFlags::PUBLIC).super_class(sup).method(
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            "big",
            "()V",
            400,
            400,
            &[op::RETURN],
            &[],
        );
        let err = load_class(&mut vm, &mut ByteStream::new(&b.build())).unwrap_err();
        assert!(matches!(err, VmError::FrameTooLarge { .. }));
    }

    #[test]
    fn missing_superclass_without_provider_fails() {
        let mut vm = test_vm();
        let mut b = ImageBuilder::new();
        let this = b.class("demo/Orphan");
        let sup = b.class("demo/NeverLoaded");
        b.this_class(this, AccessFlags::PUBLIC).super_class(sup);
        let err = load_class(&mut vm, &mut ByteStream::new(&b.build())).unwrap_err();
        assert!(matches!(err, VmError::MissingSuperclass(_)));
    }

    #[test]
    fn provider_supplies_superclasses_recursively() {
        struct MapProvider;
        impl crate::bindings::ClassImageProvider for MapProvider {
            fn open(&self, name: &str) -> Option<Vec<u8>> {
                (name == "demo/Base").then(|| simple_class_image("demo/Base"))
            }
        }
        let mut vm = test_vm();
        vm.provider = Some(Box::new(MapProvider));
        let mut b = ImageBuilder::new();
        let this = b.class("demo/Derived");
        let sup = b.class("demo/Base");
        b.this_class(this, AccessFlags::PUBLIC).super_class(sup);
        let id = load_class(&mut vm, &mut ByteStream::new(&b.build())).expect("load");
        let sup = vm.classes.get(id).plain().super_class.expect("super set");
        assert_eq!(vm.class_display_name(sup), "demo/Base");
    }
}
