//! The VM context: every piece of process-wide state (heap, class table,
//! intern table, inline cache, threads, cleanup list) lives in one [`Vm`]
//! with an explicit `new()`/`teardown()` lifecycle, so several instances
//! can coexist and tests stay deterministic.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::bindings::{
    ClassImageProvider, DebugHook, HostPlatform, IoControlBlocks, NativeFn,
    PermissiveVerifier, Platform, Verifier,
};
use crate::cache::InlineCache;
use crate::class::{
    AccessFlags, ClassId, ClassStatus, ClassTable, ElementKind, Field, MethodId,
    PrimType, sig_is_reference,
};
use crate::errors::{Throw, VmResult};
use crate::gc::{self, GcStats, GlobalRoots};
use crate::header::GcKind;
use crate::heap::{
    ARRAY_ELEMS, Heap, HeapCreateInfo, INSTANCE_FIELDS, MonitorWord, array_cells,
    instance_cells,
};
use crate::stack::KILL_THREAD_IP;
use crate::strings::{self, Interns, STRING_FIELD_CELLS};
use crate::symbols::{SymbolId, Symbols};
use crate::threads::{MonitorTable, TempRoots, ThreadContext, ThreadId, ThreadState};
use crate::value::Value;

/// Message field cell of `java/lang/Throwable`.
pub const THROWABLE_F_MESSAGE: u32 = 0;

#[derive(Debug, Clone)]
pub struct VmCreateInfo {
    pub heap: HeapCreateInfo,
    /// Compact during collection instead of sweeping in place.
    pub compact_on_gc: bool,
    /// Bytecode ticks per time slice.
    pub slice_len: u32,
    /// Check the slice at every bytecode instead of only at backward
    /// branches and returns.
    pub check_every_instruction: bool,
    pub icache_capacity: usize,
    pub global_root_capacity: usize,
    pub temp_root_capacity: usize,
    pub io_control_blocks: u8,
}

impl Default for VmCreateInfo {
    fn default() -> Self {
        Self {
            heap: HeapCreateInfo::default(),
            compact_on_gc: false,
            slice_len: 1000,
            check_every_instruction: false,
            icache_capacity: 64,
            global_root_capacity: 64,
            temp_root_capacity: 32,
            io_control_blocks: 8,
        }
    }
}

/// Managed throwables the engine itself raises.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum ThrowableKind {
    NullPointer = 0,
    ArrayIndex,
    ClassCast,
    Arithmetic,
    NegativeArraySize,
    ArrayStore,
    IllegalMonitorState,
    OutOfMemory,
    NoClassDefFound,
    NoSuchField,
    NoSuchMethod,
    IllegalAccess,
    IncompatibleClassChange,
    Verify,
    UnsatisfiedLink,
    Instantiation,
}

pub const THROWABLE_KIND_COUNT: usize = 16;

impl ThrowableKind {
    pub const ALL: [ThrowableKind; THROWABLE_KIND_COUNT] = [
        ThrowableKind::NullPointer,
        ThrowableKind::ArrayIndex,
        ThrowableKind::ClassCast,
        ThrowableKind::Arithmetic,
        ThrowableKind::NegativeArraySize,
        ThrowableKind::ArrayStore,
        ThrowableKind::IllegalMonitorState,
        ThrowableKind::OutOfMemory,
        ThrowableKind::NoClassDefFound,
        ThrowableKind::NoSuchField,
        ThrowableKind::NoSuchMethod,
        ThrowableKind::IllegalAccess,
        ThrowableKind::IncompatibleClassChange,
        ThrowableKind::Verify,
        ThrowableKind::UnsatisfiedLink,
        ThrowableKind::Instantiation,
    ];

    pub fn base_name(self) -> &'static str {
        match self {
            ThrowableKind::NullPointer => "NullPointerException",
            ThrowableKind::ArrayIndex => "ArrayIndexOutOfBoundsException",
            ThrowableKind::ClassCast => "ClassCastException",
            ThrowableKind::Arithmetic => "ArithmeticException",
            ThrowableKind::NegativeArraySize => "NegativeArraySizeException",
            ThrowableKind::ArrayStore => "ArrayStoreException",
            ThrowableKind::IllegalMonitorState => "IllegalMonitorStateException",
            ThrowableKind::OutOfMemory => "OutOfMemoryError",
            ThrowableKind::NoClassDefFound => "NoClassDefFoundError",
            ThrowableKind::NoSuchField => "NoSuchFieldError",
            ThrowableKind::NoSuchMethod => "NoSuchMethodError",
            ThrowableKind::IllegalAccess => "IllegalAccessError",
            ThrowableKind::IncompatibleClassChange => "IncompatibleClassChangeError",
            ThrowableKind::Verify => "VerifyError",
            ThrowableKind::UnsatisfiedLink => "UnsatisfiedLinkError",
            ThrowableKind::Instantiation => "InstantiationError",
        }
    }

    /// Errors extend `Error`, the rest extend `RuntimeException`.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ThrowableKind::OutOfMemory
                | ThrowableKind::NoClassDefFound
                | ThrowableKind::NoSuchField
                | ThrowableKind::NoSuchMethod
                | ThrowableKind::IllegalAccess
                | ThrowableKind::IncompatibleClassChange
                | ThrowableKind::Verify
                | ThrowableKind::UnsatisfiedLink
                | ThrowableKind::Instantiation
        )
    }
}

/// Classes and singletons the engine depends on, synthesized at init.
#[derive(Debug)]
pub struct CoreClasses {
    pub object: ClassId,
    pub string: ClassId,
    pub throwable: ClassId,
    pub error: ClassId,
    pub exception: ClassId,
    pub runtime_exception: ClassId,
    throwables: [ClassId; THROWABLE_KIND_COUNT],
    /// Preallocated so exhaustion can always be reported.
    pub oom_exception: Value,
}

impl CoreClasses {
    fn placeholder() -> Self {
        Self {
            object: ClassId(0),
            string: ClassId(0),
            throwable: ClassId(0),
            error: ClassId(0),
            exception: ClassId(0),
            runtime_exception: ClassId(0),
            throwables: [ClassId(0); THROWABLE_KIND_COUNT],
            oom_exception: Value::null(),
        }
    }

    pub fn throwable_class(&self, kind: ThrowableKind) -> ClassId {
        self.throwables[kind as usize]
    }
}

pub type CleanupFn = fn(&mut Vm, Value);

/// Weak registration with a native cleanup callback. Not a root; the
/// callback runs once, at teardown, whether or not the object is still
/// reachable.
pub struct CleanupEntry {
    pub object: Value,
    pub finalizer: CleanupFn,
}

#[derive(Default)]
pub struct NativeRegistry {
    map: ahash::AHashMap<(SymbolId, SymbolId, SymbolId, SymbolId), NativeFn>,
}

pub struct Vm {
    pub config: VmCreateInfo,
    pub heap: Heap,
    pub classes: ClassTable,
    pub symbols: Symbols,
    pub interns: Interns,
    pub cache: InlineCache,
    pub threads: Vec<ThreadContext>,
    pub monitors: MonitorTable,
    pub globals: GlobalRoots,
    /// Temporary roots used before any thread exists (bootstrap, natives
    /// called from host code).
    pub boot_roots: TempRoots,
    pub cleanups: Vec<CleanupEntry>,
    pub collecting: bool,
    pub gc_cycles: u64,
    pub io: Arc<IoControlBlocks>,
    pub platform: Box<dyn Platform>,
    pub verifier: Box<dyn Verifier>,
    pub debug: Option<Box<dyn DebugHook>>,
    pub provider: Option<Box<dyn ClassImageProvider>>,
    pub natives: NativeRegistry,
    pub core: CoreClasses,
    pub runnable: VecDeque<ThreadId>,
    pub current: Option<ThreadId>,
    pub(crate) next_hash: u32,
}

impl Vm {
    pub fn new(info: VmCreateInfo) -> Self {
        let mut vm = Self {
            heap: Heap::new(info.heap.clone()),
            classes: ClassTable::new(),
            symbols: Symbols::new(),
            interns: Interns::new(),
            cache: InlineCache::new(info.icache_capacity),
            threads: Vec::new(),
            monitors: MonitorTable::new(),
            globals: GlobalRoots::new(info.global_root_capacity),
            boot_roots: TempRoots::new(info.temp_root_capacity),
            cleanups: Vec::new(),
            collecting: false,
            gc_cycles: 0,
            io: IoControlBlocks::new(info.io_control_blocks),
            platform: Box::new(HostPlatform),
            verifier: Box::new(PermissiveVerifier),
            debug: None,
            provider: None,
            natives: NativeRegistry::default(),
            core: CoreClasses::placeholder(),
            runnable: VecDeque::new(),
            current: None,
            next_hash: 0,
            config: info,
        };
        vm.bootstrap();
        vm.register_builtin_natives();
        info!(
            "vm up: {} cells, {} core classes",
            vm.heap.total_cells(),
            vm.classes.len()
        );
        vm
    }

    /// Synthesize the core hierarchy and preallocate the out-of-memory
    /// exception. Object must be the first class created (id 0).
    fn bootstrap(&mut self) {
        let object = self.synth_class("java/lang", "Object", None, &[]);
        debug_assert_eq!(object, ClassId(0));
        let string = self.synth_class(
            "java/lang",
            "String",
            Some(object),
            &[("chars", "[C"), ("offset", "I"), ("length", "I")],
        );
        debug_assert_eq!(
            self.classes.get(string).plain().instance_field_cells,
            STRING_FIELD_CELLS
        );
        let throwable = self.synth_class(
            "java/lang",
            "Throwable",
            Some(object),
            &[("message", "Ljava/lang/String;")],
        );
        let error = self.synth_class("java/lang", "Error", Some(throwable), &[]);
        let exception = self.synth_class("java/lang", "Exception", Some(throwable), &[]);
        let runtime_exception =
            self.synth_class("java/lang", "RuntimeException", Some(exception), &[]);

        let mut throwables = [ClassId(0); THROWABLE_KIND_COUNT];
        for kind in ThrowableKind::ALL {
            let parent = if kind.is_error() { error } else { runtime_exception };
            throwables[kind as usize] =
                self.synth_class("java/lang", kind.base_name(), Some(parent), &[]);
        }

        self.core = CoreClasses {
            object,
            string,
            throwable,
            error,
            exception,
            runtime_exception,
            throwables,
            oom_exception: Value::null(),
        };

        let oom_class = self.core.throwable_class(ThrowableKind::OutOfMemory);
        let oom = self
            .new_instance(oom_class)
            .expect("bootstrap heap too small for the preallocated OOM exception");
        self.core.oom_exception = oom;
        self.globals.register(oom);
    }

    /// Create a ready synthetic class with sequential field offsets.
    pub fn synth_class(
        &mut self,
        package: &str,
        base: &str,
        super_class: Option<ClassId>,
        fields: &[(&str, &str)],
    ) -> ClassId {
        let package = self.symbols.intern(package);
        let base = self.symbols.intern(base);
        let id = self.classes.lookup_or_create(package, base);
        let super_cells = super_class
            .map(|s| self.classes.get(s).plain().instance_field_cells)
            .unwrap_or(0);
        let field_list: Vec<Field> = fields
            .iter()
            .enumerate()
            .map(|(i, (name, sig))| Field {
                name: self.symbols.intern(name),
                sig: self.symbols.intern(sig),
                access: AccessFlags::PUBLIC,
                offset: super_cells + i as u16,
            })
            .collect();
        {
            let class = self.classes.get_mut(id);
            class.access = AccessFlags::PUBLIC;
            let plain = class.plain_mut();
            plain.super_class = super_class;
            plain.instance_field_cells = super_cells + fields.len() as u16;
            plain.fields = field_list;
        }
        self.classes.advance_status(id, ClassStatus::Ready);
        id
    }

    // --- allocation ---

    /// Allocate `payload` cells, collecting once on exhaustion. Failure
    /// raises the preallocated out-of-memory exception: reporting the
    /// condition must not itself allocate.
    pub fn allocate(&mut self, payload: u32, kind: GcKind) -> VmResult<crate::value::HeapRef> {
        if let Some(r) = self.heap.alloc_raw(payload, kind) {
            return Ok(r);
        }
        gc::collect(self, "allocation failure");
        if let Some(r) = self.heap.alloc_raw(payload, kind) {
            return Ok(r);
        }
        warn!("heap exhausted: {} cells requested", payload);
        Err(Throw(self.core.oom_exception))
    }

    pub fn new_instance(&mut self, class: ClassId) -> VmResult<Value> {
        let fields = self.classes.get(class).plain().instance_field_cells as u32;
        let r = self.allocate(instance_cells(fields), GcKind::Instance)?;
        self.heap.init_instance(r, class.0, fields);
        // Reference-typed fields default to null, not to fixnum zero.
        let mut at = Some(class);
        while let Some(id) = at {
            let plain = self.classes.get(id).plain();
            let null_cells: Vec<u32> = plain
                .fields
                .iter()
                .filter(|f| !f.is_static() && sig_is_reference(self.symbols.resolve(f.sig)))
                .map(|f| INSTANCE_FIELDS + f.offset as u32)
                .collect();
            at = plain.super_class;
            for cell in null_cells {
                self.heap.set_value(r, cell, Value::null());
            }
        }
        Ok(Value::from_ref(r))
    }

    pub fn new_array(&mut self, array_class: ClassId, len: u32) -> VmResult<Value> {
        let refs = match &self.classes.get(array_class).kind {
            crate::class::ClassKind::Array(a) => matches!(a.element, ElementKind::Class(_)),
            crate::class::ClassKind::Plain(_) => {
                panic!("new_array on a plain class")
            }
        };
        let kind = if refs { GcKind::RefArray } else { GcKind::PrimArray };
        let r = self.allocate(array_cells(len), kind)?;
        self.heap.init_array(r, array_class.0, len, refs);
        Ok(Value::from_ref(r))
    }

    pub fn prim_array_class(&mut self, prim: PrimType) -> ClassId {
        self.classes
            .array_class_of(ElementKind::Prim(prim), &mut self.symbols)
    }

    /// Allocate a fresh (uninterned) string. The char array is held as a
    /// temporary root across the instance allocation.
    pub fn new_string(&mut self, text: &str) -> VmResult<Value> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let chars_class = self.prim_array_class(PrimType::Char);
        let arr = self.new_array(chars_class, units.len() as u32)?;
        {
            let r = arr.expect_ref();
            for (i, unit) in units.iter().enumerate() {
                self.heap.set(r, ARRAY_ELEMS + i as u32, *unit as u64);
            }
        }
        self.push_temp(arr);
        let s = match self.new_instance(self.core.string) {
            Ok(s) => s,
            Err(t) => {
                self.pop_temp();
                return Err(t);
            }
        };
        // Re-read the root: a compacting collection may have moved it.
        let arr = self.pop_temp();
        strings::init_string(&mut self.heap, s.expect_ref(), arr, 0, units.len() as u32);
        Ok(s)
    }

    /// Substring sharing the parent's character array; only a new header
    /// object is allocated.
    pub fn substring(&mut self, string: Value, from: u32, to: u32) -> VmResult<Value> {
        let r = string.expect_ref();
        let base_offset = self
            .heap
            .value_at(r, INSTANCE_FIELDS + crate::strings::STRING_F_OFFSET)
            .as_int() as u32;
        let length = strings::string_length(&self.heap, r);
        assert!(from <= to && to <= length, "substring range out of bounds");
        let chars = self
            .heap
            .value_at(r, INSTANCE_FIELDS + crate::strings::STRING_F_CHARS);

        self.push_temp(chars);
        let sub = match self.new_instance(self.core.string) {
            Ok(s) => s,
            Err(t) => {
                self.pop_temp();
                return Err(t);
            }
        };
        let chars = self.pop_temp();
        strings::init_string(
            &mut self.heap,
            sub.expect_ref(),
            chars,
            base_offset + from,
            to - from,
        );
        Ok(sub)
    }

    /// Canonical string for `text`, allocated on first use. Interned
    /// strings are collector roots and survive for the VM lifetime.
    pub fn intern_string(&mut self, text: &str) -> VmResult<Value> {
        if let Some(v) = self.interns.get(text) {
            return Ok(v);
        }
        let s = self.new_string(text)?;
        self.interns.insert(text.to_owned(), s);
        Ok(s)
    }

    pub fn read_string(&self, v: Value) -> String {
        strings::read_string(&self.heap, v.expect_ref())
    }

    // --- managed throwables ---

    /// Build a throwable of `kind`. If the heap cannot even hold the
    /// throwable, the preallocated out-of-memory exception is raised
    /// instead.
    pub fn throw(&mut self, kind: ThrowableKind, msg: &str) -> Throw {
        debug!("raising {}: {msg}", kind.base_name());
        match self.build_throwable(kind, msg) {
            Ok(v) => Throw(v),
            Err(t) => t,
        }
    }

    fn build_throwable(&mut self, kind: ThrowableKind, msg: &str) -> VmResult<Value> {
        let class = self.core.throwable_class(kind);
        let message = self.new_string(msg)?;
        self.push_temp(message);
        let exc = match self.new_instance(class) {
            Ok(e) => e,
            Err(t) => {
                self.pop_temp();
                return Err(t);
            }
        };
        let message = self.pop_temp();
        self.heap.set_value(
            exc.expect_ref(),
            INSTANCE_FIELDS + THROWABLE_F_MESSAGE,
            message,
        );
        Ok(exc)
    }

    pub fn throwable_message(&self, throwable: Value) -> Option<String> {
        let msg = self
            .heap
            .value_at(throwable.expect_ref(), INSTANCE_FIELDS + THROWABLE_F_MESSAGE);
        msg.as_ref().map(|r| strings::read_string(&self.heap, r))
    }

    // --- temporary roots ---

    /// Push onto the current thread's temporary-root stack, or the
    /// bootstrap stack when no thread is running.
    pub fn push_temp(&mut self, value: Value) {
        match self.current {
            Some(tid) => self.threads[tid.0 as usize].temp_roots.push(value),
            None => self.boot_roots.push(value),
        }
    }

    /// Pop and return the root, rewritten if a collection moved it.
    pub fn pop_temp(&mut self) -> Value {
        match self.current {
            Some(tid) => self.threads[tid.0 as usize].temp_roots.pop(),
            None => self.boot_roots.pop(),
        }
    }

    // --- identity hashes and monitors ---

    fn fresh_hash(&mut self) -> u32 {
        self.next_hash = self.next_hash.wrapping_add(0x9E37_79B9);
        (self.next_hash & 0x3FFF_FFFE) | 1
    }

    pub fn identity_hash(&mut self, v: Value) -> i64 {
        let r = v.expect_ref();
        match self.heap.monitor_word(r) {
            MonitorWord::Unlocked { hash: 0 } => {
                let hash = self.fresh_hash();
                self.heap.set_monitor_word(r, MonitorWord::Unlocked { hash });
                hash as i64
            }
            MonitorWord::Unlocked { hash } => hash as i64,
            MonitorWord::Thin { owner, count } => {
                // Locked objects park their hash in an inflated monitor.
                let hash = self.fresh_hash();
                let index = self.monitors.acquire();
                let m = self.monitors.get_mut(index);
                m.owner = Some(owner);
                m.count = count as u32;
                m.hash = hash;
                self.heap.set_monitor_word(r, MonitorWord::Inflated { index });
                hash as i64
            }
            MonitorWord::Inflated { index } => {
                if self.monitors.get(index).hash == 0 {
                    let hash = self.fresh_hash();
                    self.monitors.get_mut(index).hash = hash;
                }
                self.monitors.get(index).hash as i64
            }
        }
    }

    /// Try to take the monitor; false means the thread must block and the
    /// caller parks it on the wait queue we just joined.
    pub fn monitor_enter(&mut self, obj: Value, tid: ThreadId) -> bool {
        let r = obj.expect_ref();
        match self.heap.monitor_word(r) {
            MonitorWord::Unlocked { hash: 0 } => {
                self.heap
                    .set_monitor_word(r, MonitorWord::Thin { owner: tid, count: 1 });
                true
            }
            MonitorWord::Unlocked { hash } => {
                // Keep the assigned hash: inflate immediately.
                let index = self.monitors.acquire();
                let m = self.monitors.get_mut(index);
                m.owner = Some(tid);
                m.count = 1;
                m.hash = hash;
                self.heap.set_monitor_word(r, MonitorWord::Inflated { index });
                true
            }
            MonitorWord::Thin { owner, count } if owner == tid => {
                match count.checked_add(1) {
                    Some(count) => self
                        .heap
                        .set_monitor_word(r, MonitorWord::Thin { owner, count }),
                    None => {
                        let index = self.monitors.acquire();
                        let m = self.monitors.get_mut(index);
                        m.owner = Some(tid);
                        m.count = count as u32 + 1;
                        self.heap.set_monitor_word(r, MonitorWord::Inflated { index });
                    }
                }
                true
            }
            MonitorWord::Thin { owner, count } => {
                // Contention: inflate and queue up.
                let index = self.monitors.acquire();
                let m = self.monitors.get_mut(index);
                m.owner = Some(owner);
                m.count = count as u32;
                m.queue.push_back(tid);
                self.heap.set_monitor_word(r, MonitorWord::Inflated { index });
                false
            }
            MonitorWord::Inflated { index } => {
                let m = self.monitors.get_mut(index);
                match m.owner {
                    None => {
                        m.owner = Some(tid);
                        m.count = 1;
                        true
                    }
                    Some(owner) if owner == tid => {
                        m.count += 1;
                        true
                    }
                    Some(_) => {
                        m.queue.push_back(tid);
                        false
                    }
                }
            }
        }
    }

    pub fn monitor_exit(&mut self, obj: Value, tid: ThreadId) -> VmResult<()> {
        let r = obj.expect_ref();
        match self.heap.monitor_word(r) {
            MonitorWord::Thin { owner, count } if owner == tid => {
                if count == 1 {
                    self.heap
                        .set_monitor_word(r, MonitorWord::Unlocked { hash: 0 });
                } else {
                    self.heap.set_monitor_word(
                        r,
                        MonitorWord::Thin {
                            owner,
                            count: count - 1,
                        },
                    );
                }
                Ok(())
            }
            MonitorWord::Inflated { index } if self.monitors.get(index).owner == Some(tid) => {
                let woken;
                let deflate;
                {
                    let m = self.monitors.get_mut(index);
                    m.count -= 1;
                    if m.count == 0 {
                        m.owner = None;
                        // Barging hand-off: wake the head waiter; it
                        // re-runs its enter and competes again.
                        woken = m.queue.pop_front();
                        deflate = m.queue.is_empty() && m.hash == 0 && woken.is_none();
                    } else {
                        woken = None;
                        deflate = false;
                    }
                }
                if let Some(next) = woken {
                    self.make_runnable(next);
                }
                if deflate {
                    self.monitors.release(index);
                    self.heap
                        .set_monitor_word(r, MonitorWord::Unlocked { hash: 0 });
                }
                Ok(())
            }
            _ => Err(self.throw(
                ThrowableKind::IllegalMonitorState,
                "monitor exit by non-owner",
            )),
        }
    }

    // --- threads ---

    pub fn thread(&self, tid: ThreadId) -> &ThreadContext {
        &self.threads[tid.0 as usize]
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> &mut ThreadContext {
        &mut self.threads[tid.0 as usize]
    }

    pub fn make_runnable(&mut self, tid: ThreadId) {
        let t = self.thread_mut(tid);
        if t.state != ThreadState::Dead {
            t.state = ThreadState::Runnable;
            if !self.runnable.contains(&tid) {
                self.runnable.push_back(tid);
            }
        }
    }

    /// Create a green thread whose entry frame runs `method`. The frame's
    /// resume marker is the thread-kill sentinel.
    pub fn spawn_thread(&mut self, method: MethodId, args: &[Value]) -> ThreadId {
        let tid = ThreadId(self.threads.len() as u32);
        let mut thread = ThreadContext::new(
            tid,
            self.config.temp_root_capacity,
            self.config.slice_len,
        );
        let m = self.classes.method(method).clone();
        thread
            .stack
            .push_frame(method, &m, args, 0, KILL_THREAD_IP, None, None);
        thread.saved_ip = 0;
        self.threads.push(thread);
        self.runnable.push_back(tid);
        debug!("spawned thread {} entry {:?}", tid.0, method);
        tid
    }

    // --- natives ---

    pub fn register_native(&mut self, class: &str, name: &str, sig: &str, f: NativeFn) {
        let (package, base) = crate::pool::split_name(class);
        let key = (
            self.symbols.intern(package),
            self.symbols.intern(base),
            self.symbols.intern(name),
            self.symbols.intern(sig),
        );
        self.natives.map.insert(key, f);
    }

    pub fn lookup_native(&self, method: MethodId) -> Option<NativeFn> {
        let class = self.classes.get(method.class);
        let m = self.classes.method(method);
        self.natives
            .map
            .get(&(class.package, class.base, m.name, m.sig))
            .copied()
    }

    fn register_builtin_natives(&mut self) {
        self.register_native("kiln/Sys", "print", "(Ljava/lang/String;)V", native_print);
        self.register_native(
            "kiln/Sys",
            "println",
            "(Ljava/lang/String;)V",
            native_println,
        );
        self.register_native("kiln/Sys", "printInt", "(I)V", native_print_int);
        self.register_native("kiln/Sys", "currentTimeMillis", "()J", native_now);
        self.register_native("kiln/Sys", "yield", "()V", native_yield);
        self.register_native(
            "kiln/Sys",
            "identityHashCode",
            "(Ljava/lang/Object;)I",
            native_identity_hash,
        );
    }

    // --- collection, cleanup, lifecycle ---

    pub fn collect(&mut self) -> GcStats {
        gc::collect(self, "explicit")
    }

    /// Register a native finalizer. Runs exactly once, at teardown,
    /// regardless of reachability; the entry is not a root.
    pub fn register_cleanup(&mut self, object: Value, finalizer: CleanupFn) {
        self.cleanups.push(CleanupEntry { object, finalizer });
    }

    /// Shut the context down, running every still-registered cleanup
    /// callback unconditionally.
    pub fn teardown(mut self) {
        let entries = std::mem::take(&mut self.cleanups);
        debug!("teardown: {} cleanup entries", entries.len());
        for entry in entries {
            (entry.finalizer)(&mut self, entry.object);
        }
    }

    pub fn class_display_name(&self, id: ClassId) -> String {
        let class = self.classes.get(id);
        let package = self.symbols.resolve(class.package);
        let base = self.symbols.resolve(class.base);
        if package.is_empty() {
            base.to_owned()
        } else {
            format!("{package}/{base}")
        }
    }

    pub fn class_of(&self, v: Value) -> ClassId {
        ClassId(self.heap.class_of_raw(v.expect_ref()))
    }

    /// Field cell offset helper: instance fields sit behind the object
    /// header cells.
    pub fn field_cell(&self, field: crate::class::FieldId) -> u32 {
        INSTANCE_FIELDS + self.classes.field(field).offset as u32
    }

    pub fn static_slot(&self, field: crate::class::FieldId) -> (ClassId, usize) {
        (field.class, self.classes.field(field).offset as usize)
    }
}

// --- builtin natives (KNI-style: pop args, push result, report errors
// through the pending-exception slot) ---

fn native_print(vm: &mut Vm, tid: ThreadId) {
    let s = vm.thread_mut(tid).stack.pop_value();
    if s.is_null() {
        let t = vm.throw(ThrowableKind::NullPointer, "print(null)");
        vm.thread_mut(tid).pending_exception = Some(t.0);
        return;
    }
    print!("{}", vm.read_string(s));
}

fn native_println(vm: &mut Vm, tid: ThreadId) {
    let s = vm.thread_mut(tid).stack.pop_value();
    if s.is_null() {
        let t = vm.throw(ThrowableKind::NullPointer, "println(null)");
        vm.thread_mut(tid).pending_exception = Some(t.0);
        return;
    }
    println!("{}", vm.read_string(s));
}

fn native_print_int(vm: &mut Vm, tid: ThreadId) {
    let v = vm.thread_mut(tid).stack.pop_value();
    println!("{}", v.as_int());
}

fn native_now(vm: &mut Vm, tid: ThreadId) {
    let now = vm.platform.current_time_millis() as i64;
    vm.thread_mut(tid).stack.push_value(Value::from_int(now));
}

// Draining the slice makes the interpreter give the scheduler a turn at
// the next backward branch or return.
fn native_yield(vm: &mut Vm, tid: ThreadId) {
    vm.thread_mut(tid).slice = 0;
    vm.platform.yield_native();
}

fn native_identity_hash(vm: &mut Vm, tid: ThreadId) {
    let v = vm.thread_mut(tid).stack.pop_value();
    let hash = if v.is_null() { 0 } else { vm.identity_hash(v) };
    vm.thread_mut(tid).stack.push_value(Value::from_int(hash));
}

/// Default value of a freshly linked field slot.
pub fn field_default(sig: &str) -> Value {
    if sig_is_reference(sig) {
        Value::null()
    } else {
        Value::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::GcKind;

    fn small_vm() -> Vm {
        Vm::new(VmCreateInfo {
            heap: HeapCreateInfo { cells: 2048 },
            ..Default::default()
        })
    }

    #[test]
    fn bootstrap_builds_core_hierarchy() {
        let vm = small_vm();
        assert_eq!(vm.core.object, ClassId(0));
        let npe = vm.core.throwable_class(ThrowableKind::NullPointer);
        assert!(vm.classes.is_assignable(npe, vm.core.runtime_exception));
        assert!(vm.classes.is_assignable(npe, vm.core.throwable));
        let oom = vm.core.throwable_class(ThrowableKind::OutOfMemory);
        assert!(vm.classes.is_assignable(oom, vm.core.error));
        assert!(!vm.classes.is_assignable(npe, vm.core.error));
        assert!(vm.core.oom_exception.is_reference());
    }

    #[test]
    fn string_roundtrip_through_the_heap() {
        let mut vm = small_vm();
        let s = vm.new_string("héllo wörld").expect("alloc");
        assert_eq!(vm.read_string(s), "héllo wörld");
        assert_eq!(vm.class_of(s), vm.core.string);
    }

    #[test]
    fn substrings_share_the_parent_character_array() {
        let mut vm = small_vm();
        let s = vm.new_string("embedded machine").unwrap();
        let sub = vm.substring(s, 9, 16).unwrap();
        assert_eq!(vm.read_string(sub), "machine");
        let parent_chars = vm
            .heap
            .value_at(s.expect_ref(), INSTANCE_FIELDS + crate::strings::STRING_F_CHARS);
        let sub_chars = vm
            .heap
            .value_at(sub.expect_ref(), INSTANCE_FIELDS + crate::strings::STRING_F_CHARS);
        assert_eq!(parent_chars, sub_chars, "no character copy");

        let nested = vm.substring(sub, 0, 3).unwrap();
        assert_eq!(vm.read_string(nested), "mac");
    }

    #[test]
    fn interned_strings_are_canonical() {
        let mut vm = small_vm();
        let a = vm.intern_string("same").unwrap();
        let b = vm.intern_string("same").unwrap();
        let c = vm.intern_string("other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn throw_builds_typed_throwable_with_message() {
        let mut vm = small_vm();
        let t = vm.throw(ThrowableKind::ClassCast, "demo/A is not demo/B");
        let class = vm.class_of(t.0);
        assert_eq!(class, vm.core.throwable_class(ThrowableKind::ClassCast));
        assert_eq!(vm.throwable_message(t.0).as_deref(), Some("demo/A is not demo/B"));
    }

    #[test]
    fn oom_falls_back_to_the_preallocated_exception() {
        let mut vm = Vm::new(VmCreateInfo {
            heap: HeapCreateInfo { cells: 600 },
            ..Default::default()
        });
        // Exhaust the heap with unreachable-but-rooted arrays until
        // allocation fails.
        let int_arr = vm.prim_array_class(PrimType::Int);
        let mut failures = 0;
        for _ in 0..64 {
            match vm.new_array(int_arr, 32) {
                Ok(v) => {
                    vm.globals.register(v);
                }
                Err(t) => {
                    failures += 1;
                    assert_eq!(
                        t.0, vm.core.oom_exception,
                        "exhaustion must raise the preallocated OOM object"
                    );
                    break;
                }
            }
        }
        assert!(failures > 0, "heap never filled up");
    }

    #[test]
    fn identity_hash_is_stable_and_survives_locking() {
        let mut vm = small_vm();
        let obj = vm.new_instance(vm.core.object).unwrap();
        let h1 = vm.identity_hash(obj);
        let h2 = vm.identity_hash(obj);
        assert_eq!(h1, h2);
        assert_ne!(h1, 0);

        // Hash assigned, then locked: the monitor inflates and keeps it.
        let tid = ThreadId(0);
        vm.threads.push(ThreadContext::new(tid, 8, 100));
        assert!(vm.monitor_enter(obj, tid));
        assert_eq!(vm.identity_hash(obj), h1);
        vm.monitor_exit(obj, tid).unwrap();
        assert_eq!(vm.identity_hash(obj), h1);
    }

    #[test]
    fn monitor_reentry_and_contention() {
        let mut vm = small_vm();
        let obj = vm.new_instance(vm.core.object).unwrap();
        let a = ThreadId(0);
        let b = ThreadId(1);
        vm.threads.push(ThreadContext::new(a, 8, 100));
        vm.threads.push(ThreadContext::new(b, 8, 100));

        assert!(vm.monitor_enter(obj, a));
        assert!(vm.monitor_enter(obj, a), "reentry by owner succeeds");
        assert!(!vm.monitor_enter(obj, b), "contender must block");
        vm.monitor_exit(obj, a).unwrap();
        assert!(!vm.runnable.contains(&b), "still held once");
        vm.monitor_exit(obj, a).unwrap();
        assert!(vm.runnable.contains(&b), "release wakes the head waiter");
        assert!(vm.monitor_enter(obj, b), "woken thread can now take it");
    }

    #[test]
    fn unbalanced_monitor_exit_is_a_managed_error() {
        let mut vm = small_vm();
        let obj = vm.new_instance(vm.core.object).unwrap();
        let tid = ThreadId(0);
        vm.threads.push(ThreadContext::new(tid, 8, 100));
        let err = vm.monitor_exit(obj, tid).unwrap_err();
        assert_eq!(
            vm.class_of(err.0),
            vm.core.throwable_class(ThrowableKind::IllegalMonitorState)
        );
    }

    #[test]
    fn cleanup_callbacks_run_at_teardown_only() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn finalizer(_vm: &mut Vm, _obj: Value) {
            RAN.fetch_add(1, Ordering::SeqCst);
        }

        RAN.store(0, Ordering::SeqCst);
        let mut vm = small_vm();
        let obj = vm.new_instance(vm.core.object).unwrap();
        vm.register_cleanup(obj, finalizer);
        // Cleanup entries are not roots: a collection may reclaim the
        // object, the callback still runs at teardown.
        vm.collect();
        assert_eq!(RAN.load(Ordering::SeqCst), 0, "never during a cycle");
        vm.teardown();
        assert_eq!(RAN.load(Ordering::SeqCst), 1, "exactly once at teardown");
    }

    #[test]
    fn allocate_collects_before_failing() {
        let mut vm = Vm::new(VmCreateInfo {
            heap: HeapCreateInfo { cells: 700 },
            ..Default::default()
        });
        let int_arr = vm.prim_array_class(PrimType::Int);
        // Fill with garbage no root keeps alive.
        while vm.new_array(int_arr, 16).is_ok() {
            if vm.gc_cycles > 0 {
                break;
            }
        }
        assert!(
            vm.gc_cycles > 0,
            "allocation pressure must have triggered a collection"
        );
        // And the heap is usable again afterwards.
        assert!(vm.new_array(int_arr, 16).is_ok());
    }

    #[test]
    fn object_size_and_kind_are_pure_header_reads() {
        let mut vm = small_vm();
        let int_arr = vm.prim_array_class(PrimType::Int);
        let v = vm.new_array(int_arr, 1).unwrap();
        let r = v.expect_ref();
        // class + monitor + length + 1 element = 4 units
        assert_eq!(vm.heap.object_size(r), 4);
        assert_eq!(vm.heap.object_kind(r), GcKind::PrimArray);
    }
}
