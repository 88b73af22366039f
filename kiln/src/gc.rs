//! Mark-and-sweep collection, optionally compacting, over the declared
//! root set: the fixed global-root array, the bootstrap and per-thread
//! temporary-root stacks, every thread's full stack-chunk chain, class
//! statics and resolved string pool entries, and the intern table.
//!
//! Weak/cleanup registrations are not roots and never keep a referent
//! alive; their callbacks run only at VM teardown. The collector is not
//! reentrant: a nested invocation means the engine's own invariants broke
//! and is fatal. Before marking, in-flight asynchronous native I/O is
//! quiesced so a compacting phase cannot move memory a host thread is
//! still writing into, and the running thread's interpreter registers must
//! already be flushed into its thread record; it reloads them afterwards.

use ahash::AHashMap;
use log::debug;

use crate::class::{ClassKind, ClassTable};
use crate::header::GcKind;
use crate::heap::{ARRAY_ELEMS, FIRST_BLOCK, Heap, INSTANCE_FIELDS};
use crate::strings::Interns;
use crate::threads::{TempRoots, ThreadContext};
use crate::value::{HeapRef, Value};
use crate::vm::Vm;

/// Permanent root slots, registered once during init. Fixed capacity:
/// overflow is a build-time misconfiguration and fatal.
#[derive(Debug)]
pub struct GlobalRoots {
    slots: Vec<Value>,
    capacity: usize,
}

impl GlobalRoots {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn register(&mut self, value: Value) -> usize {
        assert!(
            self.slots.len() < self.capacity,
            "global root array overflow (capacity {})",
            self.capacity
        );
        self.slots.push(value);
        self.slots.len() - 1
    }

    pub fn get(&self, index: usize) -> Value {
        self.slots[index]
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.slots[index] = value;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn for_each_slot_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        for v in &mut self.slots {
            f(v);
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct GcStats {
    pub live_objects: usize,
    pub reclaimed_cells: usize,
    pub free_cells: usize,
    pub compacted: bool,
}

/// Every location the collector treats as a root. Marking reads through
/// this and compaction rewrites through it, so the two can never drift.
fn for_each_root_slot(
    classes: &mut ClassTable,
    threads: &mut [ThreadContext],
    interns: &mut Interns,
    globals: &mut GlobalRoots,
    boot_roots: &mut TempRoots,
    mut f: impl FnMut(&mut Value),
) {
    globals.for_each_slot_mut(&mut f);
    boot_roots.for_each_slot_mut(&mut f);
    interns.for_each_slot_mut(&mut f);
    for id in classes.ids().collect::<Vec<_>>() {
        if let ClassKind::Plain(plain) = &mut classes.get_mut(id).kind {
            for v in &mut plain.statics {
                f(v);
            }
            plain.pool.for_each_string_ref(&mut f);
        }
    }
    for thread in threads {
        thread.stack.for_each_slot_mut(&mut f);
        thread.temp_roots.for_each_slot_mut(&mut f);
        if let Some(pending) = &mut thread.pending_exception {
            f(pending);
        }
    }
}

/// Run one full collection. `reason` only feeds the log line.
pub fn collect(vm: &mut Vm, reason: &str) -> GcStats {
    assert!(!vm.collecting, "garbage collector re-entered");
    vm.collecting = true;

    // Quiesce asynchronous native I/O before anything can move.
    while vm.io.in_flight() > 0 {
        vm.platform.yield_native();
    }

    // The running thread's registers must be flushed into its record,
    // otherwise the collector cannot see its live references.
    if let Some(tid) = vm.current {
        assert!(
            vm.threads[tid.0 as usize].parked,
            "collection with unflushed interpreter registers"
        );
    }

    let compact = vm.config.compact_on_gc;
    let Vm {
        heap,
        classes,
        threads,
        interns,
        globals,
        boot_roots,
        ..
    } = vm;

    // Mark from every root slot.
    let mut worklist: Vec<HeapRef> = Vec::new();
    for_each_root_slot(classes, threads, interns, globals, boot_roots, |v| {
        if let Some(r) = v.as_ref() {
            worklist.push(r);
        }
    });
    let live_objects = trace(heap, worklist);

    let free_before = heap.free_cells();
    let stats = if compact {
        compact_heap(heap, classes, threads, interns, globals, boot_roots);
        GcStats {
            live_objects,
            reclaimed_cells: heap.free_cells().saturating_sub(free_before),
            free_cells: heap.free_cells(),
            compacted: true,
        }
    } else {
        sweep(heap);
        GcStats {
            live_objects,
            reclaimed_cells: heap.free_cells().saturating_sub(free_before),
            free_cells: heap.free_cells(),
            compacted: false,
        }
    };

    vm.collecting = false;
    vm.gc_cycles += 1;
    debug!(
        "gc ({reason}): {} live, {} cells reclaimed, {} free{}",
        stats.live_objects,
        stats.reclaimed_cells,
        stats.free_cells,
        if stats.compacted { ", compacted" } else { "" }
    );
    stats
    // The interpreter reloads the running thread's registers when it
    // unparks after this returns.
}

/// Mark everything reachable from the worklist. Returns the live count.
fn trace(heap: &mut Heap, mut worklist: Vec<HeapRef>) -> usize {
    let mut live = 0;
    while let Some(r) = worklist.pop() {
        let mut header = heap.header(r);
        if header.marked {
            continue;
        }
        if header.kind == GcKind::Free {
            panic!("root or edge points at freed block {}", r.0);
        }
        header.marked = true;
        heap.write_header(r, header);
        live += 1;

        let scan_from = match header.kind {
            GcKind::Instance => INSTANCE_FIELDS,
            GcKind::RefArray => ARRAY_ELEMS,
            GcKind::PrimArray => continue,
            GcKind::Free => unreachable!(),
        };
        for offset in scan_from..header.size {
            if let Some(edge) = heap.value_at(r, offset).as_ref() {
                worklist.push(edge);
            }
        }
    }
    live
}

/// Non-moving sweep: unmarked blocks join the free list, marks clear.
fn sweep(heap: &mut Heap) {
    let mut blocks = Vec::new();
    heap.walk(|r, h| blocks.push((r, h)));
    for (r, mut header) in blocks {
        if header.kind == GcKind::Free {
            continue;
        }
        if header.marked {
            header.marked = false;
            heap.write_header(r, header);
        } else {
            heap.release(r);
        }
    }
    heap.rebuild_free_list();
}

/// Sliding compaction: forward every live block to the lowest free
/// address, rewrite all references (roots and heap edges), then move the
/// blocks and hand the tail back as one free run.
fn compact_heap(
    heap: &mut Heap,
    classes: &mut ClassTable,
    threads: &mut [ThreadContext],
    interns: &mut Interns,
    globals: &mut GlobalRoots,
    boot_roots: &mut TempRoots,
) {
    let mut blocks = Vec::new();
    heap.walk(|r, h| blocks.push((r, h)));

    let mut forward: AHashMap<u32, u32> = AHashMap::new();
    let mut dest = FIRST_BLOCK;
    for (r, header) in &blocks {
        if header.kind != GcKind::Free && header.marked {
            forward.insert(r.0, dest + 1);
            dest += 1 + header.size;
        }
    }

    let remap = |forward: &AHashMap<u32, u32>, v: &mut Value| {
        if let Some(r) = v.as_ref() {
            let to = *forward
                .get(&r.0)
                .expect("live slot references an unmarked block");
            *v = Value::from_ref(HeapRef(to));
        }
    };

    // Rewrite heap-internal edges while blocks still sit at their old
    // addresses.
    for (r, header) in &blocks {
        if header.kind == GcKind::Free || !header.marked {
            continue;
        }
        let scan_from = match header.kind {
            GcKind::Instance => INSTANCE_FIELDS,
            GcKind::RefArray => ARRAY_ELEMS,
            _ => continue,
        };
        for offset in scan_from..header.size {
            let mut v = heap.value_at(*r, offset);
            remap(&forward, &mut v);
            heap.set_value(*r, offset, v);
        }
    }

    // Rewrite every root slot.
    for_each_root_slot(classes, threads, interns, globals, boot_roots, |v| {
        remap(&forward, v)
    });

    // Slide in address order; destinations never overlap sources upward.
    for (r, header) in &blocks {
        if header.kind == GcKind::Free || !header.marked {
            continue;
        }
        let mut cleared = *header;
        cleared.marked = false;
        heap.write_header(*r, cleared);
        let to = forward[&r.0];
        heap.slide(*r, to - 1);
    }
    heap.set_tail_free(dest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::PrimType;
    use crate::header::GcKind;
    use crate::heap::HeapCreateInfo;
    use crate::vm::{Vm, VmCreateInfo};

    fn vm_with(cells: usize, compact: bool) -> Vm {
        Vm::new(VmCreateInfo {
            heap: HeapCreateInfo { cells },
            compact_on_gc: compact,
            ..Default::default()
        })
    }

    /// End-to-end: a 4-unit array reports its size, survives collection
    /// while rooted, and its space comes back once the root is dropped.
    #[test]
    fn four_unit_array_survives_rooted_and_reclaims_unrooted() {
        let mut vm = vm_with(2048, false);
        let int_arr = vm.prim_array_class(PrimType::Int);
        let v = vm.new_array(int_arr, 1).expect("alloc");
        let r = v.expect_ref();
        assert_eq!(vm.heap.object_size(r), 4, "class + monitor + length + 1 element");

        vm.push_temp(v);
        vm.collect();
        let v = vm.pop_temp();
        assert_eq!(v.expect_ref(), r, "non-compacting collection must not move it");
        assert_eq!(vm.heap.object_kind(r), GcKind::PrimArray);
        assert_eq!(vm.heap.array_length(r), 1);

        let free_while_rooted = vm.heap.free_cells();
        vm.collect();
        assert!(
            vm.heap.free_cells() >= free_while_rooted + 4,
            "free space must grow by at least the array's 4 units"
        );
    }

    #[test]
    fn unreachable_objects_are_reclaimed_in_one_cycle() {
        let mut vm = vm_with(4096, false);
        let int_arr = vm.prim_array_class(PrimType::Int);
        let baseline = vm.heap.free_cells();
        for _ in 0..10 {
            vm.new_array(int_arr, 8).expect("alloc");
        }
        assert!(vm.heap.free_cells() < baseline);
        let stats = vm.collect();
        assert!(stats.reclaimed_cells >= 10 * (8 + 3));
        assert_eq!(vm.heap.free_cells(), baseline);
    }

    #[test]
    fn objects_reachable_only_through_the_heap_survive() {
        for compact in [false, true] {
            let mut vm = vm_with(4096, compact);
            let int_arr = vm.prim_array_class(PrimType::Int);
            let holder = vm.synth_class("demo", "Holder", Some(vm.core.object), &[("payload", "[I")]);

            let arr = vm.new_array(int_arr, 3).expect("alloc");
            {
                let r = arr.expect_ref();
                for i in 0..3 {
                    vm.heap.set(r, crate::heap::ARRAY_ELEMS + i, (7 + i) as u64);
                }
            }
            vm.push_temp(arr);
            let obj = vm.new_instance(holder).expect("alloc");
            let arr = vm.pop_temp();
            vm.heap
                .set_value(obj.expect_ref(), INSTANCE_FIELDS, arr);

            // The array is now reachable only through the instance field.
            vm.push_temp(obj);
            vm.collect();
            vm.collect();
            let obj = vm.pop_temp();

            let arr = vm.heap.value_at(obj.expect_ref(), INSTANCE_FIELDS);
            let r = arr.as_ref().expect("field still references the array");
            assert_eq!(vm.heap.object_kind(r), GcKind::PrimArray);
            assert_eq!(vm.heap.array_length(r), 3);
            for i in 0..3 {
                assert_eq!(
                    vm.heap.get(r, crate::heap::ARRAY_ELEMS + i),
                    (7 + i) as u64,
                    "payload intact (compact={compact})"
                );
            }
        }
    }

    #[test]
    fn compaction_slides_live_data_and_rewrites_roots() {
        let mut vm = vm_with(2048, true);
        let int_arr = vm.prim_array_class(PrimType::Int);

        let a = vm.new_array(int_arr, 4).expect("alloc");
        let hole = vm.new_array(int_arr, 64).expect("alloc");
        let b = vm.new_array(int_arr, 4).expect("alloc");
        for i in 0..4 {
            vm.heap.set(a.expect_ref(), crate::heap::ARRAY_ELEMS + i, (1 + i) as u64);
            vm.heap.set(b.expect_ref(), crate::heap::ARRAY_ELEMS + i, (11 + i) as u64);
        }
        let _ = hole;

        vm.push_temp(a);
        vm.push_temp(b);
        let stats = vm.collect();
        assert!(stats.compacted);
        let b2 = vm.pop_temp();
        let a2 = vm.pop_temp();

        assert_ne!(
            b2, b,
            "the array past the dead hole must have slid to a lower address"
        );
        for i in 0..4 {
            assert_eq!(vm.heap.get(a2.expect_ref(), crate::heap::ARRAY_ELEMS + i), (1 + i) as u64);
            assert_eq!(vm.heap.get(b2.expect_ref(), crate::heap::ARRAY_ELEMS + i), (11 + i) as u64);
        }

        // The tail is one contiguous free run: an allocation larger than
        // the old hole fits.
        assert!(vm.new_array(int_arr, 80).is_ok(), "compacted tail must fit 83 cells");
    }

    #[test]
    fn interned_strings_and_statics_are_roots() {
        for compact in [false, true] {
            let mut vm = vm_with(4096, compact);
            let s = vm.intern_string("rooted text").expect("intern");
            let keeper = vm.synth_class(
                "demo",
                "Keeper",
                Some(vm.core.object),
                &[],
            );
            {
                let class = vm.classes.get_mut(keeper);
                class.plain_mut().statics.push(s);
            }
            vm.collect();
            let s = vm.classes.get(keeper).plain().statics[0];
            assert_eq!(vm.read_string(s), "rooted text");
            let again = vm.intern_string("rooted text").expect("intern");
            assert_eq!(s, again, "intern table survived the cycle");
        }
    }

    #[test]
    fn gc_stats_count_live_objects() {
        let mut vm = vm_with(2048, false);
        let before = vm.collect().live_objects;
        let obj = vm.new_instance(vm.core.object).expect("alloc");
        vm.push_temp(obj);
        let after = vm.collect().live_objects;
        assert_eq!(after, before + 1);
        vm.pop_temp();
    }

    #[test]
    #[should_panic(expected = "garbage collector re-entered")]
    fn reentrant_collection_is_fatal() {
        let mut vm = vm_with(1024, false);
        vm.collecting = true;
        vm.collect();
    }

    #[test]
    #[should_panic(expected = "global root array overflow")]
    fn global_root_overflow_is_fatal() {
        let mut roots = GlobalRoots::new(2);
        roots.register(Value::null());
        roots.register(Value::null());
        roots.register(Value::null());
    }

    #[test]
    #[should_panic(expected = "unflushed interpreter registers")]
    fn collection_with_live_registers_is_fatal() {
        let mut vm = vm_with(1024, false);
        let tid = crate::threads::ThreadId(0);
        vm.threads
            .push(crate::threads::ThreadContext::new(tid, 8, 100));
        vm.threads[0].parked = false;
        vm.current = Some(tid);
        vm.collect();
    }
}
