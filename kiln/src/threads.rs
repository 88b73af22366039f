//! Green-thread records. Exactly one logical thread executes bytecode at a
//! time; everything here is bookkeeping the scheduler and collector read:
//! saved interpreter registers, the stack-chunk chain, the temporary-root
//! stack, and the inflated-monitor table.

use std::collections::VecDeque;

use crate::stack::ExecStack;
use crate::value::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,
    /// Parked on a contended monitor.
    Waiting,
    Dead,
}

/// Scoped roots protecting values held across a possible allocation.
/// Fixed capacity: overflow means a build-time misconfiguration, not a
/// runtime condition, and is fatal.
#[derive(Debug)]
pub struct TempRoots {
    slots: Vec<Value>,
    capacity: usize,
}

impl TempRoots {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: Value) {
        assert!(
            self.slots.len() < self.capacity,
            "temporary root stack overflow (capacity {})",
            self.capacity
        );
        self.slots.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.slots.pop().expect("temporary root underflow")
    }

    /// Read back a pushed root; the collector may have moved its referent.
    pub fn get(&self, index: usize) -> Value {
        self.slots[index]
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

#[derive(Debug)]
pub struct ThreadContext {
    pub id: ThreadId,
    pub state: ThreadState,
    pub stack: ExecStack,
    pub temp_roots: TempRoots,
    /// Set by natives to signal a managed exception instead of returning
    /// an error code.
    pub pending_exception: Option<Value>,
    /// Flushed instruction pointer; only meaningful while `parked`.
    pub saved_ip: usize,
    /// True when the interpreter registers are flushed into this record.
    /// The collector refuses to run for the current thread otherwise.
    pub parked: bool,
    /// Remaining time-slice ticks until the next reschedule.
    pub slice: u32,
}

impl ThreadContext {
    pub fn new(id: ThreadId, temp_root_capacity: usize, slice: u32) -> Self {
        Self {
            id,
            state: ThreadState::Runnable,
            stack: ExecStack::new(),
            temp_roots: TempRoots::new(temp_root_capacity),
            pending_exception: None,
            saved_ip: 0,
            parked: true,
            slice,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state != ThreadState::Dead
    }
}

/// An inflated monitor: taken when a thin lock sees contention or a locked
/// object needs a stable identity hash.
#[derive(Debug)]
pub struct Monitor {
    pub owner: Option<ThreadId>,
    pub count: u32,
    pub queue: VecDeque<ThreadId>,
    pub hash: u32,
    pub in_use: bool,
}

#[derive(Debug, Default)]
pub struct MonitorTable {
    monitors: Vec<Monitor>,
    free: Vec<u32>,
}

impl MonitorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> u32 {
        if let Some(i) = self.free.pop() {
            let m = &mut self.monitors[i as usize];
            debug_assert!(!m.in_use);
            m.owner = None;
            m.count = 0;
            m.hash = 0;
            m.queue.clear();
            m.in_use = true;
            return i;
        }
        let i = self.monitors.len() as u32;
        self.monitors.push(Monitor {
            owner: None,
            count: 0,
            queue: VecDeque::new(),
            hash: 0,
            in_use: true,
        });
        i
    }

    pub fn release(&mut self, index: u32) {
        let m = &mut self.monitors[index as usize];
        debug_assert!(m.in_use && m.queue.is_empty());
        m.in_use = false;
        self.free.push(index);
    }

    pub fn get(&self, index: u32) -> &Monitor {
        &self.monitors[index as usize]
    }

    pub fn get_mut(&mut self, index: u32) -> &mut Monitor {
        &mut self.monitors[index as usize]
    }
}
