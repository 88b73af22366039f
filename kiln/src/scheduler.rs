//! Cooperative scheduling of green threads. Exactly one thread executes
//! bytecode at a time; switches happen only at reschedule points the
//! interpreter reaches deliberately (slice exhaustion at backward branches
//! and returns, monitor blocking, thread death). A reschedule polls host
//! events and the debugger's single-step hook before the next thread runs.

use log::{debug, error};

use crate::cache::CodeLoc;
use crate::threads::{ThreadId, ThreadState};
use crate::vm::Vm;

/// Pick the next runnable thread, making it current and refilling its
/// time slice. `None` means no thread can run: all dead, or a deadlock.
pub fn pick_next(vm: &mut Vm) -> Option<ThreadId> {
    while let Some(tid) = vm.runnable.pop_front() {
        if vm.thread(tid).state == ThreadState::Runnable {
            vm.current = Some(tid);
            let slice = vm.config.slice_len;
            vm.thread_mut(tid).slice = slice;
            return Some(tid);
        }
    }
    vm.current = None;
    if vm.threads.iter().any(|t| t.state == ThreadState::Waiting) {
        error!("scheduler: every live thread is blocked on a monitor");
    }
    None
}

/// Reschedule point for the thread that just yielded. Its registers are
/// already flushed into the thread record.
pub fn reschedule(vm: &mut Vm, tid: ThreadId, site: CodeLoc) {
    debug_assert!(vm.thread(tid).parked, "reschedule with live registers");
    vm.platform.poll_events();
    if let Some(mut hook) = vm.debug.take() {
        hook.single_step(tid, site);
        vm.debug = Some(hook);
    }
    if vm.thread(tid).state == ThreadState::Runnable {
        vm.runnable.push_back(tid);
    } else {
        debug!("thread {} off the run queue: {:?}", tid.0, vm.thread(tid).state);
    }
    vm.current = None;
}
