//! The bytecode dispatch loop. One native thread drives all green threads
//! through an explicit trampoline: `run` picks a runnable thread, executes
//! its bytecode until it yields, blocks or dies, and goes back to the
//! scheduler.
//!
//! The machine registers (instruction pointer, executing method, cached
//! code block) live in one [`Machine`] struct. Before anything that can
//! allocate or switch threads (constant pool resolution, object
//! allocation, native calls, monitor operations, the reschedule itself)
//! the registers are flushed into the thread record (`park`) and reloaded
//! afterwards. The collector asserts that bracketing; skipping it would
//! corrupt the root set or the next thread's resumed state.

use std::sync::Arc;

use log::{debug, warn};

use crate::bytecode::{atype, i16_at, op, u16_at};
use crate::cache::{CacheContents, CodeLoc};
use crate::class::{
    AccessFlags, ClassId, ClassStatus, MethodBody, MethodId, PrimType,
};
use crate::errors::{Throw, VmResult};
use crate::header::GcKind;
use crate::heap::ARRAY_ELEMS;
use crate::pool::{self, MemberExpect, TAG_INTEGER, TAG_STRING};
use crate::scheduler;
use crate::stack::KILL_THREAD_IP;
use crate::threads::{ThreadId, ThreadState};
use crate::value::Value;
use crate::vm::{ThrowableKind, Vm};

/// Native-register-resident interpreter state: the single source of truth
/// while a thread runs, flushed to its thread record at every safepoint.
struct Machine {
    ip: usize,
    method: MethodId,
    code: Arc<[u8]>,
    /// pc of the opcode currently dispatching; dispatch sites and handler
    /// search key off it.
    op_pc: usize,
}

enum Flow {
    Continue,
    /// Registers are parked; control goes back to the scheduler.
    Yield,
    /// The entry frame returned; the thread is done.
    End,
}

enum AfterThrow {
    Caught,
    ThreadDead,
}

/// Drive every runnable thread to completion (or deadlock).
pub fn run(vm: &mut Vm) {
    while let Some(tid) = scheduler::pick_next(vm) {
        run_thread(vm, tid);
    }
}

fn run_thread(vm: &mut Vm, tid: ThreadId) {
    let mut m = restore(vm, tid);
    loop {
        match step(vm, &mut m, tid) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Yield) => {
                let site = CodeLoc {
                    method: m.method,
                    pc: m.ip as u32,
                };
                scheduler::reschedule(vm, tid, site);
                return;
            }
            Ok(Flow::End) => {
                finish_thread(vm, tid);
                return;
            }
            Err(throw) => match handle_throw(vm, &mut m, tid, throw) {
                AfterThrow::Caught => {}
                AfterThrow::ThreadDead => return,
            },
        }
    }
}

fn finish_thread(vm: &mut Vm, tid: ThreadId) {
    let t = vm.thread_mut(tid);
    t.state = ThreadState::Dead;
    t.parked = true;
    vm.current = None;
    debug!("thread {} finished", tid.0);
}

fn restore(vm: &mut Vm, tid: ThreadId) -> Machine {
    let t = vm.thread_mut(tid);
    t.parked = false;
    let ip = t.saved_ip;
    let method = t.stack.current_frame().method;
    Machine {
        ip,
        method,
        code: code_of(vm, method),
        op_pc: ip,
    }
}

fn code_of(vm: &Vm, method: MethodId) -> Arc<[u8]> {
    match &vm.classes.method(method).body {
        MethodBody::Code(block) => block.bytes.clone(),
        _ => panic!("active frame holds a non-bytecode method"),
    }
}

/// Flush the machine registers into the thread record. Everything that
/// can allocate or switch threads happens between `park` and `unpark`.
#[inline]
fn park(vm: &mut Vm, m: &Machine, tid: ThreadId) {
    let t = vm.thread_mut(tid);
    t.saved_ip = m.ip;
    t.parked = true;
}

#[inline]
fn unpark(vm: &mut Vm, tid: ThreadId) {
    vm.thread_mut(tid).parked = false;
}

/// Build a managed throwable with the registers safely parked.
fn raise(vm: &mut Vm, m: &Machine, tid: ThreadId, kind: ThrowableKind, msg: &str) -> Throw {
    park(vm, m, tid);
    let t = vm.throw(kind, msg);
    unpark(vm, tid);
    t
}

#[inline]
fn read_u16(m: &mut Machine) -> u16 {
    let v = u16_at(&m.code, m.ip);
    m.ip += 2;
    v
}

/// 32-bit wrap, the integer model of the bytecode set.
#[inline]
fn int32(v: i64) -> i64 {
    v as i32 as i64
}

/// Decrement the slice; park and yield at zero. Called at backward
/// branches and returns (or every opcode when configured so).
fn tick_yield(vm: &mut Vm, m: &Machine, tid: ThreadId) -> Flow {
    let t = vm.thread_mut(tid);
    if t.slice > 0 {
        t.slice -= 1;
        Flow::Continue
    } else {
        park(vm, m, tid);
        Flow::Yield
    }
}

fn step(vm: &mut Vm, m: &mut Machine, tid: ThreadId) -> VmResult<Flow> {
    m.op_pc = m.ip;

    if vm.config.check_every_instruction {
        let t = vm.thread_mut(tid);
        if t.slice == 0 {
            t.saved_ip = m.op_pc;
            t.parked = true;
            return Ok(Flow::Yield);
        }
        t.slice -= 1;
    }

    let mut opcode = m.code[m.ip];
    m.ip += 1;

    if opcode == op::BREAKPOINT {
        opcode = breakpoint_original(vm, m)?;
    }

    match opcode {
        op::NOP => Ok(Flow::Continue),
        op::ACONST_NULL => {
            vm.thread_mut(tid).stack.push_value(Value::null());
            Ok(Flow::Continue)
        }
        op::ICONST_M1..=op::ICONST_5 => {
            let v = opcode as i64 - op::ICONST_0 as i64;
            vm.thread_mut(tid).stack.push_value(Value::from_int(v));
            Ok(Flow::Continue)
        }
        op::BIPUSH => {
            let v = m.code[m.ip] as i8 as i64;
            m.ip += 1;
            vm.thread_mut(tid).stack.push_value(Value::from_int(v));
            Ok(Flow::Continue)
        }
        op::SIPUSH => {
            let v = i16_at(&m.code, m.ip) as i64;
            m.ip += 2;
            vm.thread_mut(tid).stack.push_value(Value::from_int(v));
            Ok(Flow::Continue)
        }
        op::LDC_W => {
            let index = read_u16(m);
            let class = m.method.class;
            match vm.classes.get(class).plain().pool.kind(index) {
                TAG_INTEGER => {
                    let v = pool::resolve_integer(vm, class, index);
                    vm.thread_mut(tid).stack.push_value(Value::from_int(v));
                }
                TAG_STRING => {
                    park(vm, m, tid);
                    let s = pool::resolve_string(vm, class, index);
                    unpark(vm, tid);
                    vm.thread_mut(tid).stack.push_value(s?);
                }
                other => panic!("ldc on unsupported pool tag {other}"),
            }
            Ok(Flow::Continue)
        }
        op::ILOAD | op::ALOAD => {
            let index = m.code[m.ip] as usize;
            m.ip += 1;
            let v = vm.thread(tid).stack.local(index);
            vm.thread_mut(tid).stack.push_value(v);
            Ok(Flow::Continue)
        }
        op::ISTORE | op::ASTORE => {
            let index = m.code[m.ip] as usize;
            m.ip += 1;
            let v = vm.thread_mut(tid).stack.pop_value();
            vm.thread_mut(tid).stack.set_local(index, v);
            Ok(Flow::Continue)
        }
        op::POP => {
            vm.thread_mut(tid).stack.pop_value();
            Ok(Flow::Continue)
        }
        op::DUP => {
            let v = vm.thread(tid).stack.peek_value(0);
            vm.thread_mut(tid).stack.push_value(v);
            Ok(Flow::Continue)
        }
        op::SWAP => {
            let stack = &mut vm.thread_mut(tid).stack;
            let a = stack.pop_value();
            let b = stack.pop_value();
            stack.push_value(a);
            stack.push_value(b);
            Ok(Flow::Continue)
        }
        op::IADD | op::ISUB | op::IMUL | op::ISHL | op::ISHR | op::IAND | op::IOR
        | op::IXOR => {
            let stack = &mut vm.thread_mut(tid).stack;
            let b = stack.pop_value().as_int();
            let a = stack.pop_value().as_int();
            let r = match opcode {
                op::IADD => int32(a.wrapping_add(b)),
                op::ISUB => int32(a.wrapping_sub(b)),
                op::IMUL => int32((a as i32).wrapping_mul(b as i32) as i64),
                op::ISHL => int32(((a as i32) << (b & 31)) as i64),
                op::ISHR => int32(((a as i32) >> (b & 31)) as i64),
                op::IAND => a & b,
                op::IOR => a | b,
                _ => a ^ b,
            };
            stack.push_value(Value::from_int(r));
            Ok(Flow::Continue)
        }
        op::IDIV | op::IREM => {
            let stack = &mut vm.thread_mut(tid).stack;
            let b = stack.pop_value().as_int();
            let a = stack.pop_value().as_int();
            if b == 0 {
                return Err(raise(vm, m, tid, ThrowableKind::Arithmetic, "/ by zero"));
            }
            let r = if opcode == op::IDIV {
                int32((a as i32).wrapping_div(b as i32) as i64)
            } else {
                int32((a as i32).wrapping_rem(b as i32) as i64)
            };
            vm.thread_mut(tid).stack.push_value(Value::from_int(r));
            Ok(Flow::Continue)
        }
        op::INEG => {
            let stack = &mut vm.thread_mut(tid).stack;
            let a = stack.pop_value().as_int();
            stack.push_value(Value::from_int(int32(a.wrapping_neg())));
            Ok(Flow::Continue)
        }
        op::IINC => {
            let index = m.code[m.ip] as usize;
            let delta = m.code[m.ip + 1] as i8 as i64;
            m.ip += 2;
            let stack = &mut vm.thread_mut(tid).stack;
            let v = int32(stack.local(index).as_int().wrapping_add(delta));
            stack.set_local(index, Value::from_int(v));
            Ok(Flow::Continue)
        }
        op::IFEQ..=op::IFLE => {
            let a = vm.thread_mut(tid).stack.pop_value().as_int();
            let taken = match opcode {
                op::IFEQ => a == 0,
                op::IFNE => a != 0,
                op::IFLT => a < 0,
                op::IFGE => a >= 0,
                op::IFGT => a > 0,
                _ => a <= 0,
            };
            Ok(branch(vm, m, tid, taken))
        }
        op::IF_ICMPEQ..=op::IF_ICMPLE => {
            let stack = &mut vm.thread_mut(tid).stack;
            let b = stack.pop_value().as_int();
            let a = stack.pop_value().as_int();
            let taken = match opcode {
                op::IF_ICMPEQ => a == b,
                op::IF_ICMPNE => a != b,
                op::IF_ICMPLT => a < b,
                op::IF_ICMPGE => a >= b,
                op::IF_ICMPGT => a > b,
                _ => a <= b,
            };
            Ok(branch(vm, m, tid, taken))
        }
        op::IF_ACMPEQ | op::IF_ACMPNE => {
            let stack = &mut vm.thread_mut(tid).stack;
            let b = stack.pop_value();
            let a = stack.pop_value();
            let taken = (a == b) == (opcode == op::IF_ACMPEQ);
            Ok(branch(vm, m, tid, taken))
        }
        op::IFNULL | op::IFNONNULL => {
            let a = vm.thread_mut(tid).stack.pop_value();
            let taken = a.is_null() == (opcode == op::IFNULL);
            Ok(branch(vm, m, tid, taken))
        }
        op::GOTO => Ok(branch(vm, m, tid, true)),
        op::IRETURN | op::ARETURN => {
            let v = vm.thread_mut(tid).stack.pop_value();
            do_return(vm, m, tid, Some(v))
        }
        op::RETURN => do_return(vm, m, tid, None),
        op::GETSTATIC | op::PUTSTATIC => do_static_field(vm, m, tid, opcode),
        op::GETFIELD | op::PUTFIELD => do_instance_field(vm, m, tid, opcode),
        op::INVOKEVIRTUAL | op::INVOKEINTERFACE => do_invoke_dispatched(vm, m, tid, opcode),
        op::INVOKESPECIAL => do_invoke_special(vm, m, tid),
        op::INVOKESTATIC => do_invoke_static(vm, m, tid),
        op::NEW => {
            let index = read_u16(m);
            park(vm, m, tid);
            let class = pool::resolve_class(vm, m.method.class, index);
            unpark(vm, tid);
            let class = class?;
            let c = vm.classes.get(class);
            if c.is_interface() || c.access.contains(AccessFlags::ABSTRACT) || c.is_array() {
                let name = vm.class_display_name(class);
                return Err(raise(vm, m, tid, ThrowableKind::Instantiation, &name));
            }
            match ensure_initialized(vm, m, tid, class)? {
                InitAction::Done => {}
                InitAction::Started => return Ok(Flow::Continue),
                InitAction::Blocked => return Ok(yield_retry(vm, m, tid)),
            }
            debug_assert!(vm.classes.instantiable(class, tid));
            park(vm, m, tid);
            let obj = vm.new_instance(class);
            unpark(vm, tid);
            vm.thread_mut(tid).stack.push_value(obj?);
            Ok(Flow::Continue)
        }
        op::NEWARRAY => {
            let code = m.code[m.ip];
            m.ip += 1;
            let prim = match code {
                atype::BOOLEAN => PrimType::Boolean,
                atype::CHAR => PrimType::Char,
                atype::BYTE => PrimType::Byte,
                atype::SHORT => PrimType::Short,
                atype::INT => PrimType::Int,
                atype::LONG => PrimType::Long,
                other => panic!("newarray with unknown element code {other}"),
            };
            let len = vm.thread_mut(tid).stack.pop_value().as_int();
            if len < 0 {
                let msg = len.to_string();
                return Err(raise(vm, m, tid, ThrowableKind::NegativeArraySize, &msg));
            }
            let class = vm.prim_array_class(prim);
            park(vm, m, tid);
            let arr = vm.new_array(class, len as u32);
            unpark(vm, tid);
            vm.thread_mut(tid).stack.push_value(arr?);
            Ok(Flow::Continue)
        }
        op::ANEWARRAY => {
            let index = read_u16(m);
            park(vm, m, tid);
            let element = pool::resolve_class(vm, m.method.class, index);
            unpark(vm, tid);
            let element = element?;
            let len = vm.thread_mut(tid).stack.pop_value().as_int();
            if len < 0 {
                let msg = len.to_string();
                return Err(raise(vm, m, tid, ThrowableKind::NegativeArraySize, &msg));
            }
            let class = vm
                .classes
                .array_class_of(crate::class::ElementKind::Class(element), &mut vm.symbols);
            park(vm, m, tid);
            let arr = vm.new_array(class, len as u32);
            unpark(vm, tid);
            vm.thread_mut(tid).stack.push_value(arr?);
            Ok(Flow::Continue)
        }
        op::ARRAYLENGTH => {
            let arr = vm.thread_mut(tid).stack.pop_value();
            let Some(r) = arr.as_ref() else {
                return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "arraylength"));
            };
            let len = vm.heap.array_length(r) as i64;
            vm.thread_mut(tid).stack.push_value(Value::from_int(len));
            Ok(Flow::Continue)
        }
        op::IALOAD | op::BALOAD | op::CALOAD | op::AALOAD => {
            let stack = &mut vm.thread_mut(tid).stack;
            let index = stack.pop_value().as_int();
            let arr = stack.pop_value();
            let r = check_array(vm, m, tid, arr, index)?;
            let cell = vm.heap.get(r, ARRAY_ELEMS + index as u32);
            let v = match opcode {
                op::AALOAD => Value::from_raw(cell),
                op::IALOAD => Value::from_int(cell as i32 as i64),
                op::BALOAD => Value::from_int(cell as i8 as i64),
                _ => Value::from_int(cell as u16 as i64),
            };
            vm.thread_mut(tid).stack.push_value(v);
            Ok(Flow::Continue)
        }
        op::IASTORE | op::BASTORE | op::CASTORE => {
            let stack = &mut vm.thread_mut(tid).stack;
            let v = stack.pop_value().as_int();
            let index = stack.pop_value().as_int();
            let arr = stack.pop_value();
            let r = check_array(vm, m, tid, arr, index)?;
            let cell = match opcode {
                op::IASTORE => v as i32 as u32 as u64,
                op::BASTORE => v as i8 as u8 as u64,
                _ => v as u16 as u64,
            };
            vm.heap.set(r, ARRAY_ELEMS + index as u32, cell);
            Ok(Flow::Continue)
        }
        op::AASTORE => {
            let stack = &mut vm.thread_mut(tid).stack;
            let v = stack.pop_value();
            let index = stack.pop_value().as_int();
            let arr = stack.pop_value();
            let r = check_array(vm, m, tid, arr, index)?;
            if !v.is_null() {
                let elem_class = match &vm.classes.get(vm.class_of(arr)).kind {
                    crate::class::ClassKind::Array(a) => match a.element {
                        crate::class::ElementKind::Class(c) => c,
                        crate::class::ElementKind::Prim(_) => {
                            panic!("aastore into a primitive array")
                        }
                    },
                    _ => panic!("aastore into a non-array"),
                };
                if !vm.classes.is_assignable(vm.class_of(v), elem_class) {
                    let msg = vm.class_display_name(vm.class_of(v));
                    return Err(raise(vm, m, tid, ThrowableKind::ArrayStore, &msg));
                }
            }
            vm.heap.set_value(r, ARRAY_ELEMS + index as u32, v);
            Ok(Flow::Continue)
        }
        op::ATHROW => {
            let exc = vm.thread_mut(tid).stack.pop_value();
            if exc.is_null() {
                return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "athrow null"));
            }
            Err(Throw(exc))
        }
        op::CHECKCAST => {
            let index = read_u16(m);
            park(vm, m, tid);
            let target = pool::resolve_class(vm, m.method.class, index);
            unpark(vm, tid);
            let target = target?;
            let v = vm.thread(tid).stack.peek_value(0);
            if !v.is_null() && !vm.classes.is_assignable(vm.class_of(v), target) {
                let msg = format!(
                    "{} is not a {}",
                    vm.class_display_name(vm.class_of(v)),
                    vm.class_display_name(target)
                );
                return Err(raise(vm, m, tid, ThrowableKind::ClassCast, &msg));
            }
            Ok(Flow::Continue)
        }
        op::INSTANCEOF => {
            let index = read_u16(m);
            park(vm, m, tid);
            let target = pool::resolve_class(vm, m.method.class, index);
            unpark(vm, tid);
            let target = target?;
            let v = vm.thread_mut(tid).stack.pop_value();
            let is = !v.is_null() && vm.classes.is_assignable(vm.class_of(v), target);
            vm.thread_mut(tid)
                .stack
                .push_value(Value::from_int(is as i64));
            Ok(Flow::Continue)
        }
        op::MONITORENTER => {
            let obj = vm.thread_mut(tid).stack.pop_value();
            if obj.is_null() {
                return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "monitorenter"));
            }
            if vm.monitor_enter(obj, tid) {
                Ok(Flow::Continue)
            } else {
                vm.thread_mut(tid).stack.push_value(obj);
                Ok(blocked_retry(vm, m, tid))
            }
        }
        op::MONITOREXIT => {
            let obj = vm.thread_mut(tid).stack.pop_value();
            if obj.is_null() {
                return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "monitorexit"));
            }
            park(vm, m, tid);
            let result = vm.monitor_exit(obj, tid);
            unpark(vm, tid);
            result?;
            Ok(Flow::Continue)
        }
        other => panic!(
            "unimplemented opcode {other:#04x} at {:?}:{}",
            m.method, m.op_pc
        ),
    }
}

/// Taken/untaken conditional branch. Backward takes decrement the slice
/// and may yield with the registers already parked at the target.
fn branch(vm: &mut Vm, m: &mut Machine, tid: ThreadId, taken: bool) -> Flow {
    let offset = i16_at(&m.code, m.ip) as isize;
    m.ip += 2;
    if !taken {
        return Flow::Continue;
    }
    let target = (m.op_pc as isize + offset) as usize;
    let backward = target <= m.op_pc;
    m.ip = target;
    if backward && !vm.config.check_every_instruction {
        return tick_yield(vm, m, tid);
    }
    Flow::Continue
}

/// A blocked monitor acquisition: re-execute the instruction once woken.
fn blocked_retry(vm: &mut Vm, m: &Machine, tid: ThreadId) -> Flow {
    let t = vm.thread_mut(tid);
    t.state = ThreadState::Waiting;
    t.saved_ip = m.op_pc;
    t.parked = true;
    Flow::Yield
}

/// Another thread owns the work (a running `<clinit>`): stay runnable,
/// yield, and re-execute the instruction next slice.
fn yield_retry(vm: &mut Vm, m: &Machine, tid: ThreadId) -> Flow {
    let t = vm.thread_mut(tid);
    t.saved_ip = m.op_pc;
    t.parked = true;
    Flow::Yield
}

fn breakpoint_original(vm: &mut Vm, m: &Machine) -> VmResult<u8> {
    let site = CodeLoc {
        method: m.method,
        pc: m.op_pc as u32,
    };
    let mut hook = vm.debug.take();
    let original = hook
        .as_mut()
        .and_then(|h| h.breakpoint_opcode(site));
    vm.debug = hook;
    match original {
        Some(opcode) => Ok(opcode),
        None => panic!("breakpoint opcode with no debugger attached at {site:?}"),
    }
}

// --- class initialization ---

enum InitAction {
    Done,
    /// `<clinit>` frames were pushed; the machine now sits in the
    /// innermost one and the triggering instruction re-executes later.
    Started,
    /// Another thread is mid-initialization; retry after a yield.
    Blocked,
}

fn ensure_initialized(
    vm: &mut Vm,
    m: &mut Machine,
    tid: ThreadId,
    class: ClassId,
) -> VmResult<InitAction> {
    match vm.classes.get(class).status {
        ClassStatus::Ready => return Ok(InitAction::Done),
        ClassStatus::Error => {
            let name = vm.class_display_name(class);
            return Err(raise(vm, m, tid, ThrowableKind::NoClassDefFound, &name));
        }
        ClassStatus::Verified => {}
        other => panic!("initialization of class in status {other:?}"),
    }
    match vm.classes.get(class).plain().initializing {
        Some(owner) if owner == tid => return Ok(InitAction::Done),
        Some(_) => return Ok(InitAction::Blocked),
        None => {}
    }

    // Collect the uninitialized chain, subclass first.
    let clinit_name = vm.symbols.intern("<clinit>");
    let clinit_sig = vm.symbols.intern("()V");
    let mut chain = Vec::new();
    let mut at = Some(class);
    while let Some(id) = at {
        let c = vm.classes.get(id);
        if c.status != ClassStatus::Verified {
            break;
        }
        let plain = c.plain();
        if plain.initializing.is_some() {
            break;
        }
        chain.push(id);
        at = plain.super_class;
    }

    let mut pushed = false;
    for &id in &chain {
        let clinit = vm
            .classes
            .get(id)
            .plain()
            .methods
            .iter()
            .position(|mm| mm.name == clinit_name && mm.sig == clinit_sig);
        match clinit {
            None => {
                // Nothing to run; the class is ready the moment its
                // supers are.
                vm.classes.advance_status(id, ClassStatus::Ready);
            }
            Some(index) => {
                vm.classes.get_mut(id).plain_mut().initializing = Some(tid);
                let mid = MethodId {
                    class: id,
                    index: index as u16,
                };
                let method = vm.classes.method(mid).clone();
                // First frame pushed resumes at the trigger; deeper
                // (super) frames resume at the start of the frame below.
                let resume = if pushed { 0 } else { m.op_pc };
                vm.thread_mut(tid).stack.push_frame(
                    mid,
                    &method,
                    &[],
                    m.op_pc,
                    resume,
                    None,
                    Some(id),
                );
                pushed = true;
                debug!("running <clinit> of {}", vm.class_display_name(id));
            }
        }
    }

    if !pushed {
        return Ok(InitAction::Done);
    }
    // Switch the machine into the innermost (most-super) initializer.
    let frame_method = vm.thread(tid).stack.current_frame().method;
    m.method = frame_method;
    m.code = code_of(vm, frame_method);
    m.ip = 0;
    Ok(InitAction::Started)
}

// --- field access ---

fn do_static_field(vm: &mut Vm, m: &mut Machine, tid: ThreadId, opcode: u8) -> VmResult<Flow> {
    let index = read_u16(m);
    let site = CodeLoc {
        method: m.method,
        pc: m.op_pc as u32,
    };
    let fid = match vm.cache.lookup(site).map(|e| e.contents) {
        Some(CacheContents::StaticField(f)) => f,
        Some(_) => panic!("inline cache kind mismatch at {site:?}"),
        None => {
            park(vm, m, tid);
            let f = pool::resolve_field(vm, m.method.class, index, true);
            unpark(vm, tid);
            let f = f?;
            vm.cache
                .create(CacheContents::StaticField(f), site, (opcode, index));
            f
        }
    };
    match ensure_initialized(vm, m, tid, fid.class)? {
        InitAction::Done => {}
        InitAction::Started => return Ok(Flow::Continue),
        InitAction::Blocked => return Ok(yield_retry(vm, m, tid)),
    }
    let (class, slot) = vm.static_slot(fid);
    if opcode == op::GETSTATIC {
        let v = vm.classes.get(class).plain().statics[slot];
        vm.thread_mut(tid).stack.push_value(v);
    } else {
        let v = vm.thread_mut(tid).stack.pop_value();
        vm.classes.get_mut(class).plain_mut().statics[slot] = v;
    }
    Ok(Flow::Continue)
}

fn do_instance_field(vm: &mut Vm, m: &mut Machine, tid: ThreadId, opcode: u8) -> VmResult<Flow> {
    let index = read_u16(m);
    let site = CodeLoc {
        method: m.method,
        pc: m.op_pc as u32,
    };
    let fid = match vm.cache.lookup(site).map(|e| e.contents) {
        Some(CacheContents::InstanceField(f)) => f,
        Some(_) => panic!("inline cache kind mismatch at {site:?}"),
        None => {
            park(vm, m, tid);
            let f = pool::resolve_field(vm, m.method.class, index, false);
            unpark(vm, tid);
            let f = f?;
            vm.cache
                .create(CacheContents::InstanceField(f), site, (opcode, index));
            f
        }
    };
    let cell = vm.field_cell(fid);
    if opcode == op::GETFIELD {
        let obj = vm.thread_mut(tid).stack.pop_value();
        let Some(r) = obj.as_ref() else {
            return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "getfield"));
        };
        let v = vm.heap.value_at(r, cell);
        vm.thread_mut(tid).stack.push_value(v);
    } else {
        let stack = &mut vm.thread_mut(tid).stack;
        let v = stack.pop_value();
        let obj = stack.pop_value();
        let Some(r) = obj.as_ref() else {
            return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "putfield"));
        };
        vm.heap.set_value(r, cell, v);
    }
    Ok(Flow::Continue)
}

// --- invokes ---

fn do_invoke_static(vm: &mut Vm, m: &mut Machine, tid: ThreadId) -> VmResult<Flow> {
    let index = read_u16(m);
    let site = CodeLoc {
        method: m.method,
        pc: m.op_pc as u32,
    };
    let target = match vm.cache.lookup(site).map(|e| e.contents) {
        Some(CacheContents::StaticMethod(t)) => t,
        Some(_) => panic!("inline cache kind mismatch at {site:?}"),
        None => {
            park(vm, m, tid);
            let t = pool::resolve_method(
                vm,
                m.method.class,
                index,
                MemberExpect::Method { is_static: true },
            );
            unpark(vm, tid);
            let t = t?;
            vm.cache
                .create(CacheContents::StaticMethod(t), site, (op::INVOKESTATIC, index));
            t
        }
    };
    match ensure_initialized(vm, m, tid, target.class)? {
        InitAction::Done => {}
        InitAction::Started => return Ok(Flow::Continue),
        InitAction::Blocked => return Ok(yield_retry(vm, m, tid)),
    }
    call_method(vm, m, tid, target)
}

fn do_invoke_special(vm: &mut Vm, m: &mut Machine, tid: ThreadId) -> VmResult<Flow> {
    let index = read_u16(m);
    let site = CodeLoc {
        method: m.method,
        pc: m.op_pc as u32,
    };
    let target = match vm.cache.lookup(site).map(|e| e.contents) {
        Some(CacheContents::SpecialMethod(t)) => t,
        Some(_) => panic!("inline cache kind mismatch at {site:?}"),
        None => {
            park(vm, m, tid);
            let t = pool::resolve_method(
                vm,
                m.method.class,
                index,
                MemberExpect::Method { is_static: false },
            );
            unpark(vm, tid);
            let t = t?;
            vm.cache.create(
                CacheContents::SpecialMethod(t),
                site,
                (op::INVOKESPECIAL, index),
            );
            t
        }
    };
    let nargs = vm.classes.method(target).arg_cells as usize;
    let receiver = vm.thread(tid).stack.peek_value(nargs - 1);
    if receiver.is_null() {
        return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "invokespecial"));
    }
    call_method(vm, m, tid, target)
}

/// invokevirtual / invokeinterface: resolve statically, then dispatch on
/// the receiver's class, with a monomorphic inline-cache fast path.
fn do_invoke_dispatched(
    vm: &mut Vm,
    m: &mut Machine,
    tid: ThreadId,
    opcode: u8,
) -> VmResult<Flow> {
    let index = read_u16(m);
    let site = CodeLoc {
        method: m.method,
        pc: m.op_pc as u32,
    };

    if let Some(CacheContents::VirtualMethod { expected, target }) =
        vm.cache.lookup(site).map(|e| e.contents)
    {
        let nargs = vm.classes.method(target).arg_cells as usize;
        let receiver = vm.thread(tid).stack.peek_value(nargs - 1);
        if receiver.is_null() {
            return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "invoke on null"));
        }
        if vm.class_of(receiver) == expected {
            return call_method(vm, m, tid, target);
        }
        // Receiver class changed: fall through and repatch.
    }

    park(vm, m, tid);
    let expect = if opcode == op::INVOKEINTERFACE {
        MemberExpect::InterfaceMethod
    } else {
        MemberExpect::Method { is_static: false }
    };
    let declared = pool::resolve_method(vm, m.method.class, index, expect);
    unpark(vm, tid);
    let declared = declared?;

    let nargs = vm.classes.method(declared).arg_cells as usize;
    let receiver = vm.thread(tid).stack.peek_value(nargs - 1);
    if receiver.is_null() {
        return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "invoke on null"));
    }
    let receiver_class = vm.class_of(receiver);
    let dm = vm.classes.method(declared);
    let (name, sig) = (dm.name, dm.sig);
    let target = if opcode == op::INVOKEINTERFACE {
        vm.classes.find_interface_method(receiver_class, name, sig)
    } else {
        vm.classes.find_method(receiver_class, name, sig)
    };
    let Some(target) = target else {
        let msg = vm.symbols.resolve(name).to_owned();
        return Err(raise(vm, m, tid, ThrowableKind::NoSuchMethod, &msg));
    };
    vm.cache.create(
        CacheContents::VirtualMethod {
            expected: receiver_class,
            target,
        },
        site,
        (opcode, index),
    );
    call_method(vm, m, tid, target)
}

fn call_method(vm: &mut Vm, m: &mut Machine, tid: ThreadId, target: MethodId) -> VmResult<Flow> {
    let method = vm.classes.method(target).clone();
    let nargs = method.arg_cells as usize;
    match &method.body {
        MethodBody::Native => {
            let Some(f) = vm.lookup_native(target) else {
                let msg = vm.symbols.resolve(method.name).to_owned();
                return Err(raise(vm, m, tid, ThrowableKind::UnsatisfiedLink, &msg));
            };
            // The callee owns the operand stack while the registers sit
            // parked in the thread record.
            park(vm, m, tid);
            f(vm, tid);
            unpark(vm, tid);
            if let Some(pending) = vm.thread_mut(tid).pending_exception.take() {
                return Err(Throw(pending));
            }
            Ok(Flow::Continue)
        }
        MethodBody::Abstract => {
            let msg = vm.symbols.resolve(method.name).to_owned();
            Err(raise(vm, m, tid, ThrowableKind::NoSuchMethod, &msg))
        }
        MethodBody::Code(block) => {
            let args = vm.thread_mut(tid).stack.pop_slice(nargs);
            let sync_object = if method.is_synchronized() && !method.is_static() {
                let receiver = args[0];
                if !vm.monitor_enter(receiver, tid) {
                    // Blocked: restore the arguments and retry the whole
                    // invoke once the monitor owner wakes us.
                    vm.thread_mut(tid).stack.push_slice(&args);
                    return Ok(blocked_retry(vm, m, tid));
                }
                Some(receiver)
            } else {
                None
            };
            vm.thread_mut(tid).stack.push_frame(
                target,
                &method,
                &args,
                m.op_pc,
                m.op_pc + 3,
                sync_object,
                None,
            );
            m.method = target;
            m.ip = 0;
            m.code = block.bytes.clone();
            Ok(Flow::Continue)
        }
    }
}

/// Pop the innermost frame and resume the caller. Reloads the machine's
/// method, and with it the constant-pool register, from the method being
/// returned into; pools are per-class and never cached across calls.
fn do_return(vm: &mut Vm, m: &mut Machine, tid: ThreadId, value: Option<Value>) -> VmResult<Flow> {
    let popped = vm.thread_mut(tid).stack.pop_frame();
    if let Some(sync) = popped.sync_object {
        park(vm, m, tid);
        let result = vm.monitor_exit(sync, tid);
        unpark(vm, tid);
        result?;
    }
    if let Some(class) = popped.clinit_of {
        vm.classes.get_mut(class).plain_mut().initializing = None;
        vm.classes.advance_status(class, ClassStatus::Ready);
        debug!("{} is ready", vm.class_display_name(class));
    }
    if popped.resume_ip == KILL_THREAD_IP {
        return Ok(Flow::End);
    }
    let caller = vm.thread(tid).stack.current_frame().method;
    m.method = caller;
    m.code = code_of(vm, caller);
    m.ip = popped.resume_ip;
    if let Some(v) = value {
        vm.thread_mut(tid).stack.push_value(v);
    }
    Ok(tick_yield(vm, m, tid))
}

// --- exception dispatch ---

/// Walk handler tables innermost-out. The thrown value rides in the
/// thread's pending-exception slot so the collector sees (and may move)
/// it mid-search.
fn handle_throw(vm: &mut Vm, m: &mut Machine, tid: ThreadId, throw: Throw) -> AfterThrow {
    let throw_class = vm.class_of(throw.0);
    vm.thread_mut(tid).pending_exception = Some(throw.0);
    let mut pc = m.op_pc;
    loop {
        let frame = vm.thread(tid).stack.current_frame().clone();
        let handlers = match &vm.classes.method(frame.method).body {
            MethodBody::Code(block) => block.handlers.clone(),
            _ => unreachable!("active frame holds a non-bytecode method"),
        };
        for h in handlers.iter() {
            if pc < h.start_pc as usize || pc >= h.end_pc as usize {
                continue;
            }
            let matched = if h.class_index == 0 {
                // The wildcard "any" entry.
                true
            } else {
                park(vm, m, tid);
                let resolved = pool::resolve_class(vm, frame.method.class, h.class_index);
                unpark(vm, tid);
                match resolved {
                    Ok(handler_class) => vm.classes.is_assignable(throw_class, handler_class),
                    Err(_) => {
                        debug!("handler class {} failed to resolve", h.class_index);
                        false
                    }
                }
            };
            if matched {
                let exc = vm
                    .thread_mut(tid)
                    .pending_exception
                    .take()
                    .expect("pending exception vanished");
                let stack = &mut vm.thread_mut(tid).stack;
                stack.clear_operands();
                stack.push_value(exc);
                m.method = frame.method;
                m.code = code_of(vm, frame.method);
                m.ip = h.target as usize;
                return AfterThrow::Caught;
            }
        }

        // No handler here: unwind one frame.
        let popped = vm.thread_mut(tid).stack.pop_frame();
        if let Some(sync) = popped.sync_object {
            park(vm, m, tid);
            if vm.monitor_exit(sync, tid).is_err() {
                warn!("monitor exit failed during unwind");
            }
            unpark(vm, tid);
        }
        if let Some(class) = popped.clinit_of {
            // A failed initializer poisons the class.
            vm.classes.get_mut(class).plain_mut().initializing = None;
            vm.classes.advance_status(class, ClassStatus::Error);
            warn!("initializer of {} failed", vm.class_display_name(class));
        }
        if popped.resume_ip == KILL_THREAD_IP {
            let exc = vm.thread_mut(tid).pending_exception.take();
            let detail = exc
                .and_then(|e| vm.throwable_message(e))
                .unwrap_or_default();
            warn!(
                "uncaught {} in thread {}: {detail}",
                vm.class_display_name(throw_class),
                tid.0
            );
            finish_thread(vm, tid);
            return AfterThrow::ThreadDead;
        }
        pc = popped.saved_ip;
    }
}

fn check_array(
    vm: &mut Vm,
    m: &Machine,
    tid: ThreadId,
    arr: Value,
    index: i64,
) -> VmResult<crate::value::HeapRef> {
    let Some(r) = arr.as_ref() else {
        return Err(raise(vm, m, tid, ThrowableKind::NullPointer, "array access"));
    };
    let len = vm.heap.array_length(r) as i64;
    if index < 0 || index >= len {
        let msg = format!("index {index} out of bounds for length {len}");
        return Err(raise(vm, m, tid, ThrowableKind::ArrayIndex, &msg));
    }
    debug_assert_ne!(vm.heap.object_kind(r), GcKind::Instance);
    Ok(r)
}
