//! Boundaries to the excluded collaborators: the class-file byte reader,
//! the verifier, native method binding, platform services, the debugger's
//! two extension points, and the asynchronous native I/O control blocks
//! the collector quiesces before moving memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cache::CodeLoc;
use crate::class::ClassId;
use crate::errors::VmError;
use crate::threads::ThreadId;
use crate::vm::Vm;

/// Sequential access to a structurally valid class image. Magic/version
/// screening happened before the stream got here.
pub trait ClassFileStream {
    fn read_u8(&mut self) -> Result<u8, VmError>;
    fn read_u16(&mut self) -> Result<u16, VmError>;
    fn read_u32(&mut self) -> Result<u32, VmError>;
    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, VmError>;
}

/// In-memory stream over a byte slice.
pub struct ByteStream<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> ByteStream<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VmError> {
        if self.at + n > self.bytes.len() {
            return Err(VmError::UnexpectedEndOfStream);
        }
        let out = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }
}

impl ClassFileStream for ByteStream<'_> {
    fn read_u8(&mut self) -> Result<u8, VmError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, VmError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, VmError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, VmError> {
        Ok(self.take(n)?.to_vec())
    }
}

/// Where resolution finds images for classes it has not seen. Optional;
/// without one, unresolved classes stay unresolved.
pub trait ClassImageProvider {
    fn open(&self, name: &str) -> Option<Vec<u8>>;
}

/// Bytecode verification happens exactly once per class, between Linked
/// and Verified. Failure reverts the class to raw.
pub trait Verifier {
    fn verify(&self, vm: &Vm, class: ClassId) -> Result<(), String>;
}

/// Accepts everything; the structural verifier lives outside this engine.
pub struct PermissiveVerifier;

impl Verifier for PermissiveVerifier {
    fn verify(&self, _vm: &Vm, _class: ClassId) -> Result<(), String> {
        Ok(())
    }
}

/// Injected host primitives. The engine never talks to the OS directly.
pub trait Platform {
    fn current_time_millis(&self) -> u64;
    fn yield_native(&self);
    /// Polled at reschedule points; host event pumps hang off this.
    fn poll_events(&self) {}
}

pub struct HostPlatform;

impl Platform for HostPlatform {
    fn current_time_millis(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn yield_native(&self) {
        std::thread::yield_now();
    }
}

/// The debugger's two extension points. Everything else about the wire
/// protocol lives outside the engine.
pub trait DebugHook {
    /// A breakpoint pseudo-opcode was hit; return the original opcode to
    /// execute in its place.
    fn breakpoint_opcode(&mut self, site: CodeLoc) -> Option<u8>;
    /// Called at every reschedule point.
    fn single_step(&mut self, _thread: ThreadId, _site: CodeLoc) {}
}

/// Native method entry. Natives read and write the operand stack of the
/// current thread directly, allocate under the temporary-root protocol,
/// and report exceptions by setting the thread's pending-exception slot.
pub type NativeFn = fn(&mut Vm, ThreadId);

/// The fixed pool of I/O control blocks backing asynchronous native I/O.
/// The free list is the one structure shared with host I/O threads, kept
/// behind a short critical section; `in_flight` is what the collector's
/// quiesce step waits on.
#[derive(Debug)]
pub struct IoControlBlocks {
    free: Mutex<Vec<u8>>,
    in_flight: AtomicUsize,
}

impl IoControlBlocks {
    pub fn new(count: u8) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..count).collect()),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Prolog of an asynchronous native section. `None` when every control
    /// block is busy; the caller yields and retries.
    pub fn begin(self: &Arc<Self>) -> Option<IoSession> {
        let slot = self.free.lock().pop()?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(IoSession {
            pool: Arc::clone(self),
            slot,
        })
    }
}

/// Epilog guard: dropping it returns the control block and lets a pending
/// collection proceed.
pub struct IoSession {
    pool: Arc<IoControlBlocks>,
    slot: u8,
}

impl IoSession {
    pub fn slot(&self) -> u8 {
        self.slot
    }
}

impl Drop for IoSession {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.slot);
        self.pool.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
