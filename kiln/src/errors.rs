//! Error tiers. Host-level failures (loading, configuration) are `VmError`;
//! managed exceptions travel as [`Throw`] carrying a heap reference and
//! unwind through handler search. Broken engine invariants (reentrant
//! collection, root overflow, frame corruption) panic and never return.

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("class image ended unexpectedly")]
    UnexpectedEndOfStream,
    #[error("unsupported constant pool tag {0}")]
    UnsupportedPoolTag(u8),
    #[error("malformed class image: {0}")]
    MalformedImage(&'static str),
    #[error("class {0} is already loaded")]
    DuplicateClass(String),
    #[error("superclass {0} could not be loaded")]
    MissingSuperclass(String),
    #[error("circular superclass chain through {0}")]
    CircularSuperclass(String),
    #[error("method {name}{sig} needs {cells} cells, stack chunks hold {limit}")]
    FrameTooLarge {
        name: String,
        sig: String,
        cells: usize,
        limit: usize,
    },
    #[error("verification of {class} failed: {reason}")]
    Verify { class: String, reason: String },
    #[error("no runnable entry point {0}")]
    MissingEntryPoint(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A managed exception in flight: a reference to a throwable instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Throw(pub Value);

pub type VmResult<T> = Result<T, Throw>;
