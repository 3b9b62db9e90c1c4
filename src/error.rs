use thiserror::Error;

/// Caller contract violations.
///
/// These never corrupt the kernel object they are detected on; the call is
/// rejected and the object is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MTInvalid
{
    /// Unlock attempted by a thread that does not own the mutex.
    #[error("calling thread does not own the mutex")]
    NotOwner,
    /// Free of a block that is not currently allocated (includes double free).
    #[error("block is not currently allocated")]
    NotAllocated,
    /// Free of a pointer outside the allocator region or off a block boundary.
    #[error("pointer does not belong to this allocator")]
    ForeignPointer,
    /// Cancel of a work item whose handler is already executing.
    #[error("work item is already running")]
    Running,
    /// Teardown of an allocator that still has live blocks.
    #[error("allocator still has live blocks")]
    InUse,
    /// A thread tried to join itself.
    #[error("thread cannot join itself")]
    SelfJoin
}

/// Error type returned by every fallible kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MTError
{
    /// Heap or slab exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// The deadline of a blocking call expired first.
    #[error("timed out")]
    TimedOut,
    /// A `NoWait` call found its condition unsatisfiable.
    #[error("operation would block")]
    WouldBlock,
    /// The caller broke the object's contract.
    #[error("invalid state: {0}")]
    InvalidState(#[from] MTInvalid)
}

/// Result alias for kernel operations.
pub type MTResult<T> = Result<T, MTError>;
