use crate::{
    CpuId, Priority,
    thread::{StackRegion, ThreadState},
};

/// Errors of the thread and scheduling API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    #[error("stack region too small for an initial frame")]
    InvalidStackSize,
    #[error("priority {0} out of range")]
    InvalidPriority(Priority),
    #[error("cpu {0} does not exist")]
    InvalidCpu(CpuId),
    #[error("no free thread slot")]
    NoFreeSlot,
    #[error("stale thread handle")]
    StaleHandle,
    #[error("operation not allowed in state {0:?}")]
    InvalidState(ThreadState),
    #[error("thread has not been switched out yet")]
    StillRunning,
}

impl ThreadError {
    /// Returns `true` for errors caused by a malformed request rather than
    /// by the current state of the system.
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidStackSize | Self::InvalidPriority(_) | Self::InvalidCpu(_)
        )
    }
}

/// Errors of the inter-processor interrupt transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IpiError {
    #[error("doorbell already holds an unconsumed message")]
    Busy,
    #[error("cpu {0} does not exist")]
    InvalidCpu(CpuId),
    #[error("cpu {0} is not online")]
    Offline(CpuId),
}

/// Returned by [`Kernel::create_thread()`](crate::Kernel::create_thread).
///
/// Hands the stack region back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("cannot create thread: {kind}")]
pub struct SpawnError {
    kind: ThreadError,
    stack: StackRegion,
}

impl SpawnError {
    pub(crate) fn new(kind: ThreadError, stack: StackRegion) -> Self {
        Self { kind, stack }
    }

    #[must_use]
    pub fn kind(&self) -> ThreadError {
        self.kind
    }

    #[must_use]
    pub fn into_stack(self) -> StackRegion {
        self.stack
    }
}

impl From<SpawnError> for ThreadError {
    fn from(err: SpawnError) -> Self {
        err.kind
    }
}
