//! Architecture and board services the scheduler depends on.

use irq_spin::Interrupts;

use crate::{CpuId, bringup::BringupRecord, thread::ThreadHandle};

/// Values encoded into the synthetic frame of a new thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInit {
    /// Where the restore path resumes: the thread-entry trampoline.
    pub pc: usize,
    /// Return address of the trampoline.
    pub exit_handler: usize,
    /// Argument registers: the entry function, then its three arguments.
    pub args: [usize; 4],
    pub user_mode: bool,
}

/// Saved register context as laid out by the interrupt entry path.
pub trait InterruptFrame: Sized {
    /// Builds a frame that the context-restore path cannot tell apart from
    /// one saved on a real interrupt, with interrupts enabled after restore.
    fn new_thread(init: &FrameInit) -> Self;
}

/// Passed to [`Platform::enter_user()`] before a user thread first runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    pub thread: ThreadHandle,
    pub cpu: CpuId,
    pub stack_base: usize,
    pub stack_size: usize,
    pub sp: usize,
}

pub trait Platform: Sync {
    type Irq: Interrupts;
    type Frame: InterruptFrame;

    /// Address of the thread-entry trampoline.
    fn thread_entry(&self) -> usize;

    /// Address the trampoline returns to once the entry function returns.
    fn thread_exit(&self) -> usize;

    /// Asserts the doorbell interrupt line of `cpu`.
    fn raise_ipi(&self, cpu: CpuId);

    /// Requests an interrupt-exit switch point on the calling core `cpu`.
    fn pend_local_switch(&self, cpu: CpuId);

    /// Enables delivery of reschedule requests on the calling core `cpu`.
    fn arm_ipi(&self, cpu: CpuId);

    /// Writes back the data cache lines covering `addr..addr + len`.
    fn flush_dcache(&self, addr: usize, len: usize);

    /// Interrupt vector base installed on a starting core.
    fn vector_base(&self) -> usize;

    /// First instruction a starting core executes.
    fn secondary_trampoline(&self) -> usize;

    /// Asks the firmware or power controller to start `cpu`.
    ///
    /// # Safety
    ///
    /// `record` must stay valid and unmodified until the core sets its
    /// `alive` flag.
    unsafe fn power_up(&self, cpu: CpuId, record: &BringupRecord);

    /// Configures privilege and memory protection for a user thread about
    /// to run for the first time on the calling core.
    fn enter_user(&self, entry: &UserEntry);
}
