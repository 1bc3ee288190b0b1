use core::arch::asm;

use log::{trace, warn};
use rtk_sched::{BringupRecord, CpuId, Platform, UserEntry};

use crate::{
    frame::TrapFrame,
    interrupts::{self, RiscvInterrupts},
    kernel, sbi, trap,
};

/// Supervisor-mode RISC-V under an SBI firmware. Core ids are hart ids.
#[derive(Debug, Default)]
pub struct RiscvPlatform;

impl RiscvPlatform {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Where a thread returns to once its entry function returns.
///
/// A user thread returning here faults on its first privileged
/// instruction, and the trap handler ends it the same way.
extern "C" fn thread_exit() -> ! {
    kernel().exit_current();
    // the pending switch point never comes back here
    crate::idle()
}

impl Platform for RiscvPlatform {
    type Irq = RiscvInterrupts;
    type Frame = TrapFrame;

    fn thread_entry(&self) -> usize {
        trap::thread_trampoline_addr()
    }

    fn thread_exit(&self) -> usize {
        thread_exit as usize
    }

    fn raise_ipi(&self, cpu: CpuId) {
        if let Err(err) = sbi::send_ipi(cpu) {
            warn!("hart{cpu}: send_ipi failed: {err}");
        }
    }

    fn pend_local_switch(&self, _cpu: CpuId) {
        interrupts::pend_soft();
    }

    fn arm_ipi(&self, _cpu: CpuId) {
        interrupts::enable_soft();
    }

    fn flush_dcache(&self, _addr: usize, _len: usize) {
        // caches are coherent; order the record before the start request
        unsafe { asm!("fence rw, rw") };
    }

    fn vector_base(&self) -> usize {
        trap::vector_addr()
    }

    fn secondary_trampoline(&self) -> usize {
        trap::secondary_entry_addr()
    }

    unsafe fn power_up(&self, cpu: CpuId, record: &BringupRecord) {
        let start = record.params().trampoline;
        if let Err(err) = sbi::hart_start(cpu, start, record.addr()) {
            warn!(
                "hart{cpu}: hart_start failed: {err} (status {:?})",
                sbi::hart_status(cpu)
            );
        }
    }

    fn enter_user(&self, entry: &UserEntry) {
        trace!(
            "hart{}: {} enters user mode, stack {:#x}..{:#x}",
            entry.cpu,
            entry.thread,
            entry.stack_base,
            entry.stack_base + entry.stack_size
        );
        // user code may have been written through the data cache
        unsafe { asm!("fence.i") };
    }
}
