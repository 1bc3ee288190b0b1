//! Hart start-up.

use core::{
    arch::asm,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use irq_spin::Interrupts as _;
use rtk_sched::{BringupRecord, Kernel, SecondaryStart};

use crate::{
    interrupts::{self, RiscvInterrupts},
    platform::RiscvPlatform,
    trap,
};

pub type RtKernel = Kernel<RiscvPlatform>;

static KERNEL: AtomicPtr<RtKernel> = AtomicPtr::new(ptr::null_mut());

/// Returns the kernel installed by [`init_primary()`].
///
/// # Panics
///
/// Panics if no kernel has been installed.
#[must_use]
pub fn kernel() -> &'static RtKernel {
    let kernel = KERNEL.load(Ordering::Acquire);
    assert!(!kernel.is_null(), "kernel not installed");
    unsafe { &*kernel }
}

/// Makes the calling hart the primary core of `kernel`.
///
/// Interrupts stay masked; the caller becomes the hart's idle thread and
/// unmasks them once it has started the other cores and threads.
///
/// # Safety
///
/// Must be called once, on hart `hartid`, before any other hart is started.
pub unsafe fn init_primary(kernel: &'static RtKernel, hartid: usize) {
    RiscvInterrupts::disable();
    KERNEL.store(ptr::from_ref(kernel).cast_mut(), Ordering::Release);
    unsafe { interrupts::set_cpu_id(hartid) };
    trap::init_hart(trap::vector_addr());
    interrupts::enable_soft();
    kernel.init_primary();
}

/// Idles the calling hart until the next interrupt, forever.
pub fn idle() -> ! {
    loop {
        unsafe { asm!("wfi") };
    }
}

/// Called by `rtk_secondary_entry` on the hart's interrupt stack.
pub(crate) extern "C" fn secondary_main(hartid: usize, record: usize) -> ! {
    let record = unsafe { &*ptr::with_exposed_provenance::<BringupRecord>(record) };
    // the initiator may reuse the record once this hart is alive
    let params = record.params();
    debug_assert_eq!(params.target, hartid);

    trap::init_hart(params.vector_base);
    let start = kernel().secondary_init(record);
    unsafe {
        asm!(
            "mv sp, {stack_top}",
            "jr {run_core}",
            stack_top = in(reg) params.stack_top,
            run_core = in(reg) run_core as usize,
            in("a0") ptr::from_ref(&start),
            options(noreturn),
        );
    }
}

/// First code on the stack handed to `start_core`, which becomes the stack
/// of the hart's idle thread.
extern "C" fn run_core(start: *const SecondaryStart) -> ! {
    // copied before interrupts can reuse the interrupt stack it lives on
    let SecondaryStart { entry, arg } = unsafe { *start };
    RiscvInterrupts::enable();
    match entry {
        Some(entry) => entry(arg),
        None => idle(),
    }
}
