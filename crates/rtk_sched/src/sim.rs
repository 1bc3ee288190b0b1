//! Deterministic multi-core simulation on host threads.
//!
//! Every simulated core is a [`host::with_cpu`] scope. Doorbell lines and
//! local switch requests are latched per core and delivered by [`deliver()`]
//! or [`pump()`] unless the core is masked, which stands in for a core
//! running with interrupts disabled.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use irq_spin::host::{self, HostInterrupts};
use rtk_params::{MAX_CPUS, MIN_STACK_SIZE};

use crate::{
    CpuId, Kernel, KernelConfig, StackRegion,
    bringup::BringupRecord,
    platform::{FrameInit, InterruptFrame, Platform, UserEntry},
};

pub const THREAD_ENTRY: usize = 0x8000_1000;
pub const THREAD_EXIT: usize = 0x8000_2000;
pub const SECONDARY_TRAMPOLINE: usize = 0x8000_3000;
pub const VECTOR_BASE: usize = 0x8000_4000;

pub const STATUS_IRQ_ENABLE: usize = 1 << 0;
pub const STATUS_USER: usize = 1 << 1;

/// Saved context of the simulated architecture.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimFrame {
    pub pc: usize,
    pub status: usize,
    pub ra: usize,
    pub a: [usize; 4],
}

impl InterruptFrame for SimFrame {
    fn new_thread(init: &FrameInit) -> Self {
        let mut status = STATUS_IRQ_ENABLE;
        if init.user_mode {
            status |= STATUS_USER;
        }
        Self {
            pc: init.pc,
            status,
            ra: init.exit_handler,
            a: init.args,
        }
    }
}

pub type SimKernel = Kernel<SimPlatform>;

#[derive(Debug)]
pub struct SimPlatform {
    lines: [AtomicBool; MAX_CPUS],
    local: [AtomicBool; MAX_CPUS],
    masked: [AtomicBool; MAX_CPUS],
    armed: [AtomicBool; MAX_CPUS],
    raised: [AtomicUsize; MAX_CPUS],
    power_ups: [AtomicUsize; MAX_CPUS],
    restored: [AtomicUsize; MAX_CPUS],
    flushes: AtomicUsize,
    user_entries: Mutex<Vec<UserEntry>>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lines: [const { AtomicBool::new(false) }; MAX_CPUS],
            local: [const { AtomicBool::new(false) }; MAX_CPUS],
            masked: [const { AtomicBool::new(false) }; MAX_CPUS],
            armed: [const { AtomicBool::new(false) }; MAX_CPUS],
            raised: [const { AtomicUsize::new(0) }; MAX_CPUS],
            power_ups: [const { AtomicUsize::new(0) }; MAX_CPUS],
            restored: [const { AtomicUsize::new(0) }; MAX_CPUS],
            flushes: AtomicUsize::new(0),
            user_entries: Mutex::new(Vec::new()),
        }
    }

    /// Stops delivery to `cpu`; raised lines stay latched.
    pub fn mask(&self, cpu: CpuId) {
        self.masked[cpu].store(true, Ordering::SeqCst);
    }

    pub fn unmask(&self, cpu: CpuId) {
        self.masked[cpu].store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_line_raised(&self, cpu: CpuId) -> bool {
        self.lines[cpu].load(Ordering::SeqCst)
    }

    /// Number of times the doorbell line of `cpu` was raised.
    #[must_use]
    pub fn raise_count(&self, cpu: CpuId) -> usize {
        self.raised[cpu].load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_armed(&self, cpu: CpuId) -> bool {
        self.armed[cpu].load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn power_up_count(&self, cpu: CpuId) -> usize {
        self.power_ups[cpu].load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Stack pointer returned by the last switch point run on `cpu`.
    #[must_use]
    pub fn last_restored(&self, cpu: CpuId) -> usize {
        self.restored[cpu].load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn user_entries(&self) -> Vec<UserEntry> {
        self.user_entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Blocks the calling host thread until `cpu` was asked to power up.
    pub fn wait_power_up(&self, cpu: CpuId) {
        while self.power_up_count(cpu) == 0 {
            thread::yield_now();
        }
    }

    fn take_pending(&self, cpu: CpuId) -> bool {
        if self.masked[cpu].load(Ordering::SeqCst) {
            return false;
        }
        let line = self.lines[cpu].swap(false, Ordering::SeqCst);
        let local = self.local[cpu].swap(false, Ordering::SeqCst);
        line || local
    }
}

impl Platform for SimPlatform {
    type Irq = HostInterrupts;
    type Frame = SimFrame;

    fn thread_entry(&self) -> usize {
        THREAD_ENTRY
    }

    fn thread_exit(&self) -> usize {
        THREAD_EXIT
    }

    fn raise_ipi(&self, cpu: CpuId) {
        self.raised[cpu].fetch_add(1, Ordering::SeqCst);
        self.lines[cpu].store(true, Ordering::SeqCst);
    }

    fn pend_local_switch(&self, cpu: CpuId) {
        self.local[cpu].store(true, Ordering::SeqCst);
    }

    fn arm_ipi(&self, cpu: CpuId) {
        self.armed[cpu].store(true, Ordering::SeqCst);
    }

    fn flush_dcache(&self, _addr: usize, _len: usize) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn vector_base(&self) -> usize {
        VECTOR_BASE
    }

    fn secondary_trampoline(&self) -> usize {
        SECONDARY_TRAMPOLINE
    }

    unsafe fn power_up(&self, cpu: CpuId, _record: &BringupRecord) {
        self.power_ups[cpu].fetch_add(1, Ordering::SeqCst);
    }

    fn enter_user(&self, entry: &UserEntry) {
        self.user_entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*entry);
    }
}

/// Leaks a zeroed stack region of `size` bytes.
#[must_use]
pub fn stack(size: usize) -> StackRegion {
    StackRegion::new(Box::leak(vec![0_u8; size].into_boxed_slice()))
}

/// Creates a kernel with `config.num_cpus` cores brought online through the
/// regular start-up handshake.
#[must_use]
pub fn boot(config: KernelConfig) -> Arc<SimKernel> {
    let kernel = Arc::new(Kernel::new(SimPlatform::new(), config));
    host::with_cpu(0, || kernel.init_primary());
    for cpu in 1..config.num_cpus {
        let firmware = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                kernel.platform().wait_power_up(cpu);
                host::with_cpu(cpu, || kernel.secondary_init(kernel.bringup_record()))
            })
        };
        host::with_cpu(0, || kernel.start_core(cpu, stack(MIN_STACK_SIZE * 4), None, 0))
            .unwrap_or_else(|err| panic!("cpu{cpu}: {err}"));
        let start = firmware
            .join()
            .unwrap_or_else(|_| panic!("cpu{cpu}: start-up panicked"));
        assert!(start.entry.is_none());
    }
    kernel
}

/// Services the latched interrupt of `cpu`, if any and not masked.
pub fn deliver(kernel: &SimKernel, cpu: CpuId) -> bool {
    if !kernel.is_core_active(cpu) || !kernel.platform().take_pending(cpu) {
        return false;
    }
    let sp = host::with_cpu(cpu, || kernel.switch_point(0));
    kernel.platform().restored[cpu].store(sp, Ordering::SeqCst);
    true
}

/// Delivers interrupts on all unmasked cores until none is pending.
///
/// Returns the number of deliveries.
///
/// # Panics
///
/// Panics if the cores keep interrupting each other.
pub fn pump(kernel: &SimKernel) -> usize {
    const MAX_ROUNDS: usize = 1_000;

    let mut delivered = 0;
    for _ in 0..MAX_ROUNDS {
        let mut any = false;
        for cpu in 0..kernel.config().num_cpus {
            if deliver(kernel, cpu) {
                any = true;
                delivered += 1;
            }
        }
        if !any {
            return delivered;
        }
    }
    panic!("interrupts did not settle");
}

/// Runs a timer interrupt on `cpu` unless it is masked.
pub fn tick(kernel: &SimKernel, cpu: CpuId) -> bool {
    if kernel.platform().masked[cpu].load(Ordering::SeqCst) {
        return false;
    }
    let sp = host::with_cpu(cpu, || {
        kernel.tick();
        kernel.switch_point(0)
    });
    kernel.platform().restored[cpu].store(sp, Ordering::SeqCst);
    true
}

/// Runs `f` as the thread currently installed on `cpu`.
pub fn on_cpu<T, F>(cpu: CpuId, f: F) -> T
where
    F: FnOnce() -> T,
{
    host::with_cpu(cpu, f)
}
