use core::sync::atomic::{AtomicU64, Ordering};

use irq_spin::SpinLock;
use rtk_params::MAX_CPUS;

use crate::{
    CpuId,
    bringup::Bringup,
    config::KernelConfig,
    cpu::{self, PerCpu, RunQueue},
    ipi::Doorbells,
    platform::Platform,
    thread::ThreadTable,
};

/// Scheduler, doorbells and bring-up state shared by all cores.
///
/// Created once, typically in a `static`, and never torn down.
pub struct Kernel<P>
where
    P: Platform,
{
    pub(crate) platform: P,
    pub(crate) config: KernelConfig,
    pub(crate) rqs: [SpinLock<RunQueue, P::Irq>; MAX_CPUS],
    pub(crate) cpus: [PerCpu; MAX_CPUS],
    pub(crate) threads: ThreadTable,
    pub(crate) doorbells: Doorbells<P::Irq>,
    pub(crate) bringup: Bringup<P::Irq>,
    seq: AtomicU64,
}

impl<P> Kernel<P>
where
    P: Platform,
{
    pub const fn new(platform: P, config: KernelConfig) -> Self {
        Self {
            platform,
            config,
            rqs: cpu::run_queues(),
            cpus: [const { PerCpu::new() }; MAX_CPUS],
            threads: ThreadTable::new(),
            doorbells: Doorbells::new(),
            bringup: Bringup::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub(crate) fn num_cpus(&self) -> usize {
        self.config.num_cpus
    }

    pub(crate) fn cpu(&self, cpu: CpuId) -> &PerCpu {
        &self.cpus[cpu]
    }

    /// Next FIFO stamp for the ready queues.
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}
