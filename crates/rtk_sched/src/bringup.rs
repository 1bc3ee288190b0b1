//! Secondary core start-up handshake.

use core::{
    cell::UnsafeCell,
    hint, mem, ptr,
    sync::atomic::{self, AtomicBool, Ordering},
};

use irq_spin::{Interrupts, IrqGuard, SpinLock};
use log::{debug, info};
use rtk_params::{MIN_STACK_SIZE, THREAD_ARGS};

use crate::{
    CpuId, Kernel,
    cpu::CoreState,
    error::ThreadError,
    ipi::{IpiMessage, IpiTag},
    platform::Platform,
    thread::StackRegion,
};

/// Function a started core runs once it has joined the scheduler.
pub type CoreEntry = fn(usize) -> !;

#[derive(Debug, Clone, Copy)]
pub struct BringupParams {
    pub initiator: CpuId,
    pub target: CpuId,
    pub trampoline: usize,
    pub vector_base: usize,
    pub stack_top: usize,
    pub entry: Option<CoreEntry>,
    pub args: [usize; THREAD_ARGS],
}

impl BringupParams {
    const EMPTY: Self = Self {
        initiator: 0,
        target: 0,
        trampoline: 0,
        vector_base: 0,
        stack_top: 0,
        entry: None,
        args: [0; THREAD_ARGS],
    };
}

/// Parameters handed from the starting core to the started one.
///
/// Written by the initiator before the target is powered up, read-only while
/// the target starts, and released when the target sets `alive`.
pub struct BringupRecord {
    params: UnsafeCell<BringupParams>,
    alive: AtomicBool,
}

// `params` is written only by the holder of the bring-up lock, before the
// target core is started.
unsafe impl Sync for BringupRecord {}

impl BringupRecord {
    const fn new() -> Self {
        Self {
            params: UnsafeCell::new(BringupParams::EMPTY),
            alive: AtomicBool::new(false),
        }
    }

    /// Parameters of the start-up in progress.
    #[must_use]
    pub fn params(&self) -> BringupParams {
        unsafe { *self.params.get() }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Address passed to the platform start request.
    #[must_use]
    pub fn addr(&self) -> usize {
        ptr::from_ref(self).addr()
    }

    /// # Safety
    ///
    /// The caller holds the bring-up lock and no core is reading the record.
    unsafe fn write(&self, params: BringupParams) {
        self.alive.store(false, Ordering::Relaxed);
        unsafe { *self.params.get() = params }
    }
}

pub(crate) struct Bringup<I> {
    /// Serializes start-ups. Held for the whole handshake.
    lock: SpinLock<(), I>,
    record: BringupRecord,
}

impl<I> Bringup<I>
where
    I: Interrupts,
{
    pub(crate) const fn new() -> Self {
        Self {
            lock: SpinLock::new(()),
            record: BringupRecord::new(),
        }
    }
}

/// What a started core does after [`Kernel::secondary_init()`].
#[derive(Debug, Clone, Copy)]
pub struct SecondaryStart {
    /// `None` means the core idles.
    pub entry: Option<CoreEntry>,
    pub arg: usize,
}

impl<P> Kernel<P>
where
    P: Platform,
{
    /// Brings the calling core online with its idle thread.
    ///
    /// The caller's context becomes the idle thread.
    pub fn init_primary(&self) {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        assert!(me < self.num_cpus(), "boot cpu {me} out of range");
        if self.cpu(me).begin_start().is_err() {
            return;
        }
        self.install_idle(me);
        self.cpu(me).set_online();
        info!("cpu{me}: online (primary)");
    }

    pub fn core_state(&self, cpu: CpuId) -> CoreState {
        if cpu >= self.num_cpus() {
            return CoreState::Offline;
        }
        self.cpu(cpu).state()
    }

    pub fn is_core_active(&self, cpu: CpuId) -> bool {
        self.core_state(cpu) == CoreState::Online
    }

    pub fn bringup_record(&self) -> &BringupRecord {
        &self.bringup.record
    }

    /// Starts `cpu` on `stack` and waits until it has joined the scheduler.
    ///
    /// `stack` stays in use by the core for good. Does nothing if the core
    /// is already online or being started.
    ///
    /// # Panics
    ///
    /// Panics if the core does not report alive within the configured
    /// number of polls.
    pub fn start_core(
        &self,
        cpu: CpuId,
        stack: StackRegion,
        entry: Option<CoreEntry>,
        arg: usize,
    ) -> Result<(), ThreadError> {
        if cpu >= self.num_cpus() {
            return Err(ThreadError::InvalidCpu(cpu));
        }
        let state = self.cpu(cpu).state();
        if state != CoreState::Offline {
            debug!("cpu{cpu}: start ignored, already {state:?}");
            return Ok(());
        }
        if stack.size() < MIN_STACK_SIZE {
            return Err(ThreadError::InvalidStackSize);
        }
        if let Err(state) = self.cpu(cpu).begin_start() {
            debug!("cpu{cpu}: start ignored, already {state:?}");
            return Ok(());
        }

        let _guard = self.bringup.lock.lock();
        let me = P::Irq::cpu_id();
        let record = &self.bringup.record;
        unsafe {
            record.write(BringupParams {
                initiator: me,
                target: cpu,
                trampoline: self.platform.secondary_trampoline(),
                vector_base: self.platform.vector_base(),
                stack_top: stack.top(),
                entry,
                args: [arg, 0, 0],
            });
        }
        atomic::fence(Ordering::Release);
        self.platform
            .flush_dcache(record.addr(), mem::size_of::<BringupRecord>());

        if let Err(err) = self
            .doorbells
            .post(me, cpu, IpiMessage::power_up(record.addr()))
        {
            debug!("cpu{cpu}: power-up doorbell not posted: {err}");
        }
        debug!("cpu{me}: starting cpu{cpu}");
        unsafe { self.platform.power_up(cpu, record) };

        let mut polls = 0;
        while !record.is_alive() {
            assert!(
                polls < self.config.bringup_spin_limit,
                "cpu{cpu} did not come online"
            );
            polls += 1;
            hint::spin_loop();
        }
        Ok(())
    }

    /// Joins the calling core to the scheduler. Runs on the started core,
    /// with interrupts masked, on the stack named by `record`.
    ///
    /// # Panics
    ///
    /// Panics if `record` was written for another core.
    pub fn secondary_init(&self, record: &BringupRecord) -> SecondaryStart {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        let params = record.params();
        assert_eq!(params.target, me, "bring-up record for another cpu");

        self.install_idle(me);
        self.doorbells.clear(params.initiator, me, IpiTag::PowerUp);
        if self.config.arm_ipi_on_bringup {
            self.platform.arm_ipi(me);
        }
        self.cpu(me).set_online();
        {
            // the first pass takes threads pinned here before the core came
            // up, and pulls floating ones waiting elsewhere
            let mut rq = self.rqs[me].lock();
            self.request_resched(&mut rq, me);
        }
        info!("cpu{me}: online");

        record.alive.store(true, Ordering::Release);
        SecondaryStart {
            entry: params.entry,
            arg: params.args[0],
        }
    }

    fn install_idle(&self, cpu: CpuId) {
        let rq = self.rqs[cpu].lock();
        self.threads.install_idle(&rq);
        self.publish(&rq);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use irq_spin::host;
    use rtk_params::MIN_STACK_SIZE;

    use super::*;
    use crate::{
        KernelConfig, ThreadOptions,
        error::IpiError,
        sim::{self, SimPlatform},
    };

    fn park(_: usize) -> ! {
        loop {
            thread::park();
        }
    }

    fn noop(_: usize, _: usize, _: usize) {}

    #[test]
    fn second_start_is_a_no_op() {
        let kernel = sim::boot(KernelConfig::new(2));
        assert!(kernel.is_core_active(1));
        assert_eq!(kernel.platform().power_up_count(1), 1);
        assert_eq!(kernel.platform().flush_count(), 1);
        assert!(kernel.platform().is_armed(1));

        let res = host::with_cpu(0, || {
            kernel.start_core(1, sim::stack(MIN_STACK_SIZE), None, 0)
        });
        assert_eq!(res, Ok(()));
        // the stack is not looked at once the core is up
        let res = host::with_cpu(0, || kernel.start_core(1, sim::stack(16), None, 0));
        assert_eq!(res, Ok(()));
        assert_eq!(kernel.platform().power_up_count(1), 1);
        assert_eq!(kernel.platform().flush_count(), 1);
        assert!(!kernel.ipi_pending(0, 1));
        assert_eq!(kernel.core_state(1), CoreState::Online);
    }

    #[test]
    fn record_carries_start_parameters() {
        let kernel = Arc::new(Kernel::new(SimPlatform::new(), KernelConfig::new(2)));
        host::with_cpu(0, || kernel.init_primary());
        assert_eq!(kernel.core_state(1), CoreState::Offline);

        let stack = sim::stack(MIN_STACK_SIZE * 2);
        let stack_top = stack.top();
        let firmware = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                kernel.platform().wait_power_up(1);
                let record = kernel.bringup_record();
                let params = record.params();
                assert!(!record.is_alive());
                assert_eq!(kernel.core_state(1), CoreState::Starting);
                assert!(kernel.ipi_pending(0, 1));
                let start = host::with_cpu(1, || kernel.secondary_init(record));
                (params, start)
            })
        };
        host::with_cpu(0, || kernel.start_core(1, stack, Some(park), 42)).unwrap();
        let (params, start) = firmware.join().unwrap();

        assert_eq!(params.initiator, 0);
        assert_eq!(params.target, 1);
        assert_eq!(params.trampoline, sim::SECONDARY_TRAMPOLINE);
        assert_eq!(params.vector_base, sim::VECTOR_BASE);
        assert_eq!(params.stack_top, stack_top);
        assert_eq!(params.args[0], 42);
        assert!(start.entry.is_some());
        assert_eq!(start.arg, 42);

        assert!(kernel.bringup_record().is_alive());
        assert!(kernel.is_core_active(1));
        // power-up message was acknowledged by the started core
        assert!(!kernel.ipi_pending(0, 1));
    }

    #[test]
    #[should_panic(expected = "did not come online")]
    fn start_times_out_without_firmware() {
        let kernel = Kernel::new(
            SimPlatform::new(),
            KernelConfig::new(2).with_bringup_spin_limit(1_000),
        );
        host::with_cpu(0, || {
            kernel.init_primary();
            let _ = kernel.start_core(1, sim::stack(MIN_STACK_SIZE), None, 0);
        });
    }

    #[test]
    fn start_rejects_bad_arguments() {
        let kernel = Kernel::new(SimPlatform::new(), KernelConfig::new(2));
        host::with_cpu(0, || {
            kernel.init_primary();
            assert_eq!(
                kernel.start_core(2, sim::stack(MIN_STACK_SIZE), None, 0),
                Err(ThreadError::InvalidCpu(2))
            );
            assert_eq!(
                kernel.start_core(1, sim::stack(16), None, 0),
                Err(ThreadError::InvalidStackSize)
            );
        });
        assert_eq!(kernel.core_state(1), CoreState::Offline);
        assert_eq!(kernel.platform().power_up_count(1), 0);
    }

    #[test]
    fn offline_core_runs_its_threads_once_started() {
        let kernel = Arc::new(Kernel::new(SimPlatform::new(), KernelConfig::new(2)));
        host::with_cpu(0, || kernel.init_primary());

        let t = host::with_cpu(0, || {
            assert_eq!(
                kernel.send_reschedule_ipi(1),
                Err(IpiError::Offline(1))
            );
            kernel.create_thread(
                sim::stack(MIN_STACK_SIZE * 2),
                noop,
                [0; 3],
                ThreadOptions::new(4).pinned(1),
            )
        })
        .unwrap();
        sim::pump(&kernel);
        assert_eq!(kernel.ready_len(1), 1);
        assert_eq!(kernel.running_on(1), None);
        assert_eq!(kernel.running_on(0), None);

        let firmware = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                kernel.platform().wait_power_up(1);
                host::with_cpu(1, || kernel.secondary_init(kernel.bringup_record()))
            })
        };
        host::with_cpu(0, || kernel.start_core(1, sim::stack(MIN_STACK_SIZE), None, 0))
            .unwrap();
        firmware.join().unwrap();

        sim::pump(&kernel);
        assert_eq!(kernel.running_on(1), Some(t));
    }

    #[test]
    fn started_core_pulls_floating_threads() {
        let kernel = Arc::new(Kernel::new(SimPlatform::new(), KernelConfig::new(2)));
        host::with_cpu(0, || kernel.init_primary());

        let (hi, lo) = host::with_cpu(0, || {
            let hi = kernel.create_thread(
                sim::stack(MIN_STACK_SIZE * 2),
                noop,
                [0; 3],
                ThreadOptions::new(3),
            );
            let lo = kernel.create_thread(
                sim::stack(MIN_STACK_SIZE * 2),
                noop,
                [0; 3],
                ThreadOptions::new(5),
            );
            (hi.unwrap(), lo.unwrap())
        });
        sim::pump(&kernel);
        assert_eq!(kernel.running_on(0), Some(hi));
        assert_eq!(kernel.ready_len(0), 1);

        let firmware = {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                kernel.platform().wait_power_up(1);
                host::with_cpu(1, || kernel.secondary_init(kernel.bringup_record()))
            })
        };
        host::with_cpu(0, || kernel.start_core(1, sim::stack(MIN_STACK_SIZE), None, 0))
            .unwrap();
        firmware.join().unwrap();

        sim::pump(&kernel);
        assert_eq!(kernel.running_on(0), Some(hi));
        assert_eq!(kernel.running_on(1), Some(lo));
        assert_eq!(kernel.ready_len(0), 0);
    }
}
