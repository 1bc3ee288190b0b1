//! Per-core scheduler state.

use core::{
    mem::MaybeUninit,
    ptr,
    sync::atomic::{AtomicU8, Ordering},
};

use irq_spin::{Interrupts, SpinLock};
use rtk_params::{IDLE_PRIORITY, MAX_CPUS};
use strum::FromRepr;

use crate::{CpuId, Priority, ready_queue::ReadyQueue, thread::ThreadId};

/// Life cycle of a core. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum CoreState {
    Offline = 0,
    Starting = 1,
    Online = 2,
}

/// Scheduling state of one core, guarded by the core's run queue lock.
#[derive(Debug)]
pub(crate) struct RunQueue {
    pub(crate) cpu: CpuId,
    pub(crate) ready: ReadyQueue,
    /// Thread installed as running; the idle thread if nothing else.
    pub(crate) current: ThreadId,
    pub(crate) idle: ThreadId,
    pub(crate) need_resched: bool,
    /// The running thread steps behind its equal-priority peers on the next
    /// pass.
    pub(crate) yield_pending: bool,
    pub(crate) slice_left: u32,
    pub(crate) ticks: u64,
}

impl RunQueue {
    pub(crate) const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            ready: ReadyQueue::new(),
            current: ThreadId::idle(cpu),
            idle: ThreadId::idle(cpu),
            need_resched: false,
            yield_pending: false,
            slice_left: 0,
            ticks: 0,
        }
    }
}

/// Builds the run queue array of all cores.
pub(crate) const fn run_queues<I>() -> [SpinLock<RunQueue, I>; MAX_CPUS]
where
    I: Interrupts,
{
    let mut rqs = [const { MaybeUninit::<SpinLock<RunQueue, I>>::uninit() }; MAX_CPUS];
    let mut cpu = 0;
    while cpu < MAX_CPUS {
        rqs[cpu] = MaybeUninit::new(SpinLock::new(RunQueue::new(cpu)));
        cpu += 1;
    }
    // every element was written above
    unsafe { ptr::read((&raw const rqs).cast::<[SpinLock<RunQueue, I>; MAX_CPUS]>()) }
}

const NO_FLOATING: Priority = Priority::MAX;

/// Lock-free view of a core read by other cores.
///
/// The hints are refreshed whenever the core's run queue lock is released
/// after a change; decisions based on them are re-validated under the lock.
#[derive(Debug)]
pub(crate) struct PerCpu {
    state: AtomicU8,
    /// Priority the core runs once its pending passes complete.
    effective: AtomicU8,
    /// Best priority among floating threads in the core's ready queue.
    floating: AtomicU8,
}

impl PerCpu {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(CoreState::Offline as u8),
            effective: AtomicU8::new(IDLE_PRIORITY),
            floating: AtomicU8::new(NO_FLOATING),
        }
    }

    pub(crate) fn state(&self) -> CoreState {
        CoreState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(CoreState::Offline)
    }

    pub(crate) fn set_online(&self) {
        self.state.store(CoreState::Online as u8, Ordering::Release);
    }

    /// Claims the Offline -> Starting transition.
    pub(crate) fn begin_start(&self) -> Result<(), CoreState> {
        self.state
            .compare_exchange(
                CoreState::Offline as u8,
                CoreState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(drop)
            .map_err(|state| CoreState::from_repr(state).unwrap_or(CoreState::Offline))
    }

    pub(crate) fn effective_priority(&self) -> Priority {
        self.effective.load(Ordering::Acquire)
    }

    /// Priority of the best floating ready thread, if any.
    pub(crate) fn floating_priority(&self) -> Option<Priority> {
        let prio = self.floating.load(Ordering::Acquire);
        (prio != NO_FLOATING).then_some(prio)
    }

    pub(crate) fn publish(&self, effective: Priority, floating: Option<Priority>) {
        self.effective.store(effective, Ordering::Release);
        self.floating
            .store(floating.unwrap_or(NO_FLOATING), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use irq_spin::host::HostInterrupts;

    use super::*;

    #[test]
    fn run_queues_know_their_cpu() {
        let rqs = run_queues::<HostInterrupts>();
        for (cpu, rq) in rqs.iter().enumerate() {
            let rq = rq.lock();
            assert_eq!(rq.cpu, cpu);
            assert_eq!(rq.current, rq.idle);
            assert_eq!(rq.idle.index(), cpu);
        }
    }

    #[test]
    fn core_starts_once() {
        let cpu = PerCpu::new();
        assert_eq!(cpu.state(), CoreState::Offline);
        assert_eq!(cpu.begin_start(), Ok(()));
        assert_eq!(cpu.begin_start(), Err(CoreState::Starting));
        cpu.set_online();
        assert_eq!(cpu.begin_start(), Err(CoreState::Online));
    }

    #[test]
    fn hints_round_trip() {
        let cpu = PerCpu::new();
        assert_eq!(cpu.floating_priority(), None);
        cpu.publish(4, Some(9));
        assert_eq!(cpu.effective_priority(), 4);
        assert_eq!(cpu.floating_priority(), Some(9));
    }
}
