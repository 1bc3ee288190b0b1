//! Reschedule passes and the context switch point.
//!
//! Every change of a core's running thread happens in
//! [`Kernel::switch_point()`], called on the way out of each interrupt with
//! the saved context of the interrupted thread. Everything else only marks a
//! core as needing a pass and makes sure the core takes an interrupt soon.

mod cascade;
mod lifecycle;

use core::{cmp, mem};

use irq_spin::{Interrupts, IrqGuard};
use log::trace;
use rtk_params::IDLE_PRIORITY;

use crate::{
    CpuId, Kernel, Priority,
    cpu::RunQueue,
    ipi::IpiMessage,
    platform::{Platform, UserEntry},
    ready_queue::ReadyEntry,
    thread::{SchedInfo, ThreadHandle, ThreadId, ThreadState},
};

impl<P> Kernel<P>
where
    P: Platform,
{
    /// Runs a reschedule pass if one is pending on the calling core and
    /// returns the stack pointer of the context to restore.
    ///
    /// `old_sp` points at the interrupted context. Must be called by the
    /// interrupt exit path only.
    pub fn switch_point(&self, old_sp: usize) -> usize {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();

        let requested = self.drain_doorbells(me);
        let needed = {
            let mut rq = self.rqs[me].lock();
            rq.need_resched |= requested;
            rq.need_resched
        };
        if !needed {
            return old_sp;
        }

        self.pull(me);

        let mut rq = self.rqs[me].lock();
        let (new_sp, user) = match self.pass(&mut rq) {
            Some((from, to)) => self.switch_contexts(&rq, from, to, old_sp),
            None => (old_sp, None),
        };
        self.publish(&rq);
        drop(rq);

        if let Some(entry) = user {
            self.platform.enter_user(&entry);
        }
        if self.config.ipi_cascade {
            self.cascade(me, me);
        }
        new_sp
    }

    /// Timer hook of the calling core: accounts the tick and requests a
    /// pass at the interrupt's switch point.
    pub fn tick(&self) {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        let mut rq = self.rqs[me].lock();
        rq.ticks += 1;
        rq.need_resched = true;
        let slice = self.config.time_slice_ticks;
        if slice > 0 && rq.current != rq.idle {
            rq.slice_left = rq.slice_left.saturating_sub(1);
            if rq.slice_left == 0 {
                rq.yield_pending = true;
                rq.slice_left = slice;
            }
        }
    }

    /// Moves the calling thread behind the ready threads of equal priority.
    pub fn yield_now(&self) {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        let mut rq = self.rqs[me].lock();
        if rq.current == rq.idle {
            return;
        }
        rq.yield_pending = true;
        self.request_resched(&mut rq, me);
    }

    /// Thread running on the calling core, idle thread included.
    pub fn current_thread(&self) -> ThreadHandle {
        let _irq = IrqGuard::<P::Irq>::new();
        let rq = self.rqs[P::Irq::cpu_id()].lock();
        self.threads.handle(rq.current)
    }

    /// Thread installed on `cpu`, or `None` if the core idles or is not
    /// online.
    pub fn running_on(&self, cpu: CpuId) -> Option<ThreadHandle> {
        if !self.is_core_active(cpu) {
            return None;
        }
        let rq = self.rqs[cpu].lock();
        (rq.current != rq.idle).then(|| self.threads.handle(rq.current))
    }

    /// Number of threads waiting in the ready queue of `cpu`.
    pub fn ready_len(&self, cpu: CpuId) -> usize {
        if cpu >= self.num_cpus() {
            return 0;
        }
        self.rqs[cpu].lock().ready.len()
    }

    /// Ticks accounted on `cpu`.
    pub fn ticks(&self, cpu: CpuId) -> u64 {
        if cpu >= self.num_cpus() {
            return 0;
        }
        self.rqs[cpu].lock().ticks
    }

    /// Picks the thread to run on `rq`'s core.
    ///
    /// Returns the outgoing and incoming threads if they differ.
    fn pass(&self, rq: &mut RunQueue) -> Option<(ThreadId, ThreadId)> {
        let yielding = mem::take(&mut rq.yield_pending);
        rq.need_resched = false;

        let cur = rq.current;
        let mut cur_info = self.threads.info(cur, rq);
        if cur == rq.idle {
            cur_info.state = ThreadState::Ready;
        } else if cur_info.state == ThreadState::Running {
            let keep = rq.ready.peek().is_none_or(|best| {
                if yielding {
                    best.priority > cur_info.priority
                } else {
                    best.priority >= cur_info.priority
                }
            });
            if keep {
                return None;
            }
            // preempted: behind its equal-priority peers
            cur_info.state = ThreadState::Ready;
            cur_info.seq = self.next_seq();
            rq.ready.insert(ReadyEntry {
                id: cur,
                priority: cur_info.priority,
                seq: cur_info.seq,
                pinned: cur_info.affinity.pinned().is_some(),
            });
        }

        let next = rq.ready.pop().map_or(rq.idle, |entry| entry.id);
        if next == cur {
            cur_info.state = ThreadState::Running;
            self.threads.set_info(cur, rq, cur_info);
            return None;
        }
        self.threads.set_info(cur, rq, cur_info);

        let mut next_info = self.threads.info(next, rq);
        debug_assert!(next_info.affinity.allows(rq.cpu));
        next_info.state = ThreadState::Running;
        self.threads.set_info(next, rq, next_info);
        rq.current = next;
        rq.slice_left = self.config.time_slice_ticks;
        Some((cur, next))
    }

    fn switch_contexts(
        &self,
        rq: &RunQueue,
        from: ThreadId,
        to: ThreadId,
        old_sp: usize,
    ) -> (usize, Option<UserEntry>) {
        let mut from_info = self.threads.info(from, rq);
        from_info.saved_sp = old_sp;
        self.threads.set_info(from, rq, from_info);

        let mut to_info = self.threads.info(to, rq);
        let first_run = mem::replace(&mut to_info.first_run, false);
        self.threads.set_info(to, rq, to_info);

        trace!("cpu{}: switch {from:?} -> {to:?}", rq.cpu);
        let user = (first_run && to_info.is_user()).then(|| UserEntry {
            thread: self.threads.handle(to),
            cpu: rq.cpu,
            stack_base: to_info.stack_base,
            stack_size: to_info.stack_size,
            sp: to_info.saved_sp,
        });
        (to_info.saved_sp, user)
    }

    /// Priority of the thread `rq`'s core keeps running if no pass happens,
    /// counting a thread that left the running state as gone.
    fn running_priority(&self, rq: &RunQueue) -> Priority {
        if rq.current == rq.idle {
            return IDLE_PRIORITY;
        }
        let info = self.threads.info(rq.current, rq);
        if info.state == ThreadState::Running {
            info.priority
        } else {
            IDLE_PRIORITY
        }
    }

    /// Priority of the thread `rq`'s core runs once pending passes complete.
    pub(crate) fn effective_priority(&self, rq: &RunQueue) -> Priority {
        let running = self.running_priority(rq);
        rq.ready
            .peek()
            .map_or(running, |best| cmp::min(running, best.priority))
    }

    /// Refreshes the lock-free hints of `rq`'s core.
    pub(crate) fn publish(&self, rq: &RunQueue) {
        let floating = rq.ready.best_floating().map(|entry| entry.priority);
        self.cpu(rq.cpu)
            .publish(self.effective_priority(rq), floating);
    }

    /// Marks `rq`'s core as needing a pass and makes it take an interrupt.
    ///
    /// Called with `rq` locked, so the request reaches the core before any
    /// later change of the queue does.
    pub(crate) fn request_resched(&self, rq: &mut RunQueue, me: CpuId) {
        rq.need_resched = true;
        if rq.cpu == me {
            self.platform.pend_local_switch(me);
        } else if let Err(err) = self.send_ipi(me, rq.cpu, IpiMessage::RESCHEDULE) {
            trace!("cpu{me}: reschedule of cpu{} not sent: {err}", rq.cpu);
        }
    }

    /// Queues `id` on `rq` as Ready, requesting a pass if it outranks the
    /// running thread.
    pub(crate) fn enqueue(&self, id: ThreadId, mut info: SchedInfo, rq: &mut RunQueue, me: CpuId) {
        debug_assert!(info.affinity.allows(rq.cpu));
        info.state = ThreadState::Ready;
        info.seq = self.next_seq();
        self.threads.set_info(id, rq, info);
        rq.ready.insert(ReadyEntry {
            id,
            priority: info.priority,
            seq: info.seq,
            pinned: info.affinity.pinned().is_some(),
        });
        if info.priority < self.running_priority(rq) {
            self.request_resched(rq, me);
        }
        self.publish(rq);
    }

    /// Chooses the core a thread becoming Ready is queued on.
    ///
    /// A floating thread goes to the online core running the least important
    /// thread that it outranks, preferring the calling core, then its current
    /// home on ties.
    fn placement(&self, info: &SchedInfo, me: CpuId, home: CpuId) -> CpuId {
        if let Some(cpu) = info.affinity.pinned() {
            return cpu;
        }
        let mut best: Option<(Priority, CpuId)> = None;
        for cpu in [me, home].into_iter().chain(0..self.num_cpus()) {
            if !self.is_core_active(cpu) {
                continue;
            }
            let effective = self.cpu(cpu).effective_priority();
            if info.priority < effective && best.is_none_or(|(prio, _)| effective > prio) {
                best = Some((effective, cpu));
            }
        }
        match best {
            Some((_, cpu)) => cpu,
            None if self.is_core_active(me) => me,
            None => home,
        }
    }
}
