//! Thread creation, state transitions and reclamation.

use irq_spin::{Interrupts, IrqGuard, SpinLockGuard, lock_pair};
use log::{debug, trace};
use rtk_params::{LOWEST_THREAD_PRIORITY, THREAD_ARGS};

use crate::{
    CpuId, Kernel, Priority, bootstrap,
    cpu::RunQueue,
    error::{SpawnError, ThreadError},
    platform::{FrameInit, Platform},
    thread::{
        Affinity, SchedInfo, StackRegion, ThreadEntry, ThreadFlags, ThreadHandle, ThreadId,
        ThreadOptions, ThreadState,
    },
};

impl<P> Kernel<P>
where
    P: Platform,
{
    /// Creates a thread running `entry(args[0], args[1], args[2])` on
    /// `stack`.
    ///
    /// The thread is queued Ready unless `options` has
    /// [`ThreadFlags::START_SUSPENDED`]. On error the stack is handed back
    /// inside the [`SpawnError`].
    pub fn create_thread(
        &self,
        stack: StackRegion,
        entry: ThreadEntry,
        args: [usize; THREAD_ARGS],
        options: ThreadOptions,
    ) -> Result<ThreadHandle, SpawnError> {
        if let Err(err) = self.check_options(&options) {
            return Err(SpawnError::new(err, stack));
        }

        let user_mode = options.flags.contains(ThreadFlags::USER);
        let init = FrameInit {
            pc: self.platform.thread_entry(),
            exit_handler: self.platform.thread_exit(),
            args: [entry as usize, args[0], args[1], args[2]],
            user_mode,
        };
        let sp = match bootstrap::write_initial_frame::<P::Frame>(&stack, &init) {
            Ok(sp) => sp,
            Err(err) => return Err(SpawnError::new(err, stack)),
        };
        let Some(id) = self.threads.allocate() else {
            return Err(SpawnError::new(ThreadError::NoFreeSlot, stack));
        };

        let info = SchedInfo {
            // not runnable until queued below
            state: ThreadState::Suspended,
            priority: options.priority,
            affinity: options.affinity,
            flags: options.flags,
            seq: 0,
            saved_sp: sp,
            first_run: true,
            stack_base: stack.base(),
            stack_size: stack.size(),
        };

        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        let home = options.affinity.pinned().unwrap_or(me);
        let handle = {
            let rq = self.rqs[home].lock();
            self.threads.install(id, &rq, info, Some(stack));
            self.threads.handle(id)
        };
        debug!(
            "{handle}: created, priority {} {:?} {:?}",
            options.priority, options.affinity, options.flags
        );

        if !options.flags.contains(ThreadFlags::START_SUSPENDED) {
            let res = self.make_ready(handle, ThreadState::Suspended);
            debug_assert_eq!(res, Ok(()));
        }
        Ok(handle)
    }

    /// Terminates a thread from any core.
    ///
    /// A thread running on another core keeps running until that core has
    /// serviced the reschedule request sent here.
    ///
    /// # Panics
    ///
    /// Panics if the thread is essential.
    pub fn terminate_thread(&self, handle: ThreadHandle) -> Result<(), ThreadError> {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        let (id, mut rq) = self.lock_thread(handle)?;
        let mut info = self.threads.info(id, &rq);
        assert!(
            !info.flags.contains(ThreadFlags::ESSENTIAL),
            "essential {handle} terminated"
        );

        let state = info.state;
        if state == ThreadState::Terminated {
            return Ok(());
        }
        if state == ThreadState::Ready {
            rq.ready.remove(id);
        }
        info.state = ThreadState::Terminated;
        self.threads.set_info(id, &rq, info);
        if rq.current == id {
            self.request_resched(&mut rq, me);
        }
        self.publish(&rq);
        debug!("{handle}: terminated ({state:?})");
        Ok(())
    }

    /// Terminates the calling thread. The switch away happens at the next
    /// switch point of this core.
    pub fn exit_current(&self) {
        let handle = self.current_thread();
        if let Err(err) = self.terminate_thread(handle) {
            debug!("{handle}: exit failed: {err}");
        }
    }

    /// Frees the slot of a terminated thread and returns its stack.
    ///
    /// Fails with [`ThreadError::StillRunning`] until the core that ran the
    /// thread has switched away from it.
    pub fn release_thread(&self, handle: ThreadHandle) -> Result<StackRegion, ThreadError> {
        let (id, rq) = self.lock_thread(handle)?;
        let state = self.threads.info(id, &rq).state;
        if state != ThreadState::Terminated {
            return Err(ThreadError::InvalidState(state));
        }
        if rq.current == id {
            return Err(ThreadError::StillRunning);
        }
        let stack = self.threads.free(id, &rq).ok_or(ThreadError::StaleHandle)?;
        debug!("{handle}: released");
        Ok(stack)
    }

    /// Blocks the calling thread. Returns its handle for the waker.
    pub fn block_current(&self) -> Result<ThreadHandle, ThreadError> {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        let mut rq = self.rqs[me].lock();
        let id = rq.current;
        let mut info = self.threads.info(id, &rq);
        if id == rq.idle || info.state != ThreadState::Running {
            return Err(ThreadError::InvalidState(info.state));
        }
        info.state = ThreadState::Blocked;
        self.threads.set_info(id, &rq, info);
        self.request_resched(&mut rq, me);
        self.publish(&rq);
        Ok(self.threads.handle(id))
    }

    /// Makes a blocked thread Ready.
    pub fn wake(&self, handle: ThreadHandle) -> Result<(), ThreadError> {
        self.make_ready(handle, ThreadState::Blocked)
    }

    /// Takes a thread off the ready queue or off its core until resumed.
    ///
    /// Suspending a suspended thread does nothing.
    pub fn suspend(&self, handle: ThreadHandle) -> Result<(), ThreadError> {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        let (id, mut rq) = self.lock_thread(handle)?;
        let mut info = self.threads.info(id, &rq);
        if id.is_idle() {
            return Err(ThreadError::InvalidState(info.state));
        }
        match info.state {
            ThreadState::Suspended => return Ok(()),
            ThreadState::Terminated => return Err(ThreadError::InvalidState(info.state)),
            ThreadState::Ready => {
                rq.ready.remove(id);
            }
            ThreadState::Running | ThreadState::Blocked => {}
        }
        info.state = ThreadState::Suspended;
        self.threads.set_info(id, &rq, info);
        if rq.current == id {
            self.request_resched(&mut rq, me);
        }
        self.publish(&rq);
        Ok(())
    }

    /// Makes a suspended thread Ready.
    pub fn resume(&self, handle: ThreadHandle) -> Result<(), ThreadError> {
        self.make_ready(handle, ThreadState::Suspended)
    }

    pub fn set_priority(&self, handle: ThreadHandle, priority: Priority) -> Result<(), ThreadError> {
        if priority > LOWEST_THREAD_PRIORITY {
            return Err(ThreadError::InvalidPriority(priority));
        }
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        let (id, mut rq) = self.lock_thread(handle)?;
        let mut info = self.threads.info(id, &rq);
        if id.is_idle() {
            return Err(ThreadError::InvalidState(info.state));
        }

        let old = info.priority;
        info.priority = priority;
        let mut rebalance = false;
        match info.state {
            ThreadState::Terminated => return Err(ThreadError::InvalidState(info.state)),
            ThreadState::Ready => {
                rq.ready.remove(id);
                self.enqueue(id, info, &mut rq, me);
                rebalance = info.affinity == Affinity::Floating;
            }
            ThreadState::Running => {
                self.threads.set_info(id, &rq, info);
                // the pass may also pull work that now outranks it
                if priority > old {
                    self.request_resched(&mut rq, me);
                }
                self.publish(&rq);
            }
            ThreadState::Blocked | ThreadState::Suspended => {
                self.threads.set_info(id, &rq, info);
            }
        }
        let home = rq.cpu;
        drop(rq);
        trace!("{handle}: priority {old} -> {priority}");

        if rebalance {
            self.cascade(home, me);
        }
        Ok(())
    }

    /// Restricts a thread to `cpu`.
    ///
    /// Only allowed while the thread is neither queued nor on a core.
    pub fn pin(&self, handle: ThreadHandle, cpu: CpuId) -> Result<(), ThreadError> {
        if cpu >= self.num_cpus() {
            return Err(ThreadError::InvalidCpu(cpu));
        }
        self.set_affinity(handle, Affinity::Pinned(cpu))
    }

    /// Lets a thread run on any core. Same restrictions as [`Self::pin()`].
    pub fn unpin(&self, handle: ThreadHandle) -> Result<(), ThreadError> {
        self.set_affinity(handle, Affinity::Floating)
    }

    pub fn thread_state(&self, handle: ThreadHandle) -> Result<ThreadState, ThreadError> {
        let (id, rq) = self.lock_thread(handle)?;
        Ok(self.threads.info(id, &rq).state)
    }

    pub fn thread_priority(&self, handle: ThreadHandle) -> Result<Priority, ThreadError> {
        let (id, rq) = self.lock_thread(handle)?;
        Ok(self.threads.info(id, &rq).priority)
    }

    pub fn thread_affinity(&self, handle: ThreadHandle) -> Result<Affinity, ThreadError> {
        let (id, rq) = self.lock_thread(handle)?;
        Ok(self.threads.info(id, &rq).affinity)
    }

    /// Core the thread is installed on, if any.
    pub fn thread_cpu(&self, handle: ThreadHandle) -> Result<Option<CpuId>, ThreadError> {
        let (id, rq) = self.lock_thread(handle)?;
        Ok((rq.current == id).then_some(rq.cpu))
    }

    fn check_options(&self, options: &ThreadOptions) -> Result<(), ThreadError> {
        if options.priority > LOWEST_THREAD_PRIORITY {
            return Err(ThreadError::InvalidPriority(options.priority));
        }
        match options.affinity {
            Affinity::Pinned(cpu) if cpu >= self.num_cpus() => Err(ThreadError::InvalidCpu(cpu)),
            _ => Ok(()),
        }
    }

    fn set_affinity(&self, handle: ThreadHandle, affinity: Affinity) -> Result<(), ThreadError> {
        let (id, rq) = self.lock_thread(handle)?;
        let mut info = self.threads.info(id, &rq);
        // a thread that stopped running stays installed until the next pass
        if id.is_idle() || info.state.is_runnable() || rq.current == id {
            return Err(ThreadError::InvalidState(info.state));
        }
        info.affinity = affinity;
        self.threads.set_info(id, &rq, info);
        Ok(())
    }

    /// Locks the run queue that protects `handle`'s thread.
    fn lock_thread(
        &self,
        handle: ThreadHandle,
    ) -> Result<(ThreadId, SpinLockGuard<'_, RunQueue, P::Irq>), ThreadError> {
        let id = handle.id();
        loop {
            if !self.threads.is_live(handle) {
                return Err(ThreadError::StaleHandle);
            }
            let home = self.threads.home(id);
            let rq = self.rqs[home].lock();
            // the home only changes under its own lock, and so does the
            // slot generation
            if self.threads.home(id) == home {
                if !self.threads.is_live(handle) {
                    return Err(ThreadError::StaleHandle);
                }
                return Ok((id, rq));
            }
        }
    }

    /// Moves a thread in state `from` to Ready, on the core picked by
    /// [`Self::placement()`].
    fn make_ready(&self, handle: ThreadHandle, from: ThreadState) -> Result<(), ThreadError> {
        let _irq = IrqGuard::<P::Irq>::new();
        let me = P::Irq::cpu_id();
        loop {
            let (id, mut rq) = self.lock_thread(handle)?;
            let mut info = self.threads.info(id, &rq);
            if id.is_idle() || info.state != from {
                return Err(ThreadError::InvalidState(info.state));
            }
            if rq.current == id {
                // still installed: the pending pass decides whether it stays
                info.state = ThreadState::Running;
                self.threads.set_info(id, &rq, info);
                self.publish(&rq);
                return Ok(());
            }

            let home = rq.cpu;
            let target = self.placement(&info, me, home);
            if target == home {
                self.enqueue(id, info, &mut rq, me);
                return Ok(());
            }
            drop(rq);

            let mut pair = lock_pair(&self.rqs, home, target);
            let (home_rq, Some(target_rq)) = pair.split() else {
                continue;
            };
            if self.threads.home(id) != home || !self.threads.is_live(handle) {
                continue;
            }
            let info = self.threads.info(id, home_rq);
            if info.state != from {
                return Err(ThreadError::InvalidState(info.state));
            }
            // installed again, or re-pinned while unlocked
            if home_rq.current == id || !info.affinity.allows(target) {
                continue;
            }
            self.threads.rehome(id, home_rq, target_rq);
            self.enqueue(id, info, target_rq, me);
            return Ok(());
        }
    }
}
