//! Moving floating ready threads between cores.
//!
//! A pass on one core can displace a floating thread that outranks what
//! another core runs. [`Kernel::cascade()`] hands such threads on and sends
//! the follow-up reschedule request; [`Kernel::pull()`] lets a core that is
//! about to run something worse take them.

use arrayvec::ArrayVec;
use irq_spin::lock_pair;
use log::trace;
use rtk_params::MAX_CPUS;

use crate::{CpuId, Kernel, Priority, platform::Platform};

impl<P> Kernel<P>
where
    P: Platform,
{
    /// Re-checks other cores after `from`'s queue gained floating threads.
    pub(crate) fn cascade(&self, from: CpuId, me: CpuId) {
        // each round moves one thread or stops
        for _ in 0..self.num_cpus() {
            if !self.cascade_one(from, me) {
                break;
            }
        }
    }

    fn cascade_one(&self, from: CpuId, me: CpuId) -> bool {
        let Some(candidate) = self.cpu(from).floating_priority() else {
            return false;
        };

        let mut targets = (0..self.num_cpus())
            .filter(|&cpu| cpu != from && self.is_core_active(cpu))
            .map(|cpu| (self.cpu(cpu).effective_priority(), cpu))
            .filter(|&(effective, _)| candidate < effective)
            .collect::<ArrayVec<(Priority, CpuId), MAX_CPUS>>();
        // least important work first
        targets.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, target) in targets {
            let mut pair = lock_pair(&self.rqs, from, target);
            let (src, Some(dst)) = pair.split() else {
                continue;
            };
            let Some(entry) = src.ready.best_floating().copied() else {
                return false;
            };
            if entry.priority >= self.effective_priority(dst) {
                continue;
            }

            src.ready.remove(entry.id);
            self.threads.rehome(entry.id, src, dst);
            // keeps its stamp: it was ready before anything queued on `dst`
            // later
            dst.ready.insert(entry);
            trace!("cascade {:?}: cpu{from} -> cpu{target}", entry.id);
            self.request_resched(dst, me);
            self.publish(src);
            self.publish(dst);
            return true;
        }
        false
    }

    /// Takes floating ready threads from other cores that outrank what `me`
    /// would run next.
    pub(crate) fn pull(&self, me: CpuId) {
        for other in 0..self.num_cpus() {
            if other == me || !self.is_core_active(other) {
                continue;
            }
            if self
                .cpu(other)
                .floating_priority()
                .is_none_or(|prio| prio >= self.cpu(me).effective_priority())
            {
                continue;
            }

            let mut pair = lock_pair(&self.rqs, me, other);
            let (mine, Some(theirs)) = pair.split() else {
                continue;
            };
            let Some(entry) = theirs.ready.best_floating().copied() else {
                continue;
            };
            if entry.priority >= self.effective_priority(mine) {
                continue;
            }
            // `other` is about to run it itself
            if theirs.ready.peek().is_some_and(|best| best.id == entry.id)
                && entry.priority < self.running_priority(theirs)
            {
                continue;
            }

            theirs.ready.remove(entry.id);
            self.threads.rehome(entry.id, theirs, mine);
            mine.ready.insert(entry);
            trace!("pull {:?}: cpu{other} -> cpu{me}", entry.id);
            self.publish(theirs);
            self.publish(mine);
        }
    }
}
