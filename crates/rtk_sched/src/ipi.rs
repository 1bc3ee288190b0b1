//! One-slot doorbells between every ordered pair of cores.

use irq_spin::{Interrupts, IrqGuard, SpinLock};
use log::{trace, warn};
use rtk_params::MAX_CPUS;
use strum::FromRepr;

use crate::{CpuId, Kernel, error::IpiError, platform::Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum IpiTag {
    /// Run a reschedule pass. Idempotent.
    Reschedule = 1,
    /// Start request of a secondary core; the payload is the address of the
    /// bring-up record.
    PowerUp = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpiMessage {
    pub tag: IpiTag,
    pub payload: usize,
}

impl IpiMessage {
    pub const RESCHEDULE: Self = Self {
        tag: IpiTag::Reschedule,
        payload: 0,
    };

    #[must_use]
    pub const fn power_up(record: usize) -> Self {
        Self {
            tag: IpiTag::PowerUp,
            payload: record,
        }
    }
}

/// Doorbell slots indexed by `[source][target]`.
///
/// A slot holds at most one unconsumed message.
pub(crate) struct Doorbells<I> {
    slots: [[SpinLock<Option<IpiMessage>, I>; MAX_CPUS]; MAX_CPUS],
}

impl<I> Doorbells<I>
where
    I: Interrupts,
{
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { [const { SpinLock::new(None) }; MAX_CPUS] }; MAX_CPUS],
        }
    }

    pub(crate) fn post(&self, src: CpuId, dst: CpuId, msg: IpiMessage) -> Result<(), IpiError> {
        let mut slot = self.slots[src][dst].lock();
        if slot.is_some() {
            return Err(IpiError::Busy);
        }
        *slot = Some(msg);
        Ok(())
    }

    pub(crate) fn is_pending(&self, src: CpuId, dst: CpuId) -> bool {
        self.slots[src][dst].lock().is_some()
    }

    pub(crate) fn take(&self, src: CpuId, dst: CpuId) -> Option<IpiMessage> {
        self.slots[src][dst].lock().take()
    }

    /// Clears the slot if it holds a message tagged `tag`.
    pub(crate) fn clear(&self, src: CpuId, dst: CpuId, tag: IpiTag) -> bool {
        let mut slot = self.slots[src][dst].lock();
        if slot.is_some_and(|msg| msg.tag == tag) {
            *slot = None;
            return true;
        }
        false
    }
}

impl<P> Kernel<P>
where
    P: Platform,
{
    /// Asks `cpu` to run a reschedule pass.
    ///
    /// `Busy` means an earlier request is still pending, which covers this
    /// one.
    pub fn send_reschedule_ipi(&self, cpu: CpuId) -> Result<(), IpiError> {
        let _irq = IrqGuard::<P::Irq>::new();
        self.send_ipi(P::Irq::cpu_id(), cpu, IpiMessage::RESCHEDULE)
    }

    /// Returns `true` while the doorbell from `src` to `dst` holds an
    /// unconsumed message.
    pub fn ipi_pending(&self, src: CpuId, dst: CpuId) -> bool {
        src < self.num_cpus() && dst < self.num_cpus() && self.doorbells.is_pending(src, dst)
    }

    pub(crate) fn send_ipi(&self, src: CpuId, dst: CpuId, msg: IpiMessage) -> Result<(), IpiError> {
        if dst >= self.num_cpus() {
            return Err(IpiError::InvalidCpu(dst));
        }
        if !self.is_core_active(dst) {
            return Err(IpiError::Offline(dst));
        }
        self.doorbells.post(src, dst, msg)?;
        trace!("ipi cpu{src} -> cpu{dst}: {msg:?}");
        self.platform.raise_ipi(dst);
        Ok(())
    }

    /// Consumes every message posted to `me`.
    ///
    /// Returns `true` if one of them requested a reschedule.
    pub(crate) fn drain_doorbells(&self, me: CpuId) -> bool {
        let mut resched = false;
        for src in 0..self.num_cpus() {
            match self.doorbells.take(src, me) {
                Some(IpiMessage {
                    tag: IpiTag::Reschedule,
                    ..
                }) => resched = true,
                Some(msg) => warn!("cpu{me}: dropped stale message from cpu{src}: {msg:?}"),
                None => {}
            }
        }
        resched
    }
}

#[cfg(test)]
mod tests {
    use irq_spin::host::HostInterrupts;

    use super::*;

    #[test]
    fn slot_holds_one_message() {
        let bells = Doorbells::<HostInterrupts>::new();
        assert_eq!(bells.post(0, 1, IpiMessage::RESCHEDULE), Ok(()));
        assert_eq!(
            bells.post(0, 1, IpiMessage::RESCHEDULE),
            Err(IpiError::Busy)
        );
        // other direction is independent
        assert_eq!(bells.post(1, 0, IpiMessage::RESCHEDULE), Ok(()));

        assert!(bells.is_pending(0, 1));
        assert_eq!(bells.take(0, 1), Some(IpiMessage::RESCHEDULE));
        assert!(!bells.is_pending(0, 1));
        assert_eq!(bells.take(0, 1), None);
    }

    #[test]
    fn clear_checks_the_tag() {
        let bells = Doorbells::<HostInterrupts>::new();
        bells.post(0, 2, IpiMessage::power_up(0x80)).unwrap();
        assert!(!bells.clear(0, 2, IpiTag::Reschedule));
        assert!(bells.is_pending(0, 2));
        assert!(bells.clear(0, 2, IpiTag::PowerUp));
        assert!(!bells.is_pending(0, 2));
    }
}
