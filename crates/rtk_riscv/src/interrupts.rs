//! Local interrupt control.

use core::arch::asm;

use irq_spin::Interrupts;
use riscv::register::{sie, sstatus};

/// `sip.SSIP`: pending supervisor software interrupt.
const SIP_SSIP: usize = 1 << 1;

/// Supervisor interrupt enable of the executing hart. The hart id lives in
/// `tp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiscvInterrupts;

impl Interrupts for RiscvInterrupts {
    fn disable() -> bool {
        let was_enabled = sstatus::read().sie();
        unsafe {
            sstatus::clear_sie();
        }
        was_enabled
    }

    fn enable() {
        unsafe {
            sstatus::set_sie();
        }
    }

    fn is_enabled() -> bool {
        sstatus::read().sie()
    }

    fn cpu_id() -> usize {
        let id: usize;
        unsafe { asm!("mv {}, tp", out(reg) id) };
        id
    }
}

/// Stores the hart id for [`RiscvInterrupts::cpu_id()`] and for the trap
/// vector, which reloads `tp` from `sscratch`.
///
/// # Safety
///
/// Must be called once per hart, before anything reads its id.
pub unsafe fn set_cpu_id(id: usize) {
    unsafe {
        asm!("mv tp, {0}", "csrw sscratch, {0}", in(reg) id);
    }
}

/// Marks the software interrupt of this hart pending.
pub fn pend_soft() {
    unsafe { asm!("csrs sip, {}", in(reg) SIP_SSIP) };
}

pub fn clear_soft() {
    unsafe { asm!("csrc sip, {}", in(reg) SIP_SSIP) };
}

/// Unmasks software interrupts, which carry doorbells and local switch
/// requests.
pub fn enable_soft() {
    unsafe {
        let mut sie = sie::read();
        sie.set_ssoft(true);
        sie::write(sie);
    }
}

pub fn enable_timer() {
    unsafe {
        let mut sie = sie::read();
        sie.set_stimer(true);
        sie::write(sie);
    }
}
