//! Register context saved by the trap vector.

use dataview::{Pod, PodMethods as _};
use rtk_sched::{FrameInit, InterruptFrame};

/// `sstatus.SIE`: supervisor interrupts enabled.
pub const SSTATUS_SIE: usize = 1 << 1;
/// `sstatus.SPIE`: `SIE` value restored by `sret`.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// `sstatus.SPP`: privilege `sret` returns to, set for supervisor.
pub const SSTATUS_SPP: usize = 1 << 8;

/// Every general-purpose register except `sp`, which is the frame address
/// itself, followed by the trap CSRs.
///
/// `gp` and `tp` are restored only when returning to user mode. In
/// supervisor mode `tp` holds the hart id, which a migrated thread must not
/// carry over from the core it was interrupted on.
#[repr(C)]
#[derive(Pod, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub ra: usize,  // 0
    pub gp: usize,  // 8
    pub tp: usize,  // 16
    pub t0: usize,  // 24
    pub t1: usize,  // 32
    pub t2: usize,  // 40
    pub s0: usize,  // 48
    pub s1: usize,  // 56
    pub a0: usize,  // 64
    pub a1: usize,  // 72
    pub a2: usize,  // 80
    pub a3: usize,  // 88
    pub a4: usize,  // 96
    pub a5: usize,  // 104
    pub a6: usize,  // 112
    pub a7: usize,  // 120
    pub s2: usize,  // 128
    pub s3: usize,  // 136
    pub s4: usize,  // 144
    pub s5: usize,  // 152
    pub s6: usize,  // 160
    pub s7: usize,  // 168
    pub s8: usize,  // 176
    pub s9: usize,  // 184
    pub s10: usize, // 192
    pub s11: usize, // 200
    pub t3: usize,  // 208
    pub t4: usize,  // 216
    pub t5: usize,  // 224
    pub t6: usize,  // 232
    /// Saved program counter.
    pub sepc: usize, // 240
    /// Saved status; `SPP` and `SPIE` decide how `sret` resumes.
    pub sstatus: usize, // 248
}

impl TrapFrame {
    /// Returns `true` if the frame resumes in user mode.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP == 0
    }

    /// Returns `true` if interrupts are enabled after the frame is restored.
    #[must_use]
    pub fn resumes_enabled(&self) -> bool {
        self.sstatus & SSTATUS_SPIE != 0
    }
}

impl InterruptFrame for TrapFrame {
    fn new_thread(init: &FrameInit) -> Self {
        let mut sstatus = SSTATUS_SPIE;
        if !init.user_mode {
            sstatus |= SSTATUS_SPP;
        }
        let [a0, a1, a2, a3] = init.args;
        Self {
            ra: init.exit_handler,
            a0,
            a1,
            a2,
            a3,
            sepc: init.pc,
            sstatus,
            ..Self::zeroed()
        }
    }
}

#[cfg(test)]
mod tests {
    use core::mem::{self, offset_of};

    use dataview::PodMethods as _;
    use rtk_params::STACK_ALIGN;

    use super::*;

    fn init(user_mode: bool) -> FrameInit {
        FrameInit {
            pc: 0x8020_0000,
            exit_handler: 0x8020_0100,
            args: [0x8030_0000, 1, 2, 3],
            user_mode,
        }
    }

    #[test]
    fn layout_matches_trap_vector() {
        assert_eq!(mem::size_of::<TrapFrame>(), 32 * 8);
        assert_eq!(mem::size_of::<TrapFrame>() % STACK_ALIGN, 0);
        assert_eq!(offset_of!(TrapFrame, a0), 64);
        assert_eq!(offset_of!(TrapFrame, t6), 232);
        assert_eq!(offset_of!(TrapFrame, sepc), 240);
        assert_eq!(offset_of!(TrapFrame, sstatus), 248);
    }

    #[test]
    fn kernel_thread_resumes_in_supervisor_with_interrupts_on() {
        let frame = TrapFrame::new_thread(&init(false));
        assert!(!frame.is_user());
        assert!(frame.resumes_enabled());
        // SIE is off until `sret` copies SPIE into it
        assert_eq!(frame.sstatus & SSTATUS_SIE, 0);
        assert_eq!(frame.sepc, 0x8020_0000);
        assert_eq!(frame.ra, 0x8020_0100);
        assert_eq!([frame.a0, frame.a1, frame.a2, frame.a3], [0x8030_0000, 1, 2, 3]);
    }

    #[test]
    fn user_thread_resumes_in_user_mode() {
        let frame = TrapFrame::new_thread(&init(true));
        assert!(frame.is_user());
        assert!(frame.resumes_enabled());
    }

    #[test]
    fn other_registers_start_zeroed() {
        let mut frame = TrapFrame::new_thread(&init(false));
        frame.ra = 0;
        frame.a0 = 0;
        frame.a1 = 0;
        frame.a2 = 0;
        frame.a3 = 0;
        frame.sepc = 0;
        frame.sstatus = 0;
        assert!(frame.as_bytes().iter().all(|&b| b == 0));
    }
}
