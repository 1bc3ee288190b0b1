//! Trap entry and exit.
//!
//! Every trap saves a [`TrapFrame`] on the interrupted stack, runs the
//! handler on the hart's interrupt stack, and restores whichever frame
//! [`Kernel::switch_point()`](rtk_sched::Kernel::switch_point) returns. That
//! restore path is also how new threads start: their stacks hold a frame
//! built by [`InterruptFrame::new_thread()`](rtk_sched::InterruptFrame).

use core::{
    arch::{asm, global_asm},
    mem::{self, offset_of},
    ptr,
    sync::atomic::{AtomicU64, Ordering},
};

use log::warn;
use riscv::{
    interrupt::{
        Trap,
        supervisor::{Exception, Interrupt},
    },
    register::{
        scause, stval,
        stvec::{self, TrapMode},
    },
};
use rtk_params::MAX_CPUS;

use crate::{
    frame::{SSTATUS_SPP, TrapFrame},
    interrupts, kernel, println, sbi,
};

/// Size of the per-hart stack that trap handlers run on.
pub const IRQ_STACK_SIZE: usize = 4096;

#[repr(C, align(16))]
struct IrqStacks([[u8; IRQ_STACK_SIZE]; MAX_CPUS]);

// Also the boot stacks of secondary harts, which leave them before unmasking
// interrupts.
static mut IRQ_STACKS: IrqStacks = IrqStacks([[0; IRQ_STACK_SIZE]; MAX_CPUS]);

/// Timer period in `time` ticks; 0 leaves the timer off.
static TICK_INTERVAL: AtomicU64 = AtomicU64::new(0);

global_asm!(
    ".section .text",
    ".balign 4",
    ".globl rtk_trap_vector",
    "rtk_trap_vector:",
    "addi sp, sp, -{frame_size}",
    "sd ra, {ra}(sp)",
    "sd gp, {gp}(sp)",
    "sd tp, {tp}(sp)",
    "sd t0, {t0}(sp)",
    "sd t1, {t1}(sp)",
    "sd t2, {t2}(sp)",
    "sd s0, {s0}(sp)",
    "sd s1, {s1}(sp)",
    "sd a0, {a0}(sp)",
    "sd a1, {a1}(sp)",
    "sd a2, {a2}(sp)",
    "sd a3, {a3}(sp)",
    "sd a4, {a4}(sp)",
    "sd a5, {a5}(sp)",
    "sd a6, {a6}(sp)",
    "sd a7, {a7}(sp)",
    "sd s2, {s2}(sp)",
    "sd s3, {s3}(sp)",
    "sd s4, {s4}(sp)",
    "sd s5, {s5}(sp)",
    "sd s6, {s6}(sp)",
    "sd s7, {s7}(sp)",
    "sd s8, {s8}(sp)",
    "sd s9, {s9}(sp)",
    "sd s10, {s10}(sp)",
    "sd s11, {s11}(sp)",
    "sd t3, {t3}(sp)",
    "sd t4, {t4}(sp)",
    "sd t5, {t5}(sp)",
    "sd t6, {t6}(sp)",
    "csrr t0, sepc",
    "sd t0, {sepc}(sp)",
    "csrr t0, sstatus",
    "sd t0, {sstatus}(sp)",
    // hart id, whatever the interrupted code left in tp
    "csrr tp, sscratch",
    // handler runs on this hart's interrupt stack
    "mv a0, sp",
    "la sp, {irq_stacks}",
    "addi t0, tp, 1",
    "li t1, {irq_stack_size}",
    "mul t0, t0, t1",
    "add sp, sp, t0",
    "call {trap_entry}",
    // a0 is the frame to resume, possibly another thread's
    "mv sp, a0",
    "ld t0, {sepc}(sp)",
    "csrw sepc, t0",
    "ld t0, {sstatus}(sp)",
    "csrw sstatus, t0",
    "andi t0, t0, {spp}",
    "bnez t0, 1f",
    "ld gp, {gp}(sp)",
    "ld tp, {tp}(sp)",
    "1:",
    "ld ra, {ra}(sp)",
    "ld t0, {t0}(sp)",
    "ld t1, {t1}(sp)",
    "ld t2, {t2}(sp)",
    "ld s0, {s0}(sp)",
    "ld s1, {s1}(sp)",
    "ld a0, {a0}(sp)",
    "ld a1, {a1}(sp)",
    "ld a2, {a2}(sp)",
    "ld a3, {a3}(sp)",
    "ld a4, {a4}(sp)",
    "ld a5, {a5}(sp)",
    "ld a6, {a6}(sp)",
    "ld a7, {a7}(sp)",
    "ld s2, {s2}(sp)",
    "ld s3, {s3}(sp)",
    "ld s4, {s4}(sp)",
    "ld s5, {s5}(sp)",
    "ld s6, {s6}(sp)",
    "ld s7, {s7}(sp)",
    "ld s8, {s8}(sp)",
    "ld s9, {s9}(sp)",
    "ld s10, {s10}(sp)",
    "ld s11, {s11}(sp)",
    "ld t3, {t3}(sp)",
    "ld t4, {t4}(sp)",
    "ld t5, {t5}(sp)",
    "ld t6, {t6}(sp)",
    "addi sp, sp, {frame_size}",
    "sret",
    "",
    // first instruction of every thread: a0 = entry, a1..a3 = arguments,
    // ra = exit handler
    ".balign 4",
    ".globl rtk_thread_trampoline",
    "rtk_thread_trampoline:",
    "mv t0, a0",
    "mv a0, a1",
    "mv a1, a2",
    "mv a2, a3",
    "jr t0",
    "",
    // started by the firmware: a0 = hart id, a1 = bring-up record,
    // interrupts masked
    ".balign 4",
    ".globl rtk_secondary_entry",
    "rtk_secondary_entry:",
    "mv tp, a0",
    "csrw sscratch, a0",
    "la sp, {irq_stacks}",
    "addi t0, a0, 1",
    "li t1, {irq_stack_size}",
    "mul t0, t0, t1",
    "add sp, sp, t0",
    "call {secondary_main}",
    frame_size = const mem::size_of::<TrapFrame>(),
    ra = const offset_of!(TrapFrame, ra),
    gp = const offset_of!(TrapFrame, gp),
    tp = const offset_of!(TrapFrame, tp),
    t0 = const offset_of!(TrapFrame, t0),
    t1 = const offset_of!(TrapFrame, t1),
    t2 = const offset_of!(TrapFrame, t2),
    s0 = const offset_of!(TrapFrame, s0),
    s1 = const offset_of!(TrapFrame, s1),
    a0 = const offset_of!(TrapFrame, a0),
    a1 = const offset_of!(TrapFrame, a1),
    a2 = const offset_of!(TrapFrame, a2),
    a3 = const offset_of!(TrapFrame, a3),
    a4 = const offset_of!(TrapFrame, a4),
    a5 = const offset_of!(TrapFrame, a5),
    a6 = const offset_of!(TrapFrame, a6),
    a7 = const offset_of!(TrapFrame, a7),
    s2 = const offset_of!(TrapFrame, s2),
    s3 = const offset_of!(TrapFrame, s3),
    s4 = const offset_of!(TrapFrame, s4),
    s5 = const offset_of!(TrapFrame, s5),
    s6 = const offset_of!(TrapFrame, s6),
    s7 = const offset_of!(TrapFrame, s7),
    s8 = const offset_of!(TrapFrame, s8),
    s9 = const offset_of!(TrapFrame, s9),
    s10 = const offset_of!(TrapFrame, s10),
    s11 = const offset_of!(TrapFrame, s11),
    t3 = const offset_of!(TrapFrame, t3),
    t4 = const offset_of!(TrapFrame, t4),
    t5 = const offset_of!(TrapFrame, t5),
    t6 = const offset_of!(TrapFrame, t6),
    sepc = const offset_of!(TrapFrame, sepc),
    sstatus = const offset_of!(TrapFrame, sstatus),
    spp = const SSTATUS_SPP,
    irq_stacks = sym IRQ_STACKS,
    irq_stack_size = const IRQ_STACK_SIZE,
    trap_entry = sym trap_entry,
    secondary_main = sym crate::boot::secondary_main,
);

unsafe extern "C" {
    fn rtk_trap_vector();
    fn rtk_thread_trampoline();
    fn rtk_secondary_entry();
}

pub fn vector_addr() -> usize {
    rtk_trap_vector as usize
}

pub fn thread_trampoline_addr() -> usize {
    rtk_thread_trampoline as usize
}

pub fn secondary_entry_addr() -> usize {
    rtk_secondary_entry as usize
}

/// Installs `vector` as the trap vector and starts the timer of the calling
/// hart.
pub fn init_hart(vector: usize) {
    unsafe {
        stvec::write(vector, TrapMode::Direct);
    }
    interrupts::enable_timer();
    arm_timer();
}

/// Sets the timer period of every hart, in `time` ticks.
///
/// Harts initialized before the first non-zero period never tick. 0 stops
/// each hart after its next timer interrupt.
pub fn set_tick_interval(ticks: u64) {
    TICK_INTERVAL.store(ticks, Ordering::Relaxed);
}

fn arm_timer() {
    let interval = TICK_INTERVAL.load(Ordering::Relaxed);
    if interval == 0 {
        return;
    }
    let now: u64;
    unsafe {
        asm!("csrr {}, time", out(reg) now);
    }
    if let Err(err) = sbi::set_timer(now.wrapping_add(interval)) {
        warn!("set_timer failed: {err}");
    }
}

/// Handles the trap whose frame is at `old_sp` and returns the frame to
/// resume.
extern "C" fn trap_entry(old_sp: usize) -> usize {
    let kernel = kernel();
    let cause: Result<Trap<Interrupt, Exception>, _> = scause::read().cause().try_into();

    match cause {
        Ok(Trap::Interrupt(Interrupt::SupervisorSoft)) => {
            // doorbells are drained by the switch point
            interrupts::clear_soft();
        }
        Ok(Trap::Interrupt(Interrupt::SupervisorTimer)) => {
            arm_timer();
            kernel.tick();
        }
        Ok(Trap::Interrupt(int)) => {
            warn!("unexpected interrupt {int:?}");
        }
        Ok(Trap::Exception(e)) => {
            let frame = unsafe { &*ptr::with_exposed_provenance::<TrapFrame>(old_sp) };
            let stval = stval::read();
            println!("trap: exception {e:?} in {}", kernel.current_thread());
            println!("      sepc={:#x} stval={stval:#x}", frame.sepc);
            assert!(frame.is_user(), "unexpected trap (exception)");
            kernel.exit_current();
        }
        Err(_) => panic!("unknown trap cause {:#x}", scause::read().bits()),
    }

    kernel.switch_point(old_sp)
}
