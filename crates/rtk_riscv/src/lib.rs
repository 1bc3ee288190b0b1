//! RISC-V supervisor-mode port of the `rtk_sched` scheduler.
//!
//! [`TrapFrame`] is portable and tested on the host. Everything else needs a
//! bare-metal `riscv64` target and an SBI firmware with the IPI, TIME and
//! HSM extensions.
//!
//! Board code calls [`init_primary()`] on the boot hart, creates threads,
//! starts the other harts with `Kernel::start_core`, and then unmasks
//! interrupts. Secondary harts enter through the trampoline recorded in the
//! bring-up record and join the scheduler on their own.

#![cfg_attr(not(test), no_std)]

pub use self::frame::{SSTATUS_SIE, SSTATUS_SPIE, SSTATUS_SPP, TrapFrame};
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use self::{
    boot::{RtKernel, idle, init_primary, kernel},
    interrupts::RiscvInterrupts,
    platform::RiscvPlatform,
    sbi::SbiError,
    trap::{IRQ_STACK_SIZE, set_tick_interval},
};

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod boot;
mod frame;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod interrupts;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod logger;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod platform;
#[doc(hidden)]
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod print;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod sbi;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod trap;
