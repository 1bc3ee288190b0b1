//! SMP scheduling core of a preemptive, priority-based real-time kernel.
//!
//! Each core owns a ready queue behind an interrupt-masking spin lock; there
//! is no global scheduler lock. Cores keep each other consistent with
//! one-slot doorbell interrupts, and a core displaced by a more important
//! thread hands floating threads on to cores running less important work.
//!
//! Architecture specifics are reached through [`Platform`]. With the `std`
//! feature, [`sim`] provides a simulated multi-core platform on host threads.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub use self::{
    bringup::{BringupParams, BringupRecord, CoreEntry, SecondaryStart},
    config::KernelConfig,
    cpu::CoreState,
    error::{IpiError, SpawnError, ThreadError},
    ipi::{IpiMessage, IpiTag},
    kernel::Kernel,
    platform::{FrameInit, InterruptFrame, Platform, UserEntry},
    thread::{
        Affinity, StackRegion, ThreadEntry, ThreadFlags, ThreadHandle, ThreadOptions, ThreadState,
    },
};

mod bootstrap;
mod bringup;
mod config;
mod cpu;
mod error;
mod ipi;
mod kernel;
mod platform;
mod ready_queue;
mod sched;
#[cfg(any(test, feature = "std"))]
pub mod sim;
mod thread;

/// Index of a core, dense from zero.
pub type CpuId = usize;

/// Scheduling priority. Lower values are more important.
pub type Priority = u8;
