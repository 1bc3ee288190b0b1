//! Spin locks that mask local interrupts while held.
//!
//! The architecture supplies an [`Interrupts`] implementation. Everything in
//! this crate is generic over it, so the same lock type runs on a real CPU
//! and, with the `std` feature, on host threads standing in for CPUs.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::marker::PhantomData;

pub use self::{
    pair::{PairGuard, lock_pair},
    spin_lock::{RawSpinLock, SpinLock, SpinLockGuard, TryLockError},
};

#[cfg(any(test, feature = "std"))]
pub mod host;
mod pair;
mod spin_lock;

/// Local interrupt control of the CPU executing the caller.
pub trait Interrupts {
    /// Masks local interrupts.
    ///
    /// Returns `true` if interrupts were enabled before the call.
    fn disable() -> bool;

    /// Unmasks local interrupts.
    fn enable();

    /// Returns `true` if local interrupts are enabled.
    fn is_enabled() -> bool;

    /// Returns the id of the CPU executing the caller.
    ///
    /// The value is only stable while interrupts are masked.
    fn cpu_id() -> usize;
}

/// Interrupt state saved by [`IrqGuard::new()`], restored on drop.
///
/// Guards must be dropped in reverse order of creation. Dropping an outer
/// guard first would unmask interrupts while an inner critical section is
/// still running; debug builds catch that in the inner guard's `drop`.
#[must_use]
pub struct IrqGuard<I>
where
    I: Interrupts,
{
    was_enabled: bool,
    // CPU-local: must not leave the CPU that created it.
    _marker: PhantomData<(*const (), fn() -> I)>,
}

impl<I> IrqGuard<I>
where
    I: Interrupts,
{
    /// Saves the current interrupt state and masks interrupts.
    pub fn new() -> Self {
        let was_enabled = I::disable();
        Self {
            was_enabled,
            _marker: PhantomData,
        }
    }

    /// Returns `true` if interrupts will be unmasked when this guard drops.
    #[must_use]
    pub fn restores_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl<I> Default for IrqGuard<I>
where
    I: Interrupts,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Drop for IrqGuard<I>
where
    I: Interrupts,
{
    fn drop(&mut self) {
        debug_assert!(
            !I::is_enabled(),
            "interrupt guard dropped out of order on cpu {}",
            I::cpu_id()
        );
        if self.was_enabled {
            I::enable();
        }
    }
}

/// Runs `f` with local interrupts masked.
pub fn with_disabled<I, T, F>(f: F) -> T
where
    I: Interrupts,
    F: FnOnce() -> T,
{
    let _guard = IrqGuard::<I>::new();
    f()
}
