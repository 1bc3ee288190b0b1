use core::{
    cell::UnsafeCell,
    fmt, hint,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{Interrupts, IrqGuard};

const NO_OWNER: usize = usize::MAX;

/// Error returned by the `try_*` lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryLockError {
    #[error("lock is held")]
    WouldBlock,
}

pub struct RawSpinLock<I> {
    locked: AtomicBool,
    /// CPU holding the lock, for `holding()` and debugging.
    owner: AtomicUsize,
    _irq: PhantomData<fn() -> I>,
}

impl<I> Default for RawSpinLock<I>
where
    I: Interrupts,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I> RawSpinLock<I>
where
    I: Interrupts,
{
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            _irq: PhantomData,
        }
    }

    /// Acquires the lock.
    ///
    /// Masks interrupts, then loops (spins) until the lock is acquired.
    /// The returned guard restores the interrupt state and must be dropped
    /// after [`Self::release()`].
    pub fn acquire(&self) -> IrqGuard<I> {
        // disable interrupts to avoid deadlock with handlers on this CPU.
        let irq = IrqGuard::new();

        debug_assert!(
            !self.holding(),
            "spin lock re-entered on cpu {}",
            I::cpu_id()
        );

        // `Ordering::Acquire` keeps the critical section's memory
        // references strictly after the lock is acquired.
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }

        self.owner.store(I::cpu_id(), Ordering::Relaxed);
        irq
    }

    /// Acquires the lock if it is free.
    pub fn try_acquire(&self) -> Result<IrqGuard<I>, TryLockError> {
        let irq = IrqGuard::new();

        debug_assert!(
            !self.holding(),
            "spin lock re-entered on cpu {}",
            I::cpu_id()
        );

        if self.locked.swap(true, Ordering::Acquire) {
            return Err(TryLockError::WouldBlock);
        }

        self.owner.store(I::cpu_id(), Ordering::Relaxed);
        Ok(irq)
    }

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The current CPU must hold the lock.
    pub unsafe fn release(&self) {
        debug_assert!(self.holding(), "spin lock released by non-owner");

        self.owner.store(NO_OWNER, Ordering::Relaxed);

        // `Ordering::Release` makes every store of the critical section
        // visible to the next CPU that acquires the lock.
        self.locked.store(false, Ordering::Release);
    }

    /// Checks whether this CPU is holding the lock.
    ///
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        debug_assert!(!I::is_enabled());
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == I::cpu_id()
    }

    /// Returns `true` if any CPU holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct SpinLock<T, I> {
    lock: RawSpinLock<I>,
    value: UnsafeCell<T>,
}

unsafe impl<T, I> Sync for SpinLock<T, I> where T: Send {}

impl<T, I> Default for SpinLock<T, I>
where
    T: Default,
    I: Interrupts,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, I> fmt::Debug for SpinLock<T, I>
where
    I: Interrupts,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.lock.is_locked())
            .finish_non_exhaustive()
    }
}

impl<T, I> SpinLock<T, I>
where
    I: Interrupts,
{
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T, I> {
        let irq = self.lock.acquire();
        SpinLockGuard { lock: self, irq }
    }

    /// Acquires the lock if no other CPU holds it.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T, I>, TryLockError> {
        let irq = self.lock.try_acquire()?;
        Ok(SpinLockGuard { lock: self, irq })
    }

    /// Returns `true` if the current CPU holds the lock.
    ///
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub struct SpinLockGuard<'a, T, I>
where
    I: Interrupts,
{
    lock: &'a SpinLock<T, I>,
    // dropped after `Drop::drop` released the lock.
    irq: IrqGuard<I>,
}

unsafe impl<T, I> Sync for SpinLockGuard<'_, T, I>
where
    T: Sync,
    I: Interrupts,
{
}

impl<T, I> Drop for SpinLockGuard<'_, T, I>
where
    I: Interrupts,
{
    fn drop(&mut self) {
        unsafe { self.lock.lock.release() }
    }
}

impl<T, I> Deref for SpinLockGuard<'_, T, I>
where
    I: Interrupts,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T, I> DerefMut for SpinLockGuard<'_, T, I>
where
    I: Interrupts,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T, I> SpinLockGuard<'_, T, I>
where
    I: Interrupts,
{
    /// Returns `true` if releasing this guard unmasks interrupts.
    #[must_use]
    pub fn restores_enabled(&self) -> bool {
        self.irq.restores_enabled()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    use super::*;
    use crate::host::{self, HostInterrupts};

    type Lock<T> = SpinLock<T, HostInterrupts>;

    #[test]
    fn lock_masks_and_restores_interrupts() {
        let lock = Lock::new(0);
        assert!(HostInterrupts::is_enabled());
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(!HostInterrupts::is_enabled());
            assert!(lock.holding());
            assert!(guard.restores_enabled());
        }
        assert!(HostInterrupts::is_enabled());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn nested_locks_restore_in_reverse_order() {
        let outer = Lock::new(());
        let inner = Lock::new(());

        let g1 = outer.lock();
        let g2 = inner.lock();
        assert!(!g2.restores_enabled());
        drop(g2);
        assert!(!HostInterrupts::is_enabled());
        drop(g1);
        assert!(HostInterrupts::is_enabled());
    }

    #[test]
    fn lock_keeps_masked_state_if_entered_masked() {
        let lock = Lock::new(());
        let was_enabled = HostInterrupts::disable();
        assert!(was_enabled);
        drop(lock.lock());
        assert!(!HostInterrupts::is_enabled());
        HostInterrupts::enable();
    }

    #[test]
    fn try_lock_fails_while_held_elsewhere() {
        let lock = Arc::new(Lock::new(()));
        let guard = lock.lock();

        let remote = Arc::clone(&lock);
        let res = thread::spawn(move || {
            host::set_cpu_id(1);
            remote.try_lock().map(drop)
        })
        .join()
        .unwrap();
        assert_eq!(res, Err(TryLockError::WouldBlock));

        drop(guard);
        assert!(lock.try_lock().is_ok());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "re-entered")]
    fn reentry_is_caught_in_debug_builds() {
        let lock = Lock::new(());
        let _g1 = lock.lock();
        let _g2 = lock.lock();
    }

    #[test]
    fn concurrent_increments_are_serialized() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 10_000;

        let lock = Arc::new(Lock::new(0_usize));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|cpu| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    host::set_cpu_id(cpu);
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let mut guard = lock.lock();
                        let v = *guard;
                        hint::spin_loop();
                        *guard = v + 1;
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), THREADS * ROUNDS);
    }
}
