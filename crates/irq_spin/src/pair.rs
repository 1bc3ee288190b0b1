//! Locking two spin locks of one array without deadlock.

use crate::{Interrupts, SpinLock, SpinLockGuard};

/// Guards of up to two locks taken by [`lock_pair()`].
///
/// The lock with the lower index is always acquired first and released
/// last.
pub enum PairGuard<'a, T, I>
where
    I: Interrupts,
{
    /// Both indices named the same lock.
    Single(SpinLockGuard<'a, T, I>),
    Pair {
        // fields drop in declaration order: `second` first.
        second: SpinLockGuard<'a, T, I>,
        first: SpinLockGuard<'a, T, I>,
        a_is_first: bool,
    },
}

/// Locks `locks[a]` and `locks[b]` in index order.
///
/// # Panics
///
/// Panics if `a` or `b` is out of bounds.
pub fn lock_pair<T, I>(locks: &[SpinLock<T, I>], a: usize, b: usize) -> PairGuard<'_, T, I>
where
    I: Interrupts,
{
    if a == b {
        return PairGuard::Single(locks[a].lock());
    }
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let first = locks[lo].lock();
    let second = locks[hi].lock();
    PairGuard::Pair {
        second,
        first,
        a_is_first: a < b,
    }
}

impl<T, I> PairGuard<'_, T, I>
where
    I: Interrupts,
{
    /// Returns the value behind `a`, and the value behind `b` if it is a
    /// different lock.
    pub fn split(&mut self) -> (&mut T, Option<&mut T>) {
        match self {
            Self::Single(guard) => (&mut **guard, None),
            Self::Pair {
                second,
                first,
                a_is_first,
            } => {
                if *a_is_first {
                    (&mut **first, Some(&mut **second))
                } else {
                    (&mut **second, Some(&mut **first))
                }
            }
        }
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
    fn split_follows_argument_order() {
        let locks = [Lock::new(0), Lock::new(1), Lock::new(2)];

        let mut pair = lock_pair(&locks, 2, 0);
        let (a, b) = pair.split();
        assert_eq!((*a, b.copied()), (2, Some(0)));
        drop(pair);

        let mut pair = lock_pair(&locks, 1, 1);
        let (a, b) = pair.split();
        assert_eq!((*a, b), (1, None));
        drop(pair);

        assert!(HostInterrupts::is_enabled());
    }

    #[test]
    fn opposite_orders_do_not_deadlock() {
        const ROUNDS: usize = 5_000;

        let locks = Arc::new([Lock::new(0_usize), Lock::new(0_usize)]);
        let barrier = Arc::new(Barrier::new(2));

        let handles = [(0, 1), (1, 0)]
            .into_iter()
            .enumerate()
            .map(|(cpu, (a, b))| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    host::set_cpu_id(cpu);
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        let mut pair = lock_pair(&*locks, a, b);
                        let (x, y) = pair.split();
                        *x += 1;
                        if let Some(y) = y {
                            *y += 1;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*locks[0].lock(), 2 * ROUNDS);
        assert_eq!(*locks[1].lock(), 2 * ROUNDS);
    }
}
