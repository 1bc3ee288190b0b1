//! [`Interrupts`] for host threads.
//!
//! Each host thread plays one CPU: it carries its own interrupt-enable flag
//! and CPU id in thread-local storage.

use std::cell::Cell;

use crate::Interrupts;

thread_local! {
    static ENABLED: Cell<bool> = const { Cell::new(true) };
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostInterrupts;

impl Interrupts for HostInterrupts {
    fn disable() -> bool {
        ENABLED.replace(false)
    }

    fn enable() {
        ENABLED.set(true);
    }

    fn is_enabled() -> bool {
        ENABLED.get()
    }

    fn cpu_id() -> usize {
        CPU_ID.get()
    }
}

/// Makes the current host thread act as CPU `id`.
pub fn set_cpu_id(id: usize) {
    CPU_ID.set(id);
}

/// Runs `f` as CPU `id`, then restores the previous id.
///
/// Must not be called while a spin lock is held.
pub fn with_cpu<T, F>(id: usize, f: F) -> T
where
    F: FnOnce() -> T,
{
    struct Restore(usize);
    impl Drop for Restore {
        fn drop(&mut self) {
            CPU_ID.set(self.0);
        }
    }

    let _restore = Restore(CPU_ID.replace(id));
    f()
}
