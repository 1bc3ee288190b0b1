//! Thread descriptors and the fixed thread table.

use core::{
    cell::UnsafeCell,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use rtk_params::{IDLE_PRIORITY, MAX_CPUS, MAX_THREADS};

use crate::{CpuId, Priority, cpu::RunQueue};

/// Entry point of a thread, called with its three arguments.
pub type ThreadEntry = fn(usize, usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Suspended,
    Terminated,
}

impl ThreadState {
    /// Returns `true` if the thread sits in a ready queue or on a core.
    #[must_use]
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

/// Cores a thread may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affinity {
    #[default]
    Floating,
    Pinned(CpuId),
}

impl Affinity {
    #[must_use]
    pub fn allows(self, cpu: CpuId) -> bool {
        match self {
            Self::Floating => true,
            Self::Pinned(pinned) => pinned == cpu,
        }
    }

    #[must_use]
    pub fn pinned(self) -> Option<CpuId> {
        match self {
            Self::Floating => None,
            Self::Pinned(cpu) => Some(cpu),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// Terminating the thread is a fatal error.
        const ESSENTIAL = 1 << 0;
        /// Runs unprivileged.
        const USER = 1 << 2;
        /// Stays suspended after creation until resumed.
        const START_SUSPENDED = 1 << 8;
    }
}

/// Scheduling parameters of a thread being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadOptions {
    pub priority: Priority,
    pub flags: ThreadFlags,
    pub affinity: Affinity,
}

impl ThreadOptions {
    #[must_use]
    pub const fn new(priority: Priority) -> Self {
        Self {
            priority,
            flags: ThreadFlags::empty(),
            affinity: Affinity::Floating,
        }
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: ThreadFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn pinned(mut self, cpu: CpuId) -> Self {
        self.affinity = Affinity::Pinned(cpu);
        self
    }
}

/// Memory handed over to a thread (or a starting core) as its stack.
#[derive(Debug)]
pub struct StackRegion {
    base: NonNull<u8>,
    size: usize,
}

// The region is exclusively owned, like the `&'static mut` it came from.
unsafe impl Send for StackRegion {}

impl StackRegion {
    pub fn new(mem: &'static mut [u8]) -> Self {
        let size = mem.len();
        Self {
            base: NonNull::from(mem).cast(),
            size,
        }
    }

    /// # Safety
    ///
    /// `base..base + size` must be writable memory owned by nothing else for
    /// as long as the region (or a thread using it) lives.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    #[must_use]
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.base, self.size)
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base.as_ptr().addr()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the highest address of the region.
    #[must_use]
    pub fn top(&self) -> usize {
        self.base() + self.size
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

/// Generation-checked reference to a thread table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    index: u16,
    generation: u32,
}

impl ThreadHandle {
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.index)
    }

    pub(crate) fn id(self) -> ThreadId {
        ThreadId(self.index)
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}.{}", self.index, self.generation)
    }
}

/// Index into the thread table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThreadId(u16);

impl ThreadId {
    /// The idle thread of `cpu` lives in slot `cpu`.
    #[expect(clippy::cast_possible_truncation)]
    pub(crate) const fn idle(cpu: CpuId) -> Self {
        assert!(cpu < MAX_CPUS);
        Self(cpu as u16)
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }

    pub(crate) fn is_idle(self) -> bool {
        self.index() < MAX_CPUS
    }

    fn from_index(index: usize) -> Self {
        Self(u16::try_from(index).unwrap_or(u16::MAX))
    }
}

/// Scheduler-owned part of a thread.
///
/// Read and written only with the run queue lock of the thread's home core
/// held.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchedInfo {
    pub(crate) state: ThreadState,
    pub(crate) priority: Priority,
    pub(crate) affinity: Affinity,
    pub(crate) flags: ThreadFlags,
    /// FIFO stamp among equal priorities.
    pub(crate) seq: u64,
    pub(crate) saved_sp: usize,
    /// Set until the synthetic initial frame has been restored.
    pub(crate) first_run: bool,
    pub(crate) stack_base: usize,
    pub(crate) stack_size: usize,
}

impl SchedInfo {
    const EMPTY: Self = Self {
        state: ThreadState::Terminated,
        priority: IDLE_PRIORITY,
        affinity: Affinity::Floating,
        flags: ThreadFlags::empty(),
        seq: 0,
        saved_sp: 0,
        first_run: false,
        stack_base: 0,
        stack_size: 0,
    };

    pub(crate) fn is_user(&self) -> bool {
        self.flags.contains(ThreadFlags::USER)
    }
}

struct ThreadSlot {
    claimed: AtomicBool,
    generation: AtomicU32,
    /// Core whose run queue lock protects `info`.
    ///
    /// Changed only while holding the locks of both the old and the new
    /// home.
    home: AtomicUsize,
    info: UnsafeCell<SchedInfo>,
    stack: UnsafeCell<Option<StackRegion>>,
}

// `info` and `stack` are guarded by the home core's run queue lock.
unsafe impl Sync for ThreadSlot {}

impl ThreadSlot {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            home: AtomicUsize::new(0),
            info: UnsafeCell::new(SchedInfo::EMPTY),
            stack: UnsafeCell::new(None),
        }
    }
}

pub(crate) struct ThreadTable {
    slots: [ThreadSlot; MAX_THREADS],
}

impl ThreadTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { ThreadSlot::new() }; MAX_THREADS],
        }
    }

    fn slot(&self, id: ThreadId) -> &ThreadSlot {
        &self.slots[id.index()]
    }

    /// Claims a free slot past the idle threads.
    pub(crate) fn allocate(&self) -> Option<ThreadId> {
        (MAX_CPUS..MAX_THREADS)
            .find(|&i| {
                self.slots[i]
                    .claimed
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            })
            .map(ThreadId::from_index)
    }

    pub(crate) fn handle(&self, id: ThreadId) -> ThreadHandle {
        ThreadHandle {
            index: id.0,
            generation: self.slot(id).generation.load(Ordering::Acquire),
        }
    }

    /// Returns `true` if `handle` still names the thread it was issued for.
    pub(crate) fn is_live(&self, handle: ThreadHandle) -> bool {
        let Some(slot) = self.slots.get(handle.index()) else {
            return false;
        };
        slot.claimed.load(Ordering::Acquire)
            && slot.generation.load(Ordering::Acquire) == handle.generation
    }

    pub(crate) fn home(&self, id: ThreadId) -> CpuId {
        self.slot(id).home.load(Ordering::Acquire)
    }

    pub(crate) fn info(&self, id: ThreadId, rq: &RunQueue) -> SchedInfo {
        debug_assert_eq!(self.home(id), rq.cpu, "{id:?} read under a foreign lock");
        unsafe { *self.slot(id).info.get() }
    }

    pub(crate) fn set_info(&self, id: ThreadId, rq: &RunQueue, info: SchedInfo) {
        debug_assert_eq!(self.home(id), rq.cpu, "{id:?} written under a foreign lock");
        unsafe { *self.slot(id).info.get() = info }
    }

    /// Initializes a freshly claimed slot homed on `rq`'s core.
    pub(crate) fn install(
        &self,
        id: ThreadId,
        rq: &RunQueue,
        info: SchedInfo,
        stack: Option<StackRegion>,
    ) {
        let slot = self.slot(id);
        slot.home.store(rq.cpu, Ordering::Release);
        unsafe {
            *slot.info.get() = info;
            *slot.stack.get() = stack;
        }
    }

    /// Creates the idle thread of `rq`'s core, running.
    pub(crate) fn install_idle(&self, rq: &RunQueue) {
        let id = ThreadId::idle(rq.cpu);
        self.slot(id).claimed.store(true, Ordering::Release);
        self.install(
            id,
            rq,
            SchedInfo {
                state: ThreadState::Running,
                affinity: Affinity::Pinned(rq.cpu),
                flags: ThreadFlags::ESSENTIAL,
                ..SchedInfo::EMPTY
            },
            None,
        );
    }

    /// Moves the lock protecting `id` from `from`'s core to `to`'s core.
    pub(crate) fn rehome(&self, id: ThreadId, from: &RunQueue, to: &RunQueue) {
        debug_assert_eq!(self.home(id), from.cpu);
        self.slot(id).home.store(to.cpu, Ordering::Release);
    }

    /// Returns the slot to the free pool and gives back its stack.
    pub(crate) fn free(&self, id: ThreadId, rq: &RunQueue) -> Option<StackRegion> {
        debug_assert_eq!(self.home(id), rq.cpu);
        let slot = self.slot(id);
        let stack = unsafe { (*slot.stack.get()).take() };
        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.claimed.store(false, Ordering::Release);
        stack
    }

    /// Releases a slot that was never handed out.
    pub(crate) fn abandon(&self, id: ThreadId) {
        self.slot(id).claimed.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ThreadTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self
            .slots
            .iter()
            .filter(|slot| slot.claimed.load(Ordering::Relaxed))
            .count();
        f.debug_struct("ThreadTable")
            .field("used", &used)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_region_bounds() {
        let mem: &'static mut [u8] = Box::leak(vec![0_u8; 1024].into_boxed_slice());
        let base = mem.as_ptr().addr();
        let region = StackRegion::new(mem);
        assert_eq!(region.base(), base);
        assert_eq!(region.size(), 1024);
        assert_eq!(region.top(), base + 1024);
    }

    #[test]
    fn allocation_skips_idle_slots() {
        let table = ThreadTable::new();
        let id = table.allocate().unwrap();
        assert_eq!(id.index(), MAX_CPUS);
        let handle = table.handle(id);
        assert!(table.is_live(handle));
        table.abandon(id);
        assert!(!table.is_live(handle));
    }

    #[test]
    fn freeing_invalidates_handles() {
        let table = ThreadTable::new();
        let rq = RunQueue::new(0);
        let id = table.allocate().unwrap();
        table.install(id, &rq, SchedInfo::EMPTY, None);
        let old = table.handle(id);

        assert!(table.free(id, &rq).is_none());
        assert!(!table.is_live(old));

        let again = table.allocate().unwrap();
        assert_eq!(again, id);
        assert_ne!(table.handle(again), old);
    }

    #[test]
    fn table_fills_up() {
        let table = ThreadTable::new();
        for _ in MAX_CPUS..MAX_THREADS {
            assert!(table.allocate().is_some());
        }
        assert!(table.allocate().is_none());
    }

    #[test]
    fn affinity_filters_cpus() {
        assert!(Affinity::Floating.allows(3));
        assert!(Affinity::Pinned(1).allows(1));
        assert!(!Affinity::Pinned(1).allows(0));
        assert_eq!(ThreadOptions::new(4).pinned(2).affinity.pinned(), Some(2));
    }
}
