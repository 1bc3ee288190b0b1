#![no_std]

/// Maximum number of CPUs.
pub const MAX_CPUS: usize = 8;

/// Maximum number of threads, including one idle thread per CPU.
pub const MAX_THREADS: usize = 64;

/// Number of priority levels. Lower value is higher priority.
pub const NUM_PRIORITIES: u8 = 32;

/// Priority reserved for the per-CPU idle threads.
pub const IDLE_PRIORITY: u8 = NUM_PRIORITIES - 1;

/// Lowest priority an application thread may use.
pub const LOWEST_THREAD_PRIORITY: u8 = IDLE_PRIORITY - 1;

/// Alignment of every initial stack pointer.
pub const STACK_ALIGN: usize = 16;

/// Smallest stack accepted by thread creation, excluding the initial frame.
pub const MIN_STACK_SIZE: usize = 512;

/// Number of spin iterations the primary CPU waits for a secondary to come
/// alive before giving up.
pub const BRINGUP_SPIN_LIMIT: u64 = 100_000_000;

/// Number of arguments passed to a thread entry function.
pub const THREAD_ARGS: usize = 3;
