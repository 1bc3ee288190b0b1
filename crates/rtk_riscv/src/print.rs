//! Formatted console output

use core::{
    fmt::{self, Write as _},
    sync::atomic::{AtomicBool, Ordering},
};

use irq_spin::{Interrupts as _, SpinLock, SpinLockGuard};

use crate::{interrupts::RiscvInterrupts, sbi};

pub static PANICKED: AtomicBool = AtomicBool::new(false);

// lock to avoid interleaving concurrent print's.
struct Print {
    locking: AtomicBool,
    lock: SpinLock<(), RiscvInterrupts>,
}

static PRINT: Print = Print {
    locking: AtomicBool::new(true),
    lock: SpinLock::new(()),
};

impl Print {
    fn lock(&self) -> Writer<'_> {
        let guard = self
            .locking
            .load(Ordering::Relaxed)
            .then(|| self.lock.lock());
        Writer { _guard: guard }
    }
}

struct Writer<'a> {
    _guard: Option<SpinLockGuard<'a, (), RiscvInterrupts>>,
}

impl fmt::Write for Writer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                sbi::console_putchar(b'\r');
            }
            sbi::console_putchar(b);
        }
        Ok(())
    }
}

pub fn _print(args: fmt::Arguments) {
    if PANICKED.load(Ordering::Relaxed) {
        crate::idle();
    }
    let mut writer = PRINT.lock();
    // `write_str` never fails. An error from a `Display` impl is dropped
    // rather than panicking from inside the panic handler's output path.
    let _ = writer.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::print::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    RiscvInterrupts::disable();
    PRINT.locking.store(false, Ordering::Relaxed);
    crate::println!("panic: {info}");
    PANICKED.store(true, Ordering::Relaxed); // freeze output from other harts
    crate::idle()
}
