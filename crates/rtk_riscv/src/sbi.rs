//! Supervisor Binary Interface calls into the machine-mode firmware.

use core::arch::asm;

use strum::FromRepr;

const EID_CONSOLE_PUTCHAR: usize = 0x01;
const EID_TIME: usize = 0x5449_4d45;
const EID_IPI: usize = 0x0073_5049;
const EID_HSM: usize = 0x0048_534d;

const FID_SET_TIMER: usize = 0;
const FID_SEND_IPI: usize = 0;
const FID_HART_START: usize = 0;
const FID_HART_GET_STATUS: usize = 2;

#[repr(isize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, thiserror::Error)]
pub enum SbiError {
    #[error("failed")]
    Failed = -1,
    #[error("not supported")]
    NotSupported = -2,
    #[error("invalid parameter")]
    InvalidParam = -3,
    #[error("denied")]
    Denied = -4,
    #[error("invalid address")]
    InvalidAddress = -5,
    #[error("already available")]
    AlreadyAvailable = -6,
    #[error("already started")]
    AlreadyStarted = -7,
    #[error("already stopped")]
    AlreadyStopped = -8,
}

/// State reported by `hart_get_status`.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum HartStatus {
    Started = 0,
    Stopped = 1,
    StartPending = 2,
    StopPending = 3,
    Suspended = 4,
    SuspendPending = 5,
    ResumePending = 6,
}

fn call(eid: usize, fid: usize, args: [usize; 3]) -> Result<usize, SbiError> {
    let error: usize;
    let value: usize;
    unsafe {
        asm!(
            "ecall",
            inlateout("a0") args[0] => error,
            inlateout("a1") args[1] => value,
            in("a2") args[2],
            in("a6") fid,
            in("a7") eid,
        );
    }
    if error == 0 {
        return Ok(value);
    }
    Err(SbiError::from_repr(error.cast_signed()).unwrap_or(SbiError::Failed))
}

/// Programs the next timer interrupt of the calling hart.
pub fn set_timer(stime: u64) -> Result<(), SbiError> {
    let stime = usize::try_from(stime).map_err(|_| SbiError::InvalidParam)?;
    call(EID_TIME, FID_SET_TIMER, [stime, 0, 0]).map(drop)
}

/// Raises the supervisor software interrupt of `hart`.
pub fn send_ipi(hart: usize) -> Result<(), SbiError> {
    call(EID_IPI, FID_SEND_IPI, [1, hart, 0]).map(drop)
}

/// Starts `hart` in supervisor mode at `start_addr` with `a0 = hart` and
/// `a1 = opaque`.
pub fn hart_start(hart: usize, start_addr: usize, opaque: usize) -> Result<(), SbiError> {
    call(EID_HSM, FID_HART_START, [hart, start_addr, opaque]).map(drop)
}

pub fn hart_status(hart: usize) -> Result<HartStatus, SbiError> {
    let status = call(EID_HSM, FID_HART_GET_STATUS, [hart, 0, 0])?;
    HartStatus::from_repr(status).ok_or(SbiError::Failed)
}

/// Legacy console output, available on every firmware.
pub fn console_putchar(c: u8) {
    let _ = call(EID_CONSOLE_PUTCHAR, 0, [c.into(), 0, 0]);
}
