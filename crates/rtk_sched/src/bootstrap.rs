//! Initial execution context of new threads.

use core::mem;

use rtk_params::{MIN_STACK_SIZE, STACK_ALIGN};

use crate::{
    error::ThreadError,
    platform::{FrameInit, InterruptFrame},
    thread::StackRegion,
};

/// Bytes an initial frame of type `F` occupies on the stack.
pub(crate) const fn frame_size<F>() -> usize {
    mem::size_of::<F>().next_multiple_of(STACK_ALIGN)
}

/// Writes the synthetic saved context of a new thread at the top of `stack`.
///
/// Returns the stack pointer that the context-restore path loads to start
/// the thread.
pub(crate) fn write_initial_frame<F>(
    stack: &StackRegion,
    init: &FrameInit,
) -> Result<usize, ThreadError>
where
    F: InterruptFrame,
{
    const {
        assert!(mem::align_of::<F>() <= STACK_ALIGN);
    }

    let top = stack.top() & !(STACK_ALIGN - 1);
    let sp = top
        .checked_sub(frame_size::<F>())
        .ok_or(ThreadError::InvalidStackSize)?;
    if sp < stack.base() || sp - stack.base() < MIN_STACK_SIZE {
        return Err(ThreadError::InvalidStackSize);
    }

    unsafe {
        stack
            .as_mut_ptr()
            .add(sp - stack.base())
            .cast::<F>()
            .write(F::new_thread(init));
    }
    Ok(sp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TestFrame {
        pc: usize,
        ra: usize,
        a: [usize; 4],
        user: bool,
    }

    impl InterruptFrame for TestFrame {
        fn new_thread(init: &FrameInit) -> Self {
            Self {
                pc: init.pc,
                ra: init.exit_handler,
                a: init.args,
                user: init.user_mode,
            }
        }
    }

    fn stack(size: usize) -> StackRegion {
        StackRegion::new(Box::leak(vec![0_u8; size].into_boxed_slice()))
    }

    const INIT: FrameInit = FrameInit {
        pc: 0x1000,
        exit_handler: 0x2000,
        args: [0x3000, 1, 2, 3],
        user_mode: true,
    };

    #[test]
    fn frame_sits_at_aligned_top() {
        let stack = stack(MIN_STACK_SIZE + 256);
        let sp = write_initial_frame::<TestFrame>(&stack, &INIT).unwrap();

        assert_eq!(sp % STACK_ALIGN, 0);
        assert!(sp + frame_size::<TestFrame>() <= stack.top());
        assert!(stack.top() - sp < frame_size::<TestFrame>() + STACK_ALIGN);

        let frame = unsafe {
            stack
                .as_mut_ptr()
                .add(sp - stack.base())
                .cast::<TestFrame>()
                .read()
        };
        assert_eq!(frame.pc, 0x1000);
        assert_eq!(frame.ra, 0x2000);
        assert_eq!(frame.a, [0x3000, 1, 2, 3]);
        assert!(frame.user);
    }

    #[test]
    fn small_stack_is_rejected() {
        let stack = stack(MIN_STACK_SIZE);
        assert_eq!(
            write_initial_frame::<TestFrame>(&stack, &INIT),
            Err(ThreadError::InvalidStackSize)
        );
    }
}
