//! Unix backend: fibers run on stacks we map ourselves and switch with the
//! arch-specific context routines.

use std::ffi::c_void;

use super::{arch, Context};
use crate::stack::StackRegion;
use crate::{Fiber, FiberError};

/// Number of usable pages in a fiber stack. Generous for job code; the guard
/// pages catch anything that outgrows it.
const STACK_PAGES: usize = 10;

/// Per-fiber platform state: the stack and the two context slots.
///
/// `context` is the pre-job slot. It always holds the saved state of the OS
/// thread currently hosting the fiber, written by [`begin`] or [`resume`],
/// and is where the fiber lands when it completes or suspends. `suspended`
/// holds the fiber's own mid-job state between a suspend and the matching
/// resume.
#[derive(Debug)]
pub(crate) struct Inner {
    stack: Option<StackRegion>,
    context: Context,
    suspended: Context,
}

impl Inner {
    /// Platform state for a fiber with its own stack.
    pub(crate) fn new() -> Result<Inner, FiberError> {
        Ok(Inner {
            stack: Some(StackRegion::new(STACK_PAGES)?),
            context: Context::empty(),
            suspended: Context::empty(),
        })
    }

    /// Platform state for a thread adopted as a fiber. An adopted fiber only
    /// serves as a landing context, so it owns no stack of its own.
    pub(crate) fn adopt() -> Result<Inner, FiberError> {
        Ok(Inner {
            stack: None,
            context: Context::empty(),
            suspended: Context::empty(),
        })
    }
}

/// Save the caller into the fiber's pre-job slot and enter the job on the
/// fiber's own stack.
///
/// Returns when the fiber completes or suspends.
///
/// # Safety
///
/// `fiber` must be a live, unstarted fiber constructed with [`Inner::new`],
/// with all scheduler bookkeeping for entry already done.
pub(crate) unsafe fn begin(fiber: *mut Fiber) {
    let stack_top = (*fiber)
        .inner
        .stack
        .as_ref()
        .expect("started a fiber with no stack")
        .top();

    arch::start_context(
        &raw mut (*fiber).inner.context,
        stack_top,
        entry,
        fiber.cast(),
    );
}

/// Save the fiber's mid-job state and continue from the pre-job slot.
///
/// Returns when the fiber is next resumed, possibly on a different OS
/// thread.
///
/// # Safety
///
/// Must be called from code running on `fiber`'s own stack.
pub(crate) unsafe fn suspend(fiber: *mut Fiber) {
    arch::switch_context(
        &raw mut (*fiber).inner.suspended,
        &raw const (*fiber).inner.context,
    );
}

/// Save the caller into the fiber's pre-job slot and continue the fiber from
/// where it suspended.
///
/// Returns when the fiber completes or suspends again.
///
/// # Safety
///
/// `fiber` must hold a saved suspended context, with all scheduler
/// bookkeeping for entry already done.
pub(crate) unsafe fn resume(fiber: *mut Fiber) {
    arch::switch_context(
        &raw mut (*fiber).inner.context,
        &raw const (*fiber).inner.suspended,
    );
}

/// First frame on every fiber stack. Runs the job, then leaves the stack for
/// good through the pre-job slot.
unsafe extern "C" fn entry(arg: *mut c_void) -> ! {
    let fiber = arg.cast::<Fiber>();

    crate::run_job(fiber);

    // The job is done and the thread identity is restored; nothing will
    // ever execute on this stack again.
    arch::restore_context(&raw const (*fiber).inner.context)
}
