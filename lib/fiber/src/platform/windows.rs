//! Windows backend: wraps the Win32 fiber primitives.
//!
//! The kernel owns the stacks and register state here, including guard
//! pages, so this backend has no stack region of its own. The float-switch
//! flag keeps x87/SSE state coherent across switches, matching what the
//! hand-written unix backend saves.

use std::ffi::c_void;
use std::io;
use std::ptr;

use windows_sys::Win32::System::Threading::{
    ConvertFiberToThread, ConvertThreadToFiberEx, CreateFiberEx, DeleteFiber, SwitchToFiber,
    FIBER_FLAG_FLOAT_SWITCH,
};

use crate::{Fiber, FiberError};

/// Stack commit size for job fibers, matching the unix backend's ten pages.
const STACK_COMMIT: usize = 10 * 4096;

/// Per-fiber platform state: the Win32 fiber handle.
#[derive(Debug)]
pub(crate) struct Inner {
    handle: *mut c_void,

    /// Adopted fibers came from `ConvertThreadToFiberEx` and are unwound
    /// with `ConvertFiberToThread` rather than `DeleteFiber`.
    adopted: bool,
}

impl Inner {
    /// Placeholder state; the handle is attached by [`attach`] once the
    /// owning `Fiber` has a stable address to hand to the kernel.
    pub(crate) fn new() -> Result<Inner, FiberError> {
        Ok(Inner {
            handle: ptr::null_mut(),
            adopted: false,
        })
    }

    /// Convert the current thread into a fiber.
    pub(crate) fn adopt() -> Result<Inner, FiberError> {
        let handle = unsafe { ConvertThreadToFiberEx(ptr::null(), FIBER_FLAG_FLOAT_SWITCH) };

        if handle.is_null() {
            return Err(FiberError::Create(io::Error::last_os_error()));
        }

        Ok(Inner {
            handle,
            adopted: true,
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe {
            if self.adopted {
                ConvertFiberToThread();
            } else if !self.handle.is_null() {
                DeleteFiber(self.handle);
            }
        }
    }
}

/// Create the kernel fiber for `fiber` once its address is final.
///
/// # Safety
///
/// `fiber` must stay at this address for the lifetime of the handle.
pub(crate) unsafe fn attach(fiber: *mut Fiber) -> Result<(), FiberError> {
    let handle = CreateFiberEx(
        STACK_COMMIT,
        0,
        FIBER_FLAG_FLOAT_SWITCH,
        Some(entry),
        fiber.cast(),
    );

    if handle.is_null() {
        return Err(FiberError::Create(io::Error::last_os_error()));
    }

    (*fiber).inner.handle = handle;
    Ok(())
}

/// Enter the fiber for the first time, kicking off its job.
///
/// Returns when the fiber completes or suspends.
///
/// # Safety
///
/// `fiber` must be live and unstarted, with scheduler bookkeeping for entry
/// already done.
pub(crate) unsafe fn begin(fiber: *mut Fiber) {
    SwitchToFiber((*fiber).inner.handle);
}

/// Switch back to the fiber that hosted this one.
///
/// Returns when the fiber is next resumed, possibly on a different OS
/// thread.
///
/// # Safety
///
/// Must be called from code running inside `fiber`, and `fiber.parent` must
/// be the adopted fiber of the current OS thread.
pub(crate) unsafe fn suspend(fiber: *mut Fiber) {
    SwitchToFiber((*(*fiber).parent).inner.handle);
}

/// Continue the fiber from where it suspended.
///
/// # Safety
///
/// `fiber` must be suspended, with scheduler bookkeeping for entry already
/// done.
pub(crate) unsafe fn resume(fiber: *mut Fiber) {
    SwitchToFiber((*fiber).inner.handle);
}

/// Start routine for every job fiber.
unsafe extern "system" fn entry(arg: *mut c_void) {
    let fiber = arg.cast::<Fiber>();

    crate::run_job(fiber);

    // Leave this fiber for good; the parent recorded at entry is the
    // adopted fiber of the thread currently hosting us.
    SwitchToFiber((*(*fiber).parent).inner.handle);
}
