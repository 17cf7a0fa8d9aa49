//! A thread wrapper with core-affinity binding.
//!
//! In general this is an internal building block; for parallelising work
//! use a [`JobSystem`](crate::JobSystem) instead.

use std::thread::{self, JoinHandle};

use log::warn;

use crate::error::Error;

/// An OS thread running a supplied function.
///
/// Construction goes through [`Thread::spawn`] so that a failure to create
/// the underlying thread surfaces as an [`Error`] instead of a panic.
#[derive(Debug)]
pub struct Thread {
    /// Internal thread handle.
    handle: JoinHandle<()>,
}

impl Thread {
    /// Spawn a thread running `function`.
    pub fn spawn<F>(function: F) -> Result<Thread, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .spawn(function)
            .map_err(Error::ThreadSpawn)?;

        Ok(Thread { handle })
    }

    /// Block and wait for this thread to finish executing.
    ///
    /// A panic on the thread is reported rather than propagated; joining
    /// happens on shutdown paths where unwinding again would abort.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("joined a thread that panicked");
        }
    }

    /// Bind this thread so it only executes on the given core, preventing
    /// the kernel from migrating it.
    ///
    /// Depending on the platform this may be a suggestion to the kernel
    /// rather than a guarantee, or (where no affinity interface exists) a
    /// no-op. Returns whether the request was accepted.
    pub fn bind_to_core(&self, core: usize) -> bool {
        self.bind_to_core_impl(core)
    }

    #[cfg(target_os = "linux")]
    fn bind_to_core_impl(&self, core: usize) -> bool {
        use std::os::unix::thread::JoinHandleExt;

        // Safety: cpu_set_t is plain data; the pthread_t stays valid while
        // we hold the join handle.
        unsafe {
            let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut cpu_set);
            libc::CPU_SET(core, &mut cpu_set);

            let result = libc::pthread_setaffinity_np(
                self.handle.as_pthread_t(),
                std::mem::size_of::<libc::cpu_set_t>(),
                &cpu_set,
            );

            if result != 0 {
                warn!(
                    "failed to bind thread to core {}: {}",
                    core,
                    std::io::Error::from_raw_os_error(result)
                );
                return false;
            }

            true
        }
    }

    #[cfg(windows)]
    fn bind_to_core_impl(&self, core: usize) -> bool {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::System::Threading::SetThreadAffinityMask;

        // Safety: the handle stays valid while we hold the join handle.
        unsafe {
            let previous = SetThreadAffinityMask(self.handle.as_raw_handle(), 1 << core);

            if previous == 0 {
                warn!(
                    "failed to bind thread to core {}: {}",
                    core,
                    std::io::Error::last_os_error()
                );
                return false;
            }

            true
        }
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    fn bind_to_core_impl(&self, _core: usize) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_supplied_function() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let thread = Thread::spawn(move || flag.store(true, Ordering::SeqCst)).unwrap();
        thread.join();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn binds_to_core_zero() {
        use std::sync::mpsc;

        let (release, wait) = mpsc::channel::<()>();

        // Keep the thread alive until after the bind so the pthread_t is
        // valid for the whole call.
        let thread = Thread::spawn(move || {
            let _ = wait.recv();
        })
        .unwrap();

        assert!(thread.bind_to_core(0));

        release.send(()).unwrap();
        thread.join();
    }
}
