//! Platform backends for the fiber context machinery.
//!
//! Unix targets use a hand-written callee-saved register switch over stacks
//! we map ourselves; Windows targets wrap the native fiber primitives, which
//! manage stacks and register state in the kernel. Both backends drive the
//! same suspend/resume protocol in [`crate::Fiber`].

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub(crate) use self::unix::Inner;
        pub(crate) use self::unix::{begin, resume, suspend};

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                #[path = "x86_64.rs"]
                mod arch;
            } else if #[cfg(target_arch = "aarch64")] {
                #[path = "aarch64.rs"]
                mod arch;
            } else {
                compile_error!("no fiber context switch for this architecture");
            }
        }

        /// A saved machine context: the stack pointer under which the
        /// callee-saved register frame was written.
        #[repr(C)]
        #[derive(Debug)]
        pub(crate) struct Context {
            stack_pointer: *mut u8,
        }

        impl Context {
            pub(crate) fn empty() -> Context {
                Context {
                    stack_pointer: std::ptr::null_mut(),
                }
            }
        }
    } else if #[cfg(windows)] {
        mod windows;
        pub(crate) use self::windows::Inner;
        pub(crate) use self::windows::{attach, begin, resume, suspend};
    } else {
        compile_error!("fibers are not supported on this platform");
    }
}
