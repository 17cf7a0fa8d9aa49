//! Context switching for x86-64 System V targets.
//!
//! A saved context is nothing more than a stack pointer. Switching pushes
//! the callee-saved state onto the current stack, records the resulting
//! stack pointer, adopts the target context's stack pointer, pops the state
//! that was saved there and returns through the return address that comes
//! with it. The caller-saved half of the register file needs no help: to the
//! compiler these are ordinary `extern "C"` calls.
//!
//! The saved frame, from low to high addresses:
//!
//! ```text
//! sp -> [ mxcsr | fpcw ] [ r15 ] [ r14 ] [ r13 ] [ r12 ] [ rbx ] [ rbp ] [ ret ]
//! ```

use core::arch::naked_asm;

use super::Context;

/// Save the current execution context into `from` and continue from the one
/// saved in `to`.
///
/// Returns when something later switches or restores back into `from`,
/// possibly on a different OS thread.
///
/// # Safety
///
/// `to` must hold a context previously saved by [`switch_context`] or
/// [`start_context`] on a stack that is still live.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(from: *mut Context, to: *const Context) {
    naked_asm!(
        // Callee-saved state of the outgoing context.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr [rsp]",
        "fnstcw [rsp + 4]",
        "mov [rdi], rsp",
        // Adopt the incoming context's stack and unwind its saved state.
        "mov rsp, [rsi]",
        "ldmxcsr [rsp]",
        "fldcw [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Continue from the context saved in `to`, discarding the current one.
///
/// Used on the completion path of a fiber, where the stack being abandoned
/// will never be executed again.
///
/// # Safety
///
/// Same requirements as [`switch_context`].
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(to: *const Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi]",
        "ldmxcsr [rsp]",
        "fldcw [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Save the current execution context into `from`, then call `entry(arg)` on
/// the fresh stack whose high end is `stack_top`.
///
/// `entry` must never return; a fiber leaves its stack only through
/// [`switch_context`] or [`restore_context`].
///
/// # Safety
///
/// `stack_top` must be the top of an unused region with enough room for
/// `entry` and everything it calls.
#[unsafe(naked)]
pub unsafe extern "C" fn start_context(
    from: *mut Context,
    stack_top: *mut u8,
    entry: unsafe extern "C" fn(*mut core::ffi::c_void) -> !,
    arg: *mut core::ffi::c_void,
) {
    naked_asm!(
        // Save the caller exactly as switch_context would, so the fiber can
        // switch or restore back into it with the common frame layout.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr [rsp]",
        "fnstcw [rsp + 4]",
        "mov [rdi], rsp",
        // Move onto the fiber's stack. Alignment keeps the ABI contract for
        // entry; a zeroed frame pointer terminates backtraces at the switch.
        "mov rsp, rsi",
        "and rsp, -16",
        "xor ebp, ebp",
        "mov rdi, rcx",
        "call rdx",
        // entry never returns.
        "ud2",
    )
}
