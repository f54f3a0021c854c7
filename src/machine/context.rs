/*
 * CPU Context
 *
 * Cooperative context switching for kernel threads. A CpuContext holds the
 * callee-saved registers of the System V x86_64 ABI plus the stack pointer
 * and resume address; everything caller-saved is dead across the explicit
 * call into `switch`, so this is all that must survive.
 *
 * The scheduler treats this type as opaque: it prepares a context for a new
 * thread with `prepare` and hands pairs of raw pointers to `switch`. The
 * pointers must stay valid for the duration of the switch, which is why TCBs
 * are boxed and never move.
 */

use core::arch::naked_asm;

/// Callee-saved register context of a suspended kernel thread.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuContext {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl CpuContext {
    /// A zeroed context. Used for threads whose context is filled in by the
    /// first switch away from them (the boot/idle context of a core).
    pub const fn empty() -> Self {
        CpuContext {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Build the initial context of a fresh thread.
    ///
    /// `stack_top` is the highest address of the thread's stack; `entry` is
    /// entered the first time the context is switched to and must not return.
    /// The stack pointer lands 8 below a 16-byte boundary, the shape a
    /// function entered by `call` expects.
    pub fn prepare(stack_top: usize, entry: extern "C" fn() -> !) -> Self {
        let rsp = ((stack_top as u64) & !0xF) - 8;
        CpuContext {
            rsp,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: entry as usize as u64,
        }
    }
}

/// Suspend the current thread into `from` and resume `to`.
///
/// Saves the callee-saved registers and a resume address into `from`, then
/// loads `to` and jumps to its saved rip. Control returns from this function
/// only when some other core/thread later switches back into `from`.
///
/// # Safety
/// Both pointers must reference live, properly initialized CpuContext values
/// whose stacks remain allocated until the switch completes. Must be called
/// with preemption off; the new thread is responsible for re-enabling it.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(from: *mut CpuContext, to: *const CpuContext) {
    naked_asm!(
        // Stash the outgoing thread: rdi = from.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // The outgoing thread resumes at the local label below.
        "lea rax, [rip + 3f]",
        "mov [rdi + 0x38], rax",
        // Bring in the incoming thread: rsi = to.
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        // Resume point for the outgoing thread, possibly much later.
        "3:",
        "ret",
    );
}
