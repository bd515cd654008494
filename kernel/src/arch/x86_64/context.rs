//! Low-level kernel stack/register swap.
//!
//! Direct port of the stack-swap half of `kernel/sched/process.cpp`'s
//! `contextSwitch`: six callee-saved registers are pushed onto the
//! current stack, the stack pointer is stashed into `*prev_rsp`, the
//! new stack pointer is loaded from `next_rsp`, and the six registers
//! are popped back off — landing wherever that stack was last switched
//! away from (or, for a freshly-created process, the fake frame built
//! by `Process::new_with_entry`).
//!
//! Written with `global_asm!` rather than a normal Rust function body so
//! no compiler-generated prologue/epilogue can disturb the exact stack
//! layout the fake initial frame depends on.

core::arch::global_asm!(
    ".global switch_stack",
    "switch_stack:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
);

extern "C" {
    /// Saves the current callee-saved registers and stack pointer to
    /// `*prev_rsp`, then switches to `next_rsp` and restores its saved
    /// registers.
    ///
    /// # Safety
    /// `next_rsp` must point at a stack previously prepared either by a
    /// prior call to this function switching away from it, or by
    /// `Process::new_with_entry`'s fake initial frame. `prev_rsp` must
    /// be valid to write a `u64` through.
    pub fn switch_stack(prev_rsp: *mut u64, next_rsp: u64);
}
