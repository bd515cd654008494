//! Kernel process abstraction: an address space, a kernel stack, and a
//! saved stack pointer, with cooperative context switching.
//!
//! Ported from `kernel/sched/process.cpp`/`include/sched/process.hpp`.
//! Scheduling policy itself (what runs next, preemption) is an explicit
//! Non-goal; this module only provides the primitive a scheduler would
//! be built on top of.

use core::sync::atomic::Ordering;

use crate::arch::x86_64::context::switch_stack;
use crate::error::Result;
use crate::mm::addr::VirtAddr;
use crate::mm::vas::AddrSpace;
use crate::mm::{self, page_table::FrameSource};
use crate::util::atomic::Atomic;

/// Monotonically increasing, globally unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

static NEXT_PID: Atomic<u64> = Atomic::new(0);

impl ProcessId {
    fn next() -> Self {
        ProcessId(NEXT_PID.increment())
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A process's run state. Only the transitions listed under
/// [`Process::set_state`] are legal; anything else is a scheduler bug
/// and panics rather than silently corrupting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Blocked,
    Ready,
    Running,
}

pub struct Process {
    id: ProcessId,
    addr_space: AddrSpace,
    kernel_stack_top: VirtAddr,
    saved_kernel_rsp: u64,
    state: ProcessState,
}

/// Number of callee-saved registers `arch::x86_64::context::switch_stack`
/// pushes/pops: rbx, rbp, r12, r13, r14, r15.
const SAVED_REGISTER_COUNT: u64 = 6;

impl Process {
    /// Creates a new, otherwise-idle process with its own address space
    /// and kernel stack. Its saved stack pointer is uninitialised; use
    /// [`Process::new_with_entry`] to build one ready to run.
    pub fn new(frames: &mut dyn FrameSource) -> Result<Self> {
        let id = ProcessId::next();
        let addr_space = AddrSpace::new(frames)?;
        let kernel_stack_top = mm::allocate_kernel_stack(id.as_u64())?;
        Ok(Process {
            id,
            addr_space,
            kernel_stack_top,
            saved_kernel_rsp: 0,
            state: ProcessState::Blocked,
        })
    }

    /// Creates a process whose kernel stack is pre-seeded with a fake
    /// call frame, so that the first `context_switch` into it lands
    /// directly at `entry` as if `switch_stack` had returned into it.
    ///
    /// The fake frame mirrors exactly what a real `switch_stack` call
    /// leaves behind: six zeroed callee-saved registers below a return
    /// address. Two return addresses are pushed beneath it — the
    /// innermost one is `entry` itself (what the `ret` in `switch_stack`
    /// lands on), and below that is `limbo`, which the process's own
    /// `ret` falls into if `entry` ever returns instead of exiting.
    pub fn new_with_entry(frames: &mut dyn FrameSource, entry: extern "C" fn() -> !) -> Result<Self> {
        let mut process = Self::new(frames)?;

        let stack_top = process.kernel_stack_top.as_u64();
        // SAFETY: `stack_top` is the top of a stack this process
        // exclusively owns and that nothing has run on yet.
        unsafe {
            let mut sp = stack_top;

            sp -= 8;
            (sp as *mut u64).write(limbo as usize as u64);

            sp -= 8;
            (sp as *mut u64).write(entry as usize as u64);

            for _ in 0..SAVED_REGISTER_COUNT {
                sp -= 8;
                (sp as *mut u64).write(0);
            }

            process.saved_kernel_rsp = sp;
        }

        process.set_state(ProcessState::Ready);
        Ok(process)
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn addr_space(&self) -> &AddrSpace {
        &self.addr_space
    }

    /// Transitions this process to `new_state`.
    ///
    /// # Panics
    /// Panics on any transition outside the 3-state machine this
    /// kernel supports: `Blocked -> Ready`, `Ready -> Running`,
    /// `Running -> Ready`, `Running -> Blocked`, `Blocked -> Blocked`
    /// (renewed block reason) — anything else, including `Blocked ->
    /// Running` directly, is a scheduler bug.
    pub fn set_state(&mut self, new_state: ProcessState) {
        use ProcessState::*;
        let legal = matches!(
            (self.state, new_state),
            (Blocked, Ready) | (Ready, Running) | (Running, Ready) | (Running, Blocked) | (Blocked, Blocked)
        );
        assert!(legal, "illegal process state transition: {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
    }
}

/// Jumps into `p` for the very first time: there is no currently-running
/// `Process` to save state into, so the caller's register state is
/// discarded rather than stashed anywhere. Used to start the first
/// process on a CPU out of an idle/bootstrap context that is not itself
/// a `Process`.
///
/// # Safety
/// This CPU must not already be executing inside a `Process` — whatever
/// the caller was doing is abandoned, not resumed.
pub unsafe fn jump_to_context(p: &mut Process) -> ! {
    assert_eq!(p.state, ProcessState::Ready, "jump_to_context requires a Ready process");
    p.state = ProcessState::Running;
    p.addr_space.switch();
    let mut discarded_rsp: u64 = 0;
    // SAFETY: `p.saved_kernel_rsp` was produced by `new_with_entry`'s
    // fake frame; the discarded previous stack pointer is never used
    // since nothing switches back to this call site.
    unsafe {
        switch_stack(&mut discarded_rsp, p.saved_kernel_rsp);
    }
    unreachable!("switch_stack does not return into jump_to_context's caller")
}

/// Switches from `current`'s kernel stack to `to`'s, loading `to`'s
/// address space first.
///
/// `current` must be `Running` or `Blocked`: a `Running` process is
/// demoted to `Ready` (it is being pre-empted or is yielding), while a
/// `Blocked` process is left alone (it is being switched away from
/// because it blocked, not because it is still runnable). `to` must be
/// `Ready` and is promoted to `Running`.
///
/// # Safety
/// `current` must be the process presently executing on this CPU, and
/// neither process may be concurrently switched to or from on another
/// CPU.
pub unsafe fn context_switch(current: &mut Process, to: &mut Process) {
    assert!(
        matches!(current.state, ProcessState::Running | ProcessState::Blocked),
        "context_switch: current process in illegal state {:?}",
        current.state
    );
    assert_eq!(
        to.state,
        ProcessState::Ready,
        "context_switch: target process must be Ready, was {:?}",
        to.state
    );
    if current.state == ProcessState::Running {
        current.set_state(ProcessState::Ready);
    }
    to.set_state(ProcessState::Running);

    to.addr_space.switch();
    let prev_rsp_slot = &mut current.saved_kernel_rsp as *mut u64;
    let next_rsp = to.saved_kernel_rsp;
    // SAFETY: `to.saved_kernel_rsp` was either produced by
    // `new_with_entry`'s fake frame or by a prior `switch_stack` call
    // that switched away from `to`; forwarded from this function's own
    // safety contract for single ownership.
    unsafe {
        switch_stack(prev_rsp_slot, next_rsp);
    }
}

/// Where control lands if a process entry function returns instead of
/// exiting through the scheduler. There is nowhere sensible to return
/// to, so this is a bug.
extern "C" fn limbo() -> ! {
    panic!("process returned from its entry function");
}
