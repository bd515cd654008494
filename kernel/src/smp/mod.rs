//! Symmetric multiprocessing: per-CPU state, cross-CPU calls, and
//! application-processor bring-up.

pub mod bringup;
pub mod percpu;
pub mod remotecall;

use alloc::vec::Vec;

use crate::arch::x86_64::idt;
use crate::config::VECTOR_REMOTE_CALL;
use crate::mm::addr::VirtAddr;

/// Registers the remote-call interrupt handler and populates the
/// per-CPU table. Must run once, on the bootstrap processor, after the
/// heap is initialised and before any application processor is woken.
pub fn init(kernel_stack_tops: Vec<VirtAddr>) {
    percpu::init(kernel_stack_tops);
    idt::register_handler(VECTOR_REMOTE_CALL, remotecall::handle_remote_call_interrupt);
}
