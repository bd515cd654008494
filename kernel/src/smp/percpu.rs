//! Per-CPU data table.
//!
//! Field set and the re-entrant "already draining" guard are a direct
//! port of `kernel/smp/percpu.cpp` / `include/smp/percpu.hpp`.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::mm::addr::VirtAddr;
use crate::sync::{OnceCell, SpinLock};

/// A remote-call descriptor: a type-erased, zero-argument closure
/// queued for execution on a specific CPU. See `smp::remotecall` for
/// how these are constructed.
pub trait RemoteCall: Send {
    fn invoke(self: Box<Self>);
}

impl<F: FnOnce() + Send> RemoteCall for F {
    fn invoke(self: Box<Self>) {
        (*self)()
    }
}

pub struct PerCpuData {
    pub kernel_stack_top: VirtAddr,
    remote_call_queue: SpinLock<VecDeque<Box<dyn RemoteCall>>>,
    draining: AtomicBool,
}

impl PerCpuData {
    fn new(kernel_stack_top: VirtAddr) -> Self {
        PerCpuData {
            kernel_stack_top,
            remote_call_queue: SpinLock::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub(crate) fn enqueue(&self, call: Box<dyn RemoteCall>) {
        self.remote_call_queue.lock().push_back(call);
    }

    /// Drains the remote-call queue in strict FIFO order.
    ///
    /// If another invocation of this function is already draining this
    /// CPU's queue (re-entered from within a call's own execution, e.g.
    /// because the handler itself enqueues further work and the IPI
    /// fires again before the outer drain returns), this call returns
    /// immediately — the outer drain's loop will pick up the newly
    /// enqueued entries, preserving FIFO order.
    pub fn drain_remote_calls(&self) {
        if self.draining.swap(true, Ordering::Acquire) {
            return;
        }
        loop {
            let next = self.remote_call_queue.lock().pop_front();
            match next {
                Some(call) => call.invoke(),
                None => break,
            }
        }
        self.draining.store(false, Ordering::Release);
    }
}

struct PerCpuTable {
    entries: Vec<PerCpuData>,
}

static TABLE: OnceCell<PerCpuTable> = OnceCell::new();

/// Populates the per-CPU table. Must run after the heap is initialised
/// and before any CPU but the bootstrap processor is started.
pub fn init(kernel_stack_tops: Vec<VirtAddr>) {
    let entries = kernel_stack_tops.into_iter().map(PerCpuData::new).collect();
    TABLE.init(|| PerCpuTable { entries });
}

/// # Panics
/// Panics if `init` has not yet run, or if `cpu` is out of range.
pub fn data(cpu: u8) -> &'static PerCpuData {
    &TABLE.get().entries[cpu as usize]
}

pub fn is_initialized() -> bool {
    TABLE.is_initialized()
}

pub fn cpu_count() -> usize {
    TABLE.get().entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn drain_runs_calls_in_strict_fifo_order() {
        let data = PerCpuData::new(VirtAddr::new(0));
        let order = Arc::new(SpinLock::new(Vec::new()));

        for i in 0..100u32 {
            let order = order.clone();
            data.enqueue(Box::new(move || {
                order.lock().push(i);
            }));
        }

        data.drain_remote_calls();

        let recorded = order.lock();
        let expected: Vec<u32> = (0..100).collect();
        assert_eq!(*recorded, expected);
    }

    #[test]
    fn reentrant_enqueue_during_drain_is_still_processed_in_order() {
        let data = Arc::new(PerCpuData::new(VirtAddr::new(0)));
        let order = Arc::new(SpinLock::new(Vec::new()));
        let ran_reentrant = Arc::new(AtomicBool::new(false));

        {
            let data = data.clone();
            let order = order.clone();
            let ran_reentrant = ran_reentrant.clone();
            data.enqueue(Box::new(move || {
                order.lock().push(0);
                // Enqueue more work and re-enter `drain_remote_calls` as if
                // woken by a second IPI before the outer drain returns.
                let order2 = order.clone();
                data.enqueue(Box::new(move || {
                    order2.lock().push(1);
                }));
                ran_reentrant.store(true, Ordering::Relaxed);
                data.drain_remote_calls();
            }));
        }

        data.drain_remote_calls();

        assert!(ran_reentrant.load(Ordering::Relaxed));
        assert_eq!(*order.lock(), alloc::vec![0, 1]);
    }
}
