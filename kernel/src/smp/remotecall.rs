//! Cross-CPU function invocation.
//!
//! Ported from `include/smp/remotecall.hpp`/`remotecalltypes.hpp`: the
//! original takes a type-erased argument blob plus a function pointer;
//! here the same effect is reached idiomatically with a boxed `FnOnce`
//! closure that captures its arguments by value, handed to the
//! destination CPU's queue (`smp::percpu::PerCpuData`) and woken with
//! the remote-call IPI.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::x86_64::apic;
use crate::config::VECTOR_REMOTE_CALL;
use crate::smp::percpu;
use crate::smp::percpu::RemoteCall;

const PENDING: u8 = 0;
const DONE: u8 = 1;

/// Holds the return value of a remote call until the caller observes it.
///
/// `Send + Sync` despite the `UnsafeCell`: the value is written exactly
/// once, on the destination CPU, strictly before `done` is published
/// with `Release`, and read only after the caller observes `done` with
/// `Acquire` — the atomic forms a happens-before edge around the
/// otherwise-unsynchronised cell.
pub struct CallResult<T> {
    done: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: see the struct doc comment; access to `value` is always
// ordered through `done`.
unsafe impl<T: Send> Send for CallResult<T> {}
unsafe impl<T: Send> Sync for CallResult<T> {}

impl<T> CallResult<T> {
    fn new() -> Self {
        CallResult {
            done: AtomicU8::new(PENDING),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn publish(&self, value: T) {
        // SAFETY: only the destination CPU's queued closure writes here,
        // exactly once, before the `Release` store below makes it visible.
        unsafe {
            (*self.value.get()).write(value);
        }
        self.done.store(DONE, Ordering::Release);
    }

    /// Spins until the destination CPU has produced a result.
    pub fn wait(&self) {
        while self.done.load(Ordering::Acquire) != DONE {
            core::hint::spin_loop();
        }
    }

    /// Blocks until the result is ready, then returns it.
    pub fn take(&self) -> T
    where
        T: Copy,
    {
        self.wait();
        // SAFETY: `done == DONE` happens-after the `publish` write.
        unsafe { (*self.value.get()).assume_init() }
    }
}

/// Queues `f` for execution on `dest_cpu` and sends the remote-call IPI
/// to wake it. Returns a handle the caller can `wait()`/`take()` on.
///
/// The closure runs with interrupts enabled, inside the destination
/// CPU's interrupt handler for `VECTOR_REMOTE_CALL`, strictly after any
/// call already queued ahead of it (`PerCpuData::drain_remote_calls`
/// guarantees FIFO order even under re-entrant enqueues).
pub fn invoke_on<T, F>(dest_cpu: u8, f: F) -> Arc<CallResult<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let result = Arc::new(CallResult::new());
    let result_for_closure = result.clone();
    let boxed: Box<dyn RemoteCall> = Box::new(move || {
        let value = f();
        result_for_closure.publish(value);
    });
    percpu::data(dest_cpu).enqueue(boxed);
    apic::local_apic().send_ipi(dest_cpu, VECTOR_REMOTE_CALL);
    result
}

/// Interrupt handler for `VECTOR_REMOTE_CALL`: drains the current CPU's
/// queue. Registered against the IDT by `smp::init`.
pub fn handle_remote_call_interrupt(
    _vector: u8,
    _frame: &x86_64::structures::idt::InterruptStackFrame,
    _error_code: u64,
) {
    let cpu = current_cpu_id();
    percpu::data(cpu).drain_remote_calls();
}

fn current_cpu_id() -> u8 {
    apic::local_apic().id()
}
