//! Core of a small x86_64 multiprocessor kernel: physical frame
//! allocation, paging, a lazily-growing heap, the Local/I-O APIC and
//! ACPI subsystems, cross-CPU remote calls, application-processor
//! bring-up, and the process/context-switch primitive they all serve.
//!
//! Userspace, syscalls, scheduling policy, page eviction, NUMA
//! awareness, x2APIC and support for more than 256 processors are all
//! out of scope; see `SPEC_FULL.md`.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::GlobalHeap = mm::heap::GlobalHeap;

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod arch;
pub mod config;
pub mod error;
pub mod logging;
pub mod mm;
pub mod process;
pub mod serial;
pub mod smp;
pub mod sync;
pub mod test_framework;
pub mod util;

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    arch::x86_64::halt_loop();
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure is unrecoverable in a `no_std` kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
