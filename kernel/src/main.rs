#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(mp_kernel_core::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

use mp_kernel_core::arch::x86_64 as cpu;
use mp_kernel_core::config;
use mp_kernel_core::mm::{self, addr::VirtAddr, bootloader_handoff::BootInfo};
use mp_kernel_core::{logging, serial_println, smp};

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[KERNEL PANIC] {}", info);
    cpu::halt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    mp_kernel_core::test_framework::test_panic_handler(info)
}

/// Kernel entry point.
///
/// # Safety
/// `boot_info` must point at a valid, untouched handoff struct
/// produced by whatever loaded this kernel (see `mm::bootloader_handoff`),
/// and this function must run exactly once, on the bootstrap processor,
/// before any other CPU is started.
#[no_mangle]
pub unsafe extern "C" fn _start(boot_info: *const BootInfo) -> ! {
    logging::init();
    log::info!("booting");

    // SAFETY: forwarded from this function's own safety contract.
    let boot_info = unsafe { &*boot_info };

    // SAFETY: `boot_info` is the untouched handoff struct.
    unsafe { mm::init_bootstrap(boot_info) };

    let max_phys_addr = highest_physical_address(boot_info);
    mm::init_paging_and_handover(max_phys_addr).expect("failed to build the direct map and hand over frames");

    mm::heap::init(
        VirtAddr::new(config::HEAP_START),
        config::HEAP_MAX_SIZE,
        mm::page_table::current_pml4_frame(),
    );

    cpu::init();

    // SAFETY: runs once, early in boot, per this function's contract.
    unsafe { cpu::acpi::init() }.expect("ACPI initialisation failed");
    // SAFETY: `acpi::init` has already located the Local APIC's MMIO base.
    unsafe { cpu::apic::init(cpu::acpi::info().local_apic_address) };

    let bsp_stack = mm::allocate_kernel_stack(0).expect("failed to allocate the bootstrap processor's kernel stack");
    smp::init(alloc::vec![bsp_stack]);

    #[cfg(test)]
    test_main();

    log::info!("bring-up complete, entering idle loop");
    cpu::idle();
}

/// Highest byte address named by any entry in the bootloader's memory
/// map, available or not — the direct map must cover all of physical
/// memory, not just the free part.
fn highest_physical_address(boot_info: &BootInfo) -> u64 {
    // SAFETY: `boot_info` is the untouched handoff struct validated by
    // this function's only caller.
    let entries = unsafe { boot_info.memory_map() };
    entries.iter().map(|e| e.base + e.length).max().unwrap_or(0)
}
