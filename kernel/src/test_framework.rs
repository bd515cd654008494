//! Bare-metal test harness: a `#[test_case]`-based runner that prints
//! progress over serial and exits QEMU with a status code a CI runner
//! can check for.
//!
//! Host-target unit tests (anything compiled for the development host
//! rather than the bare-metal target) use the ordinary `#[test]`
//! harness instead and never touch this module.

use crate::{serial_print, serial_println};
use x86_64::instructions::port::Port;

pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    serial_println!("[failed]");
    serial_println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed);
    crate::arch::x86_64::halt_loop();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) {
    // SAFETY: port 0xf4 is QEMU's isa-debug-exit device in this kernel's
    // target configuration; writing to it is only ever reachable from
    // the test harness.
    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
}
