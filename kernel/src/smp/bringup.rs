//! Application-processor bring-up: the INIT-delay-Startup sequence.
//!
//! Ported from `kernel/smp/smp.cpp::wakeApplicationProcessor`.

use crate::arch::x86_64::acpi;
use crate::arch::x86_64::apic::{self, DestinationMode, Icr, MessageType, TriggerMode};
use crate::config::AP_BOOTSTRAP_LIMIT;
use crate::mm::addr::PhysAddr;

/// Wakes CPU `id`, loading it at `bootstrap_paddr`, a page-aligned
/// physical address below 1 MiB holding real-mode bootstrap code.
///
/// # Panics
/// Panics if `bootstrap_paddr` is not page-aligned, is at or above
/// `AP_BOOTSTRAP_LIMIT`, or does not name a known ACPI processor that
/// is enabled or online-capable.
pub fn wake_application_processor(id: u8, bootstrap_paddr: PhysAddr) {
    assert!(bootstrap_paddr.is_page_aligned(), "AP bootstrap address must be page-aligned");
    assert!(
        bootstrap_paddr.as_u64() < AP_BOOTSTRAP_LIMIT,
        "AP bootstrap address must fit below the 1 MiB real-mode limit"
    );
    let vector = (bootstrap_paddr.as_u64() >> 12) as u64;
    assert!(vector <= 0xFF, "AP bootstrap address does not fit an 8-bit SIPI vector");

    let processor = acpi::info()
        .processor(id)
        .unwrap_or_else(|| panic!("no ACPI processor descriptor for CPU {id}"));
    assert!(
        processor.enabled || processor.online_capable,
        "CPU {id} is neither enabled nor online-capable per ACPI"
    );

    let apic_id = processor.apic_id;
    let lapic = apic::local_apic();

    let init_icr = Icr::new(0, MessageType::Init, DestinationMode::Physical, TriggerMode::Edge, apic_id);
    lapic.send_interrupt_command(init_icr);

    delay_ms(crate::config::AP_INIT_DELAY_MS);

    let startup_icr = Icr::new(
        vector as u8,
        MessageType::Startup,
        DestinationMode::Physical,
        TriggerMode::Edge,
        apic_id,
    );
    lapic.send_interrupt_command(startup_icr);
}

/// Busy-waits roughly `ms` milliseconds using the Local APIC timer's
/// one-shot countdown, calibrated against its current divide setting.
///
/// This is a coarse delay suitable only for the fixed, one-time AP
/// bring-up handshake, not a general-purpose sleep primitive.
fn delay_ms(ms: u64) {
    let lapic = apic::local_apic();
    const TICKS_PER_MS: u32 = 10_000;
    lapic.set_timer_initial_count(TICKS_PER_MS.saturating_mul(ms as u32));
    while lapic.timer_current_count() != 0 {
        core::hint::spin_loop();
    }
}
