//! Local APIC and I/O APIC register access, ICR/IPI construction, and
//! I/O APIC redirection-table programming.
//!
//! MMIO register layout and the bitflags-driven access pattern are
//! carried over from the teacher's `arch/x86_64/apic.rs`/`ioapic.rs`.
//! One write-order choice deliberately differs from the teacher: I/O
//! APIC redirection entries are written low-DWORD-then-high-DWORD here,
//! per `SPEC_FULL.md` §4.E/§6, whereas the teacher writes high-then-low
//! "to avoid a transient unmasked state" — see `DESIGN.md` for the full
//! rationale. The Local APIC's ICR write order (high-then-low) matches
//! the teacher as-is.

use super::acpi;
use crate::mm::addr::{PhysAddr, VirtAddr};
use crate::sync::OnceCell;

const REG_ID: u64 = 0x20;
const REG_VERSION: u64 = 0x30;
const REG_TPR: u64 = 0x80;
const REG_EOI: u64 = 0xB0;
const REG_LDR: u64 = 0xD0;
const REG_DFR: u64 = 0xE0;
const REG_SVR: u64 = 0xF0;
const REG_ISR_BASE: u64 = 0x100;
const REG_TMR_BASE: u64 = 0x180;
const REG_IRR_BASE: u64 = 0x200;
const REG_ESR: u64 = 0x280;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_LVT_THERMAL: u64 = 0x330;
const REG_LVT_PERF: u64 = 0x340;
const REG_LVT_LINT0: u64 = 0x350;
const REG_LVT_LINT1: u64 = 0x360;
const REG_LVT_ERROR: u64 = 0x370;
const REG_TIMER_INITIAL_COUNT: u64 = 0x380;
const REG_TIMER_CURRENT_COUNT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// Message type of an IPI. Only `Init`/`Startup`/`Fixed` are used by
/// this kernel; SMI/NMI exist for ICR-validation completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Fixed = 0b000,
    Smi = 0b010,
    Nmi = 0b100,
    Init = 0b101,
    Startup = 0b110,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerMode {
    Edge = 0,
    Level = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DestinationMode {
    Physical = 0,
    Logical = 1,
}

/// The Interrupt Command Register, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Icr {
    pub vector: u8,
    pub message_type: MessageType,
    pub destination_mode: DestinationMode,
    pub trigger_mode: TriggerMode,
    pub destination: u8,
}

impl Icr {
    /// Builds an ICR, validating the constraint `SPEC_FULL.md` §4.E
    /// requires: SMI and INIT messages must be edge-triggered with
    /// vector 0.
    ///
    /// # Panics
    /// Panics if that constraint is violated.
    pub fn new(
        vector: u8,
        message_type: MessageType,
        destination_mode: DestinationMode,
        trigger_mode: TriggerMode,
        destination: u8,
    ) -> Self {
        if matches!(message_type, MessageType::Smi | MessageType::Init) {
            assert!(
                trigger_mode == TriggerMode::Edge && vector == 0,
                "SMI/INIT messages require edge trigger and vector 0"
            );
        }
        Icr {
            vector,
            message_type,
            destination_mode,
            trigger_mode,
            destination,
        }
    }

    pub fn raw(&self) -> u64 {
        let low = (self.vector as u64)
            | ((self.message_type as u64) << 8)
            | ((self.destination_mode as u64) << 11)
            | (1 << 14) // level = assert
            | ((self.trigger_mode as u64) << 15);
        let high = (self.destination as u64) << 56;
        low | high
    }

    pub fn from_raw(raw: u64) -> Self {
        let vector = (raw & 0xFF) as u8;
        let message_type = match (raw >> 8) & 0b111 {
            0b000 => MessageType::Fixed,
            0b010 => MessageType::Smi,
            0b100 => MessageType::Nmi,
            0b101 => MessageType::Init,
            0b110 => MessageType::Startup,
            other => panic!("invalid ICR message type {other:#b}"),
        };
        let destination_mode = if (raw >> 11) & 1 == 0 {
            DestinationMode::Physical
        } else {
            DestinationMode::Logical
        };
        let trigger_mode = if (raw >> 15) & 1 == 0 {
            TriggerMode::Edge
        } else {
            TriggerMode::Level
        };
        let destination = (raw >> 56) as u8;
        Icr {
            vector,
            message_type,
            destination_mode,
            trigger_mode,
            destination,
        }
    }
}

pub struct LocalApic {
    base: VirtAddr,
}

impl LocalApic {
    /// # Safety
    /// `base` must be the Local APIC's MMIO base, already mapped
    /// uncacheable read/write for this CPU.
    pub const unsafe fn new(base: VirtAddr) -> Self {
        LocalApic { base }
    }

    fn reg_ptr(&self, offset: u64) -> *mut u32 {
        (self.base.as_u64() + offset) as *mut u32
    }

    fn read(&self, offset: u64) -> u32 {
        // SAFETY: `offset` is one of this module's own register
        // constants, all within the Local APIC's MMIO page.
        unsafe { core::ptr::read_volatile(self.reg_ptr(offset)) }
    }

    /// Bits each register actually defines; everything outside this mask
    /// is reserved and must survive a write untouched, mirroring
    /// `REDIRECTION_RESERVED_MASK` on the I/O APIC side. `u32::MAX` marks
    /// a register with no reserved bits worth preserving (or, for
    /// `REG_EOI`, one that's write-only and never read back).
    fn writable_mask(offset: u64) -> u32 {
        match offset {
            REG_TPR => 0x0000_00FF,
            REG_LDR => 0xFF00_0000,
            REG_DFR => 0xF000_0000,
            REG_SVR => 0x0000_03FF,
            REG_ICR_LOW => 0x000C_CFFF,
            REG_ICR_HIGH => 0xFF00_0000,
            REG_LVT_TIMER => 0x0003_00FF,
            REG_LVT_ERROR => 0x0001_00FF,
            REG_LVT_LINT0 | REG_LVT_LINT1 => 0x0001_A7FF,
            REG_TIMER_DIVIDE => 0x0000_000B,
            _ => u32::MAX,
        }
    }

    fn write(&self, offset: u64, value: u32) {
        assert!(offset != REG_EOI || value == 0, "EOI register is write-only-zero");
        let mask = Self::writable_mask(offset);
        let masked_value = if mask == u32::MAX {
            value
        } else {
            (self.read(offset) & !mask) | (value & mask)
        };
        // SAFETY: see `read`.
        unsafe { core::ptr::write_volatile(self.reg_ptr(offset), masked_value) };
    }

    pub fn id(&self) -> u8 {
        (self.read(REG_ID) >> 24) as u8
    }

    pub fn version(&self) -> u32 {
        self.read(REG_VERSION)
    }

    /// Signals end-of-interrupt. Write-only; any value works, `0` is
    /// conventional.
    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    fn bitmap_256(&self, base: u64) -> [u32; 8] {
        let mut out = [0u32; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read(base + (i as u64) * 0x10);
        }
        out
    }

    pub fn isr(&self) -> [u32; 8] {
        self.bitmap_256(REG_ISR_BASE)
    }

    pub fn tmr(&self) -> [u32; 8] {
        self.bitmap_256(REG_TMR_BASE)
    }

    pub fn irr(&self) -> [u32; 8] {
        self.bitmap_256(REG_IRR_BASE)
    }

    pub fn error_status(&self) -> u32 {
        self.read(REG_ESR)
    }

    pub fn set_spurious_vector(&self, vector: u8, software_enable: bool) {
        let mut value = vector as u32;
        if software_enable {
            value |= 1 << 8;
        }
        self.write(REG_SVR, value);
    }

    pub fn set_destination_format(&self, flat_model: bool) {
        self.write(REG_DFR, if flat_model { 0xFFFF_FFFF } else { 0x0FFF_FFFF });
    }

    pub fn set_logical_destination(&self, id: u8) {
        self.write(REG_LDR, (id as u32) << 24);
    }

    pub fn set_task_priority(&self, priority: u8) {
        self.write(REG_TPR, priority as u32);
    }

    /// Writes the Interrupt Command Register, high DWORD first, then
    /// low — the low write is what actually dispatches the IPI.
    pub fn send_interrupt_command(&self, icr: Icr) {
        let raw = icr.raw();
        self.write(REG_ICR_HIGH, (raw >> 32) as u32);
        self.write(REG_ICR_LOW, raw as u32);
    }

    pub fn set_lvt_timer(&self, vector: u8, periodic: bool, masked: bool) {
        let mut v = vector as u32;
        if periodic {
            v |= 1 << 17;
        }
        if masked {
            v |= 1 << 16;
        }
        self.write(REG_LVT_TIMER, v);
    }

    pub fn set_lvt_error(&self, vector: u8, masked: bool) {
        let mut v = vector as u32;
        if masked {
            v |= 1 << 16;
        }
        self.write(REG_LVT_ERROR, v);
    }

    pub fn set_lvt_lint(&self, line: u8, vector: u8, message_type: MessageType, masked: bool) {
        let reg = if line == 0 { REG_LVT_LINT0 } else { REG_LVT_LINT1 };
        let mut v = vector as u32 | ((message_type as u32) << 8);
        if masked {
            v |= 1 << 16;
        }
        self.write(reg, v);
    }

    pub fn set_timer_initial_count(&self, count: u32) {
        self.write(REG_TIMER_INITIAL_COUNT, count);
    }

    pub fn timer_current_count(&self) -> u32 {
        self.read(REG_TIMER_CURRENT_COUNT)
    }

    pub fn set_timer_divide(&self, divisor_encoding: u32) {
        self.write(REG_TIMER_DIVIDE, divisor_encoding);
    }

    /// Sends a fixed-vector IPI to `dest_cpu`.
    pub fn send_ipi(&self, dest_cpu: u8, vector: u8) {
        let icr = Icr::new(
            vector,
            MessageType::Fixed,
            DestinationMode::Physical,
            TriggerMode::Edge,
            dest_cpu,
        );
        self.send_interrupt_command(icr);
    }
}

// SAFETY: all mutation goes through volatile MMIO writes; there is no
// interior aliasing hazard beyond what the hardware itself serialises.
unsafe impl Sync for LocalApic {}
unsafe impl Send for LocalApic {}

static LOCAL_APIC: OnceCell<LocalApic> = OnceCell::new();

/// Enables the Local APIC (global-enable bit in the APIC-base MSR) and
/// installs the process-wide accessor.
///
/// # Safety
/// `apic_base` must be the physical address reported by the APIC-base
/// MSR / ACPI, and must not already be in use as anything else.
pub unsafe fn init(apic_base: PhysAddr) {
    let base_msr = unsafe { super::msr::rdmsr(super::msr::IA32_APIC_BASE) };
    let enabled = base_msr | (1 << 11);
    unsafe { super::msr::wrmsr(super::msr::IA32_APIC_BASE, enabled) };

    let vaddr = apic_base.to_direct_map();
    // SAFETY: forwarded from the caller.
    let apic = unsafe { LocalApic::new(vaddr) };
    apic.set_spurious_vector(0xFF, true);
    LOCAL_APIC.init(|| apic);
}

/// # Panics
/// Panics if `init` has not yet run on this CPU.
pub fn local_apic() -> &'static LocalApic {
    LOCAL_APIC.get()
}

// ---------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------

const IOREGSEL_OFFSET: u64 = 0x00;
const IOWIN_OFFSET: u64 = 0x10;
const IOAPIC_REG_ID: u32 = 0x00;
const IOAPIC_REG_VERSION: u32 = 0x01;
const IOAPIC_REDIRECTION_BASE: u32 = 0x10;

/// Bits an I/O APIC redirection entry reserves; writers must preserve
/// them rather than clobbering with zero.
pub const REDIRECTION_RESERVED_MASK: u64 = 0x00ff_ffff_fffe_5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectionEntry {
    pub vector: u8,
    pub delivery_mode: MessageType,
    pub destination_mode: DestinationMode,
    pub polarity_low: bool,
    pub trigger_mode: TriggerMode,
    pub masked: bool,
    pub destination: u8,
}

impl RedirectionEntry {
    fn to_bits(self) -> u64 {
        let mut low = self.vector as u64;
        low |= (self.delivery_mode as u64) << 8;
        low |= (self.destination_mode as u64) << 11;
        if self.polarity_low {
            low |= 1 << 13;
        }
        low |= (self.trigger_mode as u64) << 15;
        if self.masked {
            low |= 1 << 16;
        }
        let high = (self.destination as u64) << 56;
        low | high
    }

    fn from_bits(bits: u64) -> Self {
        RedirectionEntry {
            vector: (bits & 0xFF) as u8,
            delivery_mode: match (bits >> 8) & 0b111 {
                0b000 => MessageType::Fixed,
                0b010 => MessageType::Smi,
                0b100 => MessageType::Nmi,
                0b101 => MessageType::Init,
                0b110 => MessageType::Startup,
                other => panic!("invalid redirection delivery mode {other:#b}"),
            },
            destination_mode: if (bits >> 11) & 1 == 0 {
                DestinationMode::Physical
            } else {
                DestinationMode::Logical
            },
            polarity_low: (bits >> 13) & 1 != 0,
            trigger_mode: if (bits >> 15) & 1 == 0 {
                TriggerMode::Edge
            } else {
                TriggerMode::Level
            },
            masked: (bits >> 16) & 1 != 0,
            destination: (bits >> 56) as u8,
        }
    }
}

pub struct IoApic {
    base: VirtAddr,
    pub interrupt_base: u32,
}

impl IoApic {
    /// # Safety
    /// `base` must be this I/O APIC's MMIO base, mapped uncacheable
    /// read/write.
    pub unsafe fn new(base: VirtAddr, interrupt_base: u32) -> Self {
        IoApic { base, interrupt_base }
    }

    fn select(&self, reg: u32) {
        // SAFETY: `IOREGSEL_OFFSET` is within this I/O APIC's MMIO page.
        unsafe {
            core::ptr::write_volatile((self.base.as_u64() + IOREGSEL_OFFSET) as *mut u32, reg);
        }
    }

    fn read_window(&self) -> u32 {
        // SAFETY: see `select`.
        unsafe { core::ptr::read_volatile((self.base.as_u64() + IOWIN_OFFSET) as *const u32) }
    }

    fn write_window(&self, value: u32) {
        // SAFETY: see `select`.
        unsafe {
            core::ptr::write_volatile((self.base.as_u64() + IOWIN_OFFSET) as *mut u32, value);
        }
    }

    fn read_reg(&self, reg: u32) -> u32 {
        self.select(reg);
        self.read_window()
    }

    fn write_reg(&self, reg: u32, value: u32) {
        self.select(reg);
        self.write_window(value);
    }

    pub fn id(&self) -> u8 {
        ((self.read_reg(IOAPIC_REG_ID) >> 24) & 0x0F) as u8
    }

    /// Number of redirection-table entries this I/O APIC has.
    pub fn num_redirection_entries(&self) -> u32 {
        ((self.read_reg(IOAPIC_REG_VERSION) >> 16) & 0xFF) + 1
    }

    fn redirection_regs(pin: u32) -> (u32, u32) {
        let low = IOAPIC_REDIRECTION_BASE + pin * 2;
        (low, low + 1)
    }

    fn read_redirection_raw(&self, pin: u32) -> u64 {
        let (low_reg, high_reg) = Self::redirection_regs(pin);
        let low = self.read_reg(low_reg) as u64;
        let high = self.read_reg(high_reg) as u64;
        low | (high << 32)
    }

    /// Programs redirection-table entry `pin`.
    ///
    /// Reserved bits are preserved from whatever was already there.
    /// Written low-DWORD-then-high-DWORD per `SPEC_FULL.md` §4.E/§6 —
    /// entries should be constructed already masked (`masked: true`)
    /// when the caller cares about the transient state between the two
    /// writes, which the teacher's opposite ordering was defending
    /// against in a different way (see `DESIGN.md`).
    ///
    /// # Panics
    /// Panics if `entry`'s (delivery mode, trigger mode) combination is
    /// invalid: SMI/NMI/INIT/ExtINT all require edge triggering.
    pub fn redirect_interrupt(&self, pin: u32, entry: RedirectionEntry) {
        if matches!(
            entry.delivery_mode,
            MessageType::Smi | MessageType::Nmi | MessageType::Init
        ) {
            assert!(
                entry.trigger_mode == TriggerMode::Edge,
                "SMI/NMI/INIT redirection entries must be edge-triggered"
            );
        }

        let current = self.read_redirection_raw(pin);
        let new_bits = (current & REDIRECTION_RESERVED_MASK) | (entry.to_bits() & !REDIRECTION_RESERVED_MASK);

        let (low_reg, high_reg) = Self::redirection_regs(pin);
        self.write_reg(low_reg, new_bits as u32);
        self.write_reg(high_reg, (new_bits >> 32) as u32);
    }

    pub fn read_redirection(&self, pin: u32) -> RedirectionEntry {
        RedirectionEntry::from_bits(self.read_redirection_raw(pin))
    }
}

// SAFETY: all mutation goes through volatile MMIO writes serialized by
// the hardware's own register-select protocol.
unsafe impl Sync for IoApic {}
unsafe impl Send for IoApic {}

/// Routes legacy ISA IRQ `irq` (0..16) to `vector`: resolves the IRQ to
/// a global system interrupt through any ACPI interrupt-source override
/// (identity if none applies), finds the I/O APIC whose redirection
/// range covers that GSI, and programs the entry fixed, unmasked, and
/// destined for the calling CPU, with polarity/trigger taken from the
/// override when present.
///
/// # Panics
/// Panics if `irq` is out of range or no I/O APIC claims the resolved
/// GSI.
pub fn map_irq(irq: u8, vector: u8) {
    assert!((irq as usize) < 16, "legacy IRQ must be in 0..16, got {irq}");
    let info = acpi::info();
    let over = info.irq_overrides[irq as usize];
    let gsi = over.gsi;

    let desc = info
        .io_apic_for_gsi(gsi)
        .unwrap_or_else(|| panic!("no I/O APIC claims GSI {gsi} (IRQ {irq})"));

    // SAFETY: `desc.address` is an I/O APIC MMIO base reported by the
    // MADT, mapped uncacheable in the direct map like all physical
    // memory this kernel tracks.
    let io_apic = unsafe { IoApic::new(desc.address.to_direct_map(), desc.interrupt_base) };
    let pin = gsi - desc.interrupt_base;

    let entry = RedirectionEntry {
        vector,
        delivery_mode: MessageType::Fixed,
        destination_mode: DestinationMode::Physical,
        polarity_low: over.active_low,
        trigger_mode: if over.level_triggered {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        },
        masked: false,
        destination: local_apic().id(),
    };
    io_apic.redirect_interrupt(pin, entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icr_round_trips_through_raw() {
        let icr = Icr::new(35, MessageType::Fixed, DestinationMode::Physical, TriggerMode::Edge, 7);
        assert_eq!(Icr::from_raw(icr.raw()), icr);
    }

    #[test]
    #[should_panic(expected = "edge trigger and vector 0")]
    fn init_message_rejects_non_edge_or_nonzero_vector() {
        let _ = Icr::new(1, MessageType::Init, DestinationMode::Physical, TriggerMode::Edge, 0);
    }
}
