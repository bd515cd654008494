//! Build-time configuration constants.
//!
//! A kernel of this size has no runtime configuration surface; everything
//! that would otherwise live in a config file is a `const` here, grouped
//! by subsystem and referenced from its point of use.

/// Maximum number of logical processors this kernel will ever manage.
///
/// Bounded by the 8-bit APIC ID space the core restricts itself to (no
/// x2APIC support — see the Non-goals in `SPEC_FULL.md`).
pub const MAX_CPUS: usize = 256;

/// Base kernel-virtual address of the direct physical-memory map.
pub const DMAP_BASE: u64 = 0xffff_8000_0000_0000;

/// Base kernel-virtual address the lazily-growing heap starts at.
pub const HEAP_START: u64 = 0xffff_9000_0000_0000;

/// Upper bound on heap growth, in bytes. Must be a multiple of `PAGE_SIZE`.
pub const HEAP_MAX_SIZE: u64 = 256 * 1024 * 1024;

/// Size of a single kernel stack, in bytes.
pub const KERNEL_STACK_SIZE: u64 = 4 * PAGE_SIZE;

/// Top of the descending region kernel stacks are carved out of.
///
/// Chosen off to the side of `HEAP_START` and `DMAP_BASE` so stack,
/// heap and direct-map regions never collide. See the REDESIGN FLAGS in
/// `SPEC_FULL.md`: stacks must not wrap through address 0.
pub const KERNEL_STACK_REGION_TOP: u64 = 0xffff_a000_0000_0000;

/// Native page size.
pub const PAGE_SIZE: u64 = 4096;

/// Lower bound on how much physical memory the bootloader is assumed to
/// identity-map before handoff. Scratch page-table frames needed while
/// building the direct map are reachable through this window even
/// before the direct map itself reaches them.
pub const EARLY_IDENTITY_MAP_LIMIT: u64 = 16 * 1024 * 1024;

/// Interrupt vector reserved for PIT-based timer calibration.
pub const VECTOR_PIT_CALIBRATION: u8 = 32;
/// Interrupt vector the Local APIC timer fires on.
pub const VECTOR_LAPIC_TIMER: u8 = 33;
/// Interrupt vector used by the bare-metal self-test harness.
pub const VECTOR_SELF_TEST: u8 = 34;
/// Interrupt vector used to wake a CPU to drain its remote-call queue.
pub const VECTOR_REMOTE_CALL: u8 = 35;

/// Milliseconds to wait between the INIT and Startup IPIs during AP bring-up.
pub const AP_INIT_DELAY_MS: u64 = 10;

/// Highest physical address a SIPI vector (`paddr >> 12`) can encode.
pub const AP_BOOTSTRAP_LIMIT: u64 = 1 << 20;
