//! Crate-wide error taxonomy.

use core::fmt;

/// Every recoverable failure this kernel can produce.
///
/// Anything not representable here is a programming error and panics
/// instead of returning an `Error` (see the fatal-condition list in
/// `SPEC_FULL.md` §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The physical frame allocator has no frame left to hand out.
    OutOfPhysicalMemory,
    /// The kernel heap has reached its configured maximum size and cannot
    /// grow to satisfy an allocation.
    MaxHeapSizeReached,
    /// No ACPI RSDP could be located during table discovery.
    NoRsdpFound,
    /// Reserved for use by the test harness only.
    #[cfg(test)]
    Test,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfPhysicalMemory => write!(f, "out of physical memory"),
            Error::MaxHeapSizeReached => write!(f, "heap reached its configured maximum size"),
            Error::NoRsdpFound => write!(f, "no ACPI RSDP found"),
            #[cfg(test)]
            Error::Test => write!(f, "test error"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
