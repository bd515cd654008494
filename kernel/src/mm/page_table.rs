//! 4-level page tables, mapping, and direct-map construction.
//!
//! Built on the `x86_64` crate's [`PageTable`]/[`PageTableFlags`] types
//! for entry encoding (same crate the teacher uses throughout
//! `arch/x86_64`), with this crate's own walking and allocation logic on
//! top to support the bootstrap watermark contract described in
//! `SPEC_FULL.md` §4.C, which the teacher's own paging code does not
//! need (it assumes a bootloader-provided direct map already exists).

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{PageTable as X64PageTable, PageTableFlags as X64Flags};
use x86_64::{PhysAddr as X64Phys, VirtAddr as X64Virt};

use crate::config::{EARLY_IDENTITY_MAP_LIMIT, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::mm::addr::{Frame, PhysAddr, VirtAddr};
use crate::mm::frame_allocator::Watermark;

bitflags::bitflags! {
    /// Mapping attributes, named independently of the `x86_64` crate's
    /// own flag set so callers of [`map`] don't need to know the
    /// `PRESENT` bit is implicit.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const WRITABLE      = 1 << 0;
        const USER          = 1 << 1;
        const WRITE_THROUGH = 1 << 2;
        const CACHE_DISABLE = 1 << 3;
        const GLOBAL        = 1 << 4;
        const NO_EXECUTE    = 1 << 5;
    }
}

fn leaf_flags(flags: MapFlags) -> X64Flags {
    let mut f = X64Flags::PRESENT;
    if flags.contains(MapFlags::WRITABLE) {
        f |= X64Flags::WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        f |= X64Flags::USER_ACCESSIBLE;
    }
    if flags.contains(MapFlags::WRITE_THROUGH) {
        f |= X64Flags::WRITE_THROUGH;
    }
    if flags.contains(MapFlags::CACHE_DISABLE) {
        f |= X64Flags::NO_CACHE;
    }
    if flags.contains(MapFlags::GLOBAL) {
        f |= X64Flags::GLOBAL;
    }
    if flags.contains(MapFlags::NO_EXECUTE) {
        f |= X64Flags::NO_EXECUTE;
    }
    f
}

const INTERMEDIATE_FLAGS: X64Flags =
    X64Flags::from_bits_truncate(X64Flags::PRESENT.bits() | X64Flags::WRITABLE.bits() | X64Flags::USER_ACCESSIBLE.bits());

/// Provides access to a page-table frame's contents while it is being
/// built, so callers can choose between "already in the direct map" and
/// "bootstrap, watermark-aware" access strategies.
pub trait TableAccess {
    /// # Safety
    /// The returned pointer must point at a valid, exclusively-accessed
    /// `X64PageTable` for the lifetime of its use.
    unsafe fn access(&self, frame: Frame) -> *mut X64PageTable;
}

/// Used for all mapping performed after the direct map is fully built:
/// every frame is reachable through its direct-map alias.
pub struct DirectMapAccess;

impl TableAccess for DirectMapAccess {
    unsafe fn access(&self, frame: Frame) -> *mut X64PageTable {
        frame.direct_mapped().as_mut_ptr()
    }
}

/// Used only while constructing the direct map itself. Frames below the
/// watermark are already reachable through the (partially built) direct
/// map; frames at or above it are reachable only through the bootloader's
/// early low-memory identity map, which this kernel assumes covers at
/// least [`EARLY_IDENTITY_MAP_LIMIT`] bytes.
pub struct BootstrapAccess<'a> {
    pub watermark: &'a Watermark,
}

impl TableAccess for BootstrapAccess<'_> {
    unsafe fn access(&self, frame: Frame) -> *mut X64PageTable {
        let phys = frame.start_address().as_u64();
        if phys < self.watermark.get() {
            frame.direct_mapped().as_mut_ptr()
        } else {
            assert!(
                phys < EARLY_IDENTITY_MAP_LIMIT,
                "bootstrap scratch frame {phys:#x} outside the early identity-mapped range"
            );
            phys as *mut X64PageTable
        }
    }
}

/// Anything able to hand out a fresh physical frame during mapping.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> Result<Frame>;
}

fn zero_table(ptr: *mut X64PageTable) {
    // SAFETY: caller (`get_or_create_next_level`) guarantees `ptr` is a
    // valid, exclusively-owned page-sized table.
    unsafe {
        (*ptr) = X64PageTable::new();
    }
}

fn get_or_create_next_level(
    table: &mut X64PageTable,
    index: usize,
    access: &dyn TableAccess,
    frames: &mut dyn FrameSource,
) -> Result<*mut X64PageTable> {
    let entry = &mut table[index];
    if entry.is_unused() {
        let frame = frames.alloc_frame()?;
        let ptr = unsafe { access.access(frame) };
        zero_table(ptr);
        entry.set_addr(
            X64Phys::new(frame.start_address().as_u64()),
            INTERMEDIATE_FLAGS,
        );
        Ok(ptr)
    } else {
        let phys = PhysAddr::new(entry.addr().as_u64());
        let frame = Frame::containing(phys);
        Ok(unsafe { access.access(frame) })
    }
}

/// Maps `n_pages` contiguous 4 KiB pages starting at `vaddr` to
/// `paddr`, walking (and lazily creating) the 4 levels rooted at
/// `pml4_frame`.
pub fn map(
    pml4_frame: Frame,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    flags: MapFlags,
    n_pages: u64,
    access: &dyn TableAccess,
    frames: &mut dyn FrameSource,
) -> Result<()> {
    assert!(vaddr.is_page_aligned(), "map: vaddr not page-aligned");
    assert!(paddr.is_page_aligned(), "map: paddr not page-aligned");

    for i in 0..n_pages {
        let v = X64Virt::new(vaddr.as_u64() + i * PAGE_SIZE);
        let p = paddr.as_u64() + i * PAGE_SIZE;

        // SAFETY: `pml4_frame` is a valid, exclusively-accessed PML4
        // for the address space being mapped into.
        let pml4 = unsafe { &mut *access.access(pml4_frame) };
        let pdpt_ptr = get_or_create_next_level(pml4, usize::from(v.p4_index()), access, frames)?;
        // SAFETY: just created or already validated by the lookup above.
        let pdpt = unsafe { &mut *pdpt_ptr };
        let pd_ptr = get_or_create_next_level(pdpt, usize::from(v.p3_index()), access, frames)?;
        // SAFETY: see above.
        let pd = unsafe { &mut *pd_ptr };
        let pt_ptr = get_or_create_next_level(pd, usize::from(v.p2_index()), access, frames)?;
        // SAFETY: see above.
        let pt = unsafe { &mut *pt_ptr };

        let leaf = &mut pt[usize::from(v.p1_index())];
        leaf.set_addr(X64Phys::new(p), leaf_flags(flags));
    }
    Ok(())
}

/// Builds the direct map: every physical frame in `[0, max_phys_addr)`
/// mapped, writable, kernel-only, starting at `config::DMAP_BASE`.
///
/// `frames`/`watermark` are threaded through so the bootstrap frame
/// allocator can decide, for each scratch frame it hands out while this
/// function runs, whether that frame is already direct-mapped (the
/// forward sweep has passed it) or must be reached through the early
/// identity map (it hasn't, yet).
pub fn build_direct_map(
    pml4_frame: Frame,
    max_phys_addr: u64,
    frames: &mut dyn FrameSource,
    watermark: &Watermark,
) -> Result<()> {
    let access = BootstrapAccess { watermark };
    let mut phys = 0u64;
    while phys < max_phys_addr {
        let paddr = PhysAddr::new(phys);
        let vaddr = paddr.to_direct_map();
        map(
            pml4_frame,
            vaddr,
            paddr,
            MapFlags::WRITABLE | MapFlags::GLOBAL,
            1,
            &access,
            frames,
        )?;
        phys += PAGE_SIZE;
        watermark.raise_to(PhysAddr::new(phys));
    }
    Ok(())
}

/// Reloads CR3 from `pml4_frame`, flushing the TLB.
pub fn switch_address_space(pml4_frame: Frame) {
    let phys = X64Phys::new(pml4_frame.start_address().as_u64());
    let (_, flags) = Cr3::read();
    // SAFETY: `pml4_frame` is a complete, valid PML4 for an address
    // space this CPU is about to run in.
    unsafe {
        Cr3::write(x86_64::structures::paging::PhysFrame::containing_address(phys), flags);
    }
}

pub fn current_pml4_frame() -> Frame {
    let (frame, _) = Cr3::read();
    Frame::containing(PhysAddr::new(frame.start_address().as_u64()))
}
