//! Per-process address spaces.
//!
//! An [`AddrSpace`] owns exactly one PML4 frame. Its upper half (kernel
//! mappings) is shared and copied from whatever address space is live at
//! creation time; its lower half is private and is torn down, frame by
//! frame, on `Drop` — mirroring the RAII teardown idiom the teacher uses
//! for frame ownership in `raii.rs`'s `FrameGuard`.

use x86_64::structures::paging::PageTable as X64PageTable;

use crate::error::Result;
use crate::mm::addr::Frame;
use crate::mm::page_table::{self, DirectMapAccess, FrameSource};

/// First PML4 index belonging to the shared kernel half (entries
/// 256..511).
const KERNEL_HALF_START: usize = 256;

pub struct AddrSpace {
    pml4: Frame,
}

impl AddrSpace {
    /// Allocates a new PML4, zeroing the user half and copying the
    /// kernel half from the currently-loaded address space.
    pub fn new(frames: &mut dyn FrameSource) -> Result<Self> {
        let pml4_frame = frames.alloc_frame()?;
        let access = DirectMapAccess;
        // SAFETY: `pml4_frame` was just allocated and is not yet
        // referenced by CR3 or any other address space.
        let new_table = unsafe { &mut *access_mut(&access, pml4_frame) };
        *new_table = X64PageTable::new();

        let current = page_table::current_pml4_frame();
        // SAFETY: `current` is the live PML4; reading it here does not
        // mutate it.
        let current_table = unsafe { &*access_mut(&access, current) };
        for i in KERNEL_HALF_START..512 {
            let src = &current_table[i];
            if !src.is_unused() {
                new_table[i].set_addr(src.addr(), src.flags());
            }
        }

        Ok(AddrSpace { pml4: pml4_frame })
    }

    pub fn pml4_frame(&self) -> Frame {
        self.pml4
    }

    pub fn switch(&self) {
        page_table::switch_address_space(self.pml4);
    }

    /// Frees every page-table frame reachable from the user half only.
    /// Called by `Drop`; split out so it can return frames through the
    /// ordinary `FrameSource`/free interface rather than a bespoke one.
    fn teardown_user_half(&mut self, free: &mut dyn FnMut(Frame)) {
        let access = DirectMapAccess;
        // SAFETY: `self.pml4` is this address space's own table; no
        // other address space shares its user half.
        let pml4 = unsafe { &*access_mut(&access, self.pml4) };
        for i in 0..KERNEL_HALF_START {
            let entry = &pml4[i];
            if entry.is_unused() {
                continue;
            }
            let pdpt_frame = Frame::containing(crate::mm::addr::PhysAddr::new(entry.addr().as_u64()));
            free_subtree(pdpt_frame, 2, free);
        }
        free(self.pml4);
    }
}

fn free_subtree(frame: Frame, levels_below: u8, free: &mut dyn FnMut(Frame)) {
    if levels_below > 0 {
        let access = DirectMapAccess;
        // SAFETY: `frame` is an owned page-table frame in the subtree
        // being torn down; nothing else references it concurrently.
        let table = unsafe { &*access_mut(&access, frame) };
        for entry in table.iter() {
            if entry.is_unused() {
                continue;
            }
            let child = Frame::containing(crate::mm::addr::PhysAddr::new(entry.addr().as_u64()));
            free_subtree(child, levels_below - 1, free);
        }
    }
    free(frame);
}

fn access_mut(access: &DirectMapAccess, frame: Frame) -> *mut X64PageTable {
    use crate::mm::page_table::TableAccess;
    // SAFETY: caller of `access_mut` upholds `TableAccess::access`'s
    // contract.
    unsafe { access.access(frame) }
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        self.teardown_user_half(&mut crate::mm::free_frame);
        log::debug!("tore down address space rooted at {:?}", self.pml4);
    }
}
