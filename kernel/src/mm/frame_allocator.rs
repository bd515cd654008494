//! Two-phase physical frame allocator.
//!
//! Phase 1 is a bump allocator over the bootloader's free-region list —
//! simple enough to run before paging owns its own structures, but
//! unable to free anything. Phase 2 replaces it with an
//! [`EmbeddedFreeList`](crate::mm::freelist::EmbeddedFreeList) anchored
//! in the direct map, populated with whatever phase 1 did not hand out
//! via a one-time handover.

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::mm::addr::{Frame, PhysAddr};
use crate::mm::bootloader_handoff::BootInfo;
use crate::mm::freelist::EmbeddedFreeList;

/// Frames below this watermark are handed out as kernel-virtual
/// addresses already usable via the portion of the direct map built so
/// far; frames at or above it are handed out as physical addresses,
/// to be consumed once they are mapped. See `SPEC_FULL.md` §4.C.
pub struct Watermark(core::sync::atomic::AtomicU64);

impl Watermark {
    pub const fn new() -> Self {
        Watermark(core::sync::atomic::AtomicU64::new(0))
    }

    pub fn raise_to(&self, phys: PhysAddr) {
        self.0
            .store(phys.as_u64(), core::sync::atomic::Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(core::sync::atomic::Ordering::SeqCst)
    }
}

/// Bump allocator consuming the bootloader's free-region list in order.
/// Allocation-only: `free` panics because nothing allocated during
/// bootstrap (page tables for the direct map, the heap's first page) is
/// ever released.
pub struct BootstrapFrameAllocator {
    regions: alloc::vec::Vec<(PhysAddr, u64)>,
    region_index: usize,
    frame_index: u64,
}

impl BootstrapFrameAllocator {
    /// # Safety
    /// `boot_info`'s free-list pointers must satisfy the safety
    /// requirements of [`BootInfo::free_list`].
    pub unsafe fn new(boot_info: &BootInfo) -> Self {
        // SAFETY: forwarded from the caller.
        let regions: alloc::vec::Vec<(PhysAddr, u64)> = unsafe { boot_info.free_list() }.collect();
        BootstrapFrameAllocator {
            regions,
            region_index: 0,
            frame_index: 0,
        }
    }

    pub fn alloc(&mut self) -> Result<Frame> {
        loop {
            let Some((base, num_frames)) = self.regions.get(self.region_index).copied() else {
                return Err(Error::OutOfPhysicalMemory);
            };
            if self.frame_index >= num_frames {
                self.region_index += 1;
                self.frame_index = 0;
                continue;
            }
            let addr = base
                .checked_add(self.frame_index * PAGE_SIZE)
                .expect("frame address overflow");
            self.frame_index += 1;
            return Ok(Frame::containing(addr));
        }
    }

    /// Always panics: the bootstrap allocator cannot free frames.
    pub fn free(&mut self, _frame: Frame) -> ! {
        panic!("BootstrapFrameAllocator::free is unimplemented by design");
    }

    /// Returns every frame from the current cursor position onward,
    /// for one-time handover into the phase-2 allocator. Consumes
    /// `self` so the bootstrap allocator cannot be used afterward.
    pub fn remaining_regions(self) -> alloc::vec::Vec<(PhysAddr, u64)> {
        let mut out = alloc::vec::Vec::new();
        if let Some(&(base, num_frames)) = self.regions.get(self.region_index) {
            let consumed = self.frame_index;
            if consumed < num_frames {
                let remaining_base = base
                    .checked_add(consumed * PAGE_SIZE)
                    .expect("frame address overflow");
                out.push((remaining_base, num_frames - consumed));
            }
        }
        for &(base, num_frames) in self.regions.iter().skip(self.region_index + 1) {
            out.push((base, num_frames));
        }
        out
    }
}

/// Phase-2 physical frame allocator: an embedded free list anchored in
/// the direct map. `insert_free_region` may only be called before the
/// first `alloc`/`free`.
pub struct FreeListFrameAllocator {
    list: EmbeddedFreeList,
    handover_complete: bool,
}

impl FreeListFrameAllocator {
    pub const fn new() -> Self {
        FreeListFrameAllocator {
            list: EmbeddedFreeList::new(),
            handover_complete: false,
        }
    }

    /// Adds `num_frames` frames starting at `base` to the pool. Must
    /// only be called during the one-time handover from the bootstrap
    /// allocator.
    ///
    /// # Panics
    /// Panics if called after any `alloc`/`free` on this allocator.
    ///
    /// # Safety
    /// `base.to_direct_map() .. base.to_direct_map() + num_frames *
    /// PAGE_SIZE` must be free, direct-mapped, exclusively-owned memory.
    pub unsafe fn insert_free_region(&mut self, base: PhysAddr, num_frames: u64) {
        assert!(
            !self.handover_complete,
            "insert_free_region called after allocator handover finished"
        );
        let vaddr = base.to_direct_map().as_u64();
        // SAFETY: forwarded from the caller.
        unsafe { self.list.insert(vaddr, num_frames * PAGE_SIZE) };
    }

    pub fn finish_handover(&mut self) {
        self.handover_complete = true;
    }

    pub fn alloc(&mut self) -> Result<Frame> {
        self.handover_complete = true;
        let vaddr = self.list.alloc(PAGE_SIZE).ok_or(Error::OutOfPhysicalMemory)?;
        let phys = crate::mm::addr::VirtAddr::new(vaddr).from_direct_map();
        Ok(Frame::containing(phys))
    }

    /// # Safety
    /// `frame` must currently be allocated (owned by the caller) and
    /// not concurrently accessed elsewhere.
    pub unsafe fn free(&mut self, frame: Frame) {
        self.handover_complete = true;
        let vaddr = frame.direct_mapped().as_u64();
        // SAFETY: forwarded from the caller.
        unsafe { self.list.free(vaddr, PAGE_SIZE) };
    }
}

impl Default for FreeListFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(base: u64, num_frames: u64, next: u64) -> crate::mm::bootloader_handoff::FreeListNode {
        crate::mm::bootloader_handoff::FreeListNode {
            base,
            num_frames,
            next,
        }
    }

    #[test]
    fn bootstrap_allocator_walks_regions_in_list_order() {
        // Build a tiny linked list: 0x00000(1) -> 0x10000(1) -> 0x20000(2) -> 0x30000(3)
        let n3 = Box::new(node(0x30000, 3, 0));
        let n3_ptr = &*n3 as *const _ as u64;
        let n2 = Box::new(node(0x20000, 2, n3_ptr));
        let n2_ptr = &*n2 as *const _ as u64;
        let n1 = Box::new(node(0x10000, 1, n2_ptr));
        let n1_ptr = &*n1 as *const _ as u64;
        let n0 = Box::new(node(0x00000, 1, n1_ptr));
        let n0_ptr = &*n0 as *const _ as u64;

        let boot_info = BootInfo {
            memory_map_ptr: 0,
            memory_map_count: 0,
            free_list_head_ptr: n0_ptr,
        };

        let mut alloc = unsafe { BootstrapFrameAllocator::new(&boot_info) };
        let expect = [
            0x00000u64, 0x10000, 0x20000, 0x21000, 0x30000, 0x31000, 0x32000,
        ];
        for e in expect {
            let f = alloc.alloc().unwrap();
            assert_eq!(f.start_address().as_u64(), e);
        }
        assert_eq!(alloc.alloc(), Err(Error::OutOfPhysicalMemory));

        // Keep the boxes alive for the whole test.
        drop((n0, n1, n2, n3));
    }
}
