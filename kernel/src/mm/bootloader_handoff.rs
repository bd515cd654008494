//! The boot-time handoff contract with whatever loaded this kernel.
//!
//! This is a small, custom, packed-struct contract (three pointers'
//! worth of data), not an integration with any particular bootloader
//! crate's richer boot-info format — see `DESIGN.md` for why.

use crate::mm::addr::PhysAddr;

/// E820-style memory-map entry `type` indicating the region is usable
/// RAM.
pub const MEMORY_TYPE_AVAILABLE: u64 = 1;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub ty: u64,
}

impl MemoryMapEntry {
    pub fn is_available(&self) -> bool {
        self.ty == MEMORY_TYPE_AVAILABLE
    }
}

/// A node in the bootloader's singly-linked list of free physical
/// regions. Lives at the physical address it describes, just like the
/// nodes of [`crate::mm::freelist::EmbeddedFreeList`], except this list
/// is built and handed to us by the bootloader rather than by this
/// kernel.
#[repr(C, packed)]
pub struct FreeListNode {
    pub base: u64,
    pub num_frames: u64,
    pub next: u64,
}

/// The struct the bootloader hands off control with.
#[repr(C, packed)]
pub struct BootInfo {
    pub memory_map_ptr: u64,
    pub memory_map_count: u64,
    pub free_list_head_ptr: u64,
}

impl BootInfo {
    /// # Safety
    /// `self.memory_map_ptr` must point at `self.memory_map_count`
    /// valid, readable `MemoryMapEntry` values for the duration of the
    /// returned slice's use.
    pub unsafe fn memory_map(&self) -> &[MemoryMapEntry] {
        let count = self.memory_map_count;
        // SAFETY: forwarded from the caller's obligation above.
        unsafe {
            core::slice::from_raw_parts(self.memory_map_ptr as *const MemoryMapEntry, count as usize)
        }
    }

    /// Iterates the bootloader's free-list nodes in order.
    ///
    /// # Safety
    /// `self.free_list_head_ptr` must either be null or point at a
    /// valid `FreeListNode`, whose `next` field transitively upholds the
    /// same guarantee for the remainder of the list.
    pub unsafe fn free_list(&self) -> FreeListIter {
        FreeListIter {
            next: self.free_list_head_ptr,
        }
    }
}

pub struct FreeListIter {
    next: u64,
}

impl Iterator for FreeListIter {
    /// `(base, num_frames)` of the next free region.
    type Item = (PhysAddr, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 {
            return None;
        }
        // SAFETY: upheld transitively by `BootInfo::free_list`'s caller
        // contract.
        let node = unsafe { &*(self.next as *const FreeListNode) };
        let base = node.base;
        let num_frames = node.num_frames;
        self.next = node.next;
        Some((PhysAddr::new(base), num_frames))
    }
}
