//! Lazy-growing kernel heap.
//!
//! Backed by the same [`EmbeddedFreeList`] the phase-2 frame allocator
//! uses, rather than a generic linked-list-allocator crate (see
//! `DESIGN.md`). Every live allocation is preceded by a [`Metadata`]
//! block whose `token` field is an XOR-with-magic check: freeing a
//! pointer whose token doesn't match panics, catching double frees and
//! frees of non-heap pointers. Direct port of
//! `kernel/memory/heapallocator.cpp`.

use core::alloc::{GlobalAlloc, Layout};

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::mm::addr::VirtAddr;
use crate::mm::freelist::EmbeddedFreeList;
use crate::mm::page_table::{self, DirectMapAccess, FrameSource, MapFlags};
use crate::sync::SpinLock;

/// Matches the reference kernel's magic constant exactly, so a heap
/// dump from either implementation is recognisable by the same value.
const MAGIC_NUMBER: u64 = 0x1412_041b_1414_0207;

#[repr(C)]
struct Metadata {
    user_size: u64,
    token: u64,
}

const METADATA_SIZE: u64 = core::mem::size_of::<Metadata>() as u64;

pub struct HeapAllocator {
    heap_start: VirtAddr,
    max_size: u64,
    current_size: u64,
    free_list: EmbeddedFreeList,
    pml4: Option<crate::mm::addr::Frame>,
}

impl HeapAllocator {
    /// # Panics
    /// Panics if `max_size` is not a multiple of the page size.
    pub const fn new(heap_start: VirtAddr, max_size: u64) -> Self {
        assert!(max_size % PAGE_SIZE == 0, "heap max size must be page-aligned");
        HeapAllocator {
            heap_start,
            max_size,
            current_size: 0,
            free_list: EmbeddedFreeList::new(),
            pml4: None,
        }
    }

    /// Must be called once, after paging is up, before the first
    /// allocation.
    pub fn bind_address_space(&mut self, pml4: crate::mm::addr::Frame) {
        self.pml4 = Some(pml4);
    }

    pub fn alloc(&mut self, size: u64) -> Result<VirtAddr> {
        loop {
            if let Some(addr) = self.free_list.alloc(size + METADATA_SIZE) {
                let meta_ptr = addr as *mut Metadata;
                let user_addr = addr + METADATA_SIZE;
                let token = user_addr ^ MAGIC_NUMBER;
                // SAFETY: `addr` was just carved out of the free list,
                // so this kernel exclusively owns it.
                unsafe {
                    meta_ptr.write(Metadata {
                        user_size: size,
                        token,
                    });
                }
                return Ok(VirtAddr::new(user_addr));
            }

            if self.current_size + PAGE_SIZE > self.max_size {
                return Err(Error::MaxHeapSizeReached);
            }
            self.grow_by_one_page()?;
        }
    }

    /// # Safety
    /// `addr` must be a pointer previously returned by `alloc` on this
    /// allocator, not already freed.
    pub unsafe fn free(&mut self, addr: VirtAddr) {
        let user_addr = addr.as_u64();
        let meta_ptr = (user_addr - METADATA_SIZE) as *const Metadata;
        // SAFETY: forwarded from the caller.
        let meta = unsafe { &*meta_ptr };
        let expected_token = user_addr ^ MAGIC_NUMBER;
        assert!(
            meta.token == expected_token,
            "heap corruption or double free detected at {user_addr:#x}"
        );
        let block_addr = user_addr - METADATA_SIZE;
        let block_size = meta.user_size + METADATA_SIZE;
        // SAFETY: the token check above establishes this is a live
        // allocation made by this allocator.
        unsafe { self.free_list.free(block_addr, block_size) };
    }

    fn grow_by_one_page(&mut self) -> Result<()> {
        let pml4 = self.pml4.expect("HeapAllocator used before bind_address_space");
        // The frame being mapped in is passed as `map`'s `paddr` argument
        // below, not pulled from `frames` — `frames` is only consulted
        // for intermediate PDPT/PD/PT levels still missing for this part
        // of the heap's virtual range, and those must come from the
        // general pool, never from the data frame itself.
        let frame = crate::mm::alloc_frame()?;
        let mapped_addr = VirtAddr::new(self.heap_start.as_u64() + self.current_size);
        let access = DirectMapAccess;
        let mut source = crate::mm::GlobalFrameSource;
        page_table::map(
            pml4,
            mapped_addr,
            frame.start_address(),
            MapFlags::WRITABLE,
            1,
            &access,
            &mut source,
        )?;
        self.current_size += PAGE_SIZE;
        // SAFETY: the page was just mapped, writable, and is not yet
        // tracked by any other structure.
        unsafe { self.free_list.insert(mapped_addr.as_u64(), PAGE_SIZE) };
        Ok(())
    }
}

static HEAP: SpinLock<Option<HeapAllocator>> = SpinLock::new(None);

/// Installs the global heap allocator. Must run once, after paging and
/// the phase-2 frame allocator are both initialised.
pub fn init(heap_start: VirtAddr, max_size: u64, pml4: crate::mm::addr::Frame) {
    let mut allocator = HeapAllocator::new(heap_start, max_size);
    allocator.bind_address_space(pml4);
    *HEAP.lock() = Some(allocator);
}

pub struct GlobalHeap;

// SAFETY: `GlobalAlloc` requires the implementation to be safe to call
// concurrently, which `SpinLock` provides; allocation failure is
// signalled by returning a null pointer, matching the trait's contract.
unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = HEAP.lock();
        let heap = guard.as_mut().expect("global heap used before mm::heap::init");
        match heap.alloc(layout.size() as u64) {
            Ok(addr) => addr.as_mut_ptr(),
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut guard = HEAP.lock();
        let heap = guard.as_mut().expect("global heap used before mm::heap::init");
        // SAFETY: `ptr` was returned by `alloc` above and `GlobalAlloc`
        // guarantees it is not freed twice in well-formed programs; the
        // token check inside `free` additionally catches misuse.
        unsafe { heap.free(VirtAddr::new(ptr as u64)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap(max_size: u64) -> HeapAllocator {
        // Host-side tests exercise the free-list/metadata logic directly
        // against a plain buffer, bypassing real paging.
        let buf = Box::leak(vec![0u8; max_size as usize].into_boxed_slice());
        let start = VirtAddr::new(buf.as_mut_ptr() as u64);
        let mut heap = HeapAllocator::new(start, max_size);
        // SAFETY: `buf` is a single `max_size`-byte region this test
        // exclusively owns; inserting all of it as already "grown"
        // memory lets these tests exercise `alloc`/`free` without a
        // real frame allocator or page mapper.
        unsafe { heap.free_list.insert(start.as_u64(), max_size) };
        heap.current_size = max_size;
        heap
    }

    #[test]
    fn successive_allocations_are_spaced_by_metadata_size() {
        let mut heap = test_heap(4096);
        let a = heap.alloc(10).unwrap();
        let b = heap.alloc(10).unwrap();
        assert_eq!(b.as_u64() - a.as_u64(), 10 + METADATA_SIZE);
    }

    #[test]
    fn free_then_alloc_reuses_the_same_address() {
        let mut heap = test_heap(4096);
        let a = heap.alloc(10).unwrap();
        unsafe { heap.free(a) };
        let c = heap.alloc(10).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn free_with_bad_token_panics() {
        let mut heap = test_heap(4096);
        let a = heap.alloc(10).unwrap();
        let bogus = VirtAddr::new(a.as_u64() + 1);
        unsafe { heap.free(bogus) };
    }
}
