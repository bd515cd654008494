//! Memory management: frame allocation, paging, address spaces, and the
//! kernel heap.
//!
//! Global singletons live here rather than in their defining submodules,
//! since the phase transition from the bootstrap frame allocator to the
//! phase-2 one is itself part of this module's `init` sequence.

pub mod addr;
pub mod bootloader_handoff;
pub mod freelist;
pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod vas;

use addr::Frame;
use bootloader_handoff::BootInfo;
use frame_allocator::{BootstrapFrameAllocator, FreeListFrameAllocator, Watermark};
use page_table::FrameSource;

use crate::error::Result;
use crate::sync::{OnceCell, SpinLock};

enum Allocator {
    Bootstrap(BootstrapFrameAllocator),
    Phase2(FreeListFrameAllocator),
}

struct GlobalFrameAllocator {
    inner: SpinLock<Allocator>,
}

impl GlobalFrameAllocator {
    fn alloc(&self) -> Result<Frame> {
        match &mut *self.inner.lock() {
            Allocator::Bootstrap(a) => a.alloc(),
            Allocator::Phase2(a) => a.alloc(),
        }
    }

    /// # Safety
    /// See [`FreeListFrameAllocator::free`].
    unsafe fn free(&self, frame: Frame) {
        match &mut *self.inner.lock() {
            Allocator::Bootstrap(a) => a.free(frame),
            Allocator::Phase2(a) => unsafe { a.free(frame) },
        }
    }
}

static FRAME_ALLOCATOR: OnceCell<GlobalFrameAllocator> = OnceCell::new();
static WATERMARK: Watermark = Watermark::new();

/// A [`FrameSource`] backed by whichever frame allocator phase is
/// currently active. Shared by every caller of `page_table::map` that
/// needs fresh frames for intermediate page-table levels rather than a
/// single, pre-picked data frame.
pub(crate) struct GlobalFrameSource;

impl FrameSource for GlobalFrameSource {
    fn alloc_frame(&mut self) -> Result<Frame> {
        FRAME_ALLOCATOR.get().alloc()
    }
}

/// Allocates one physical frame from whichever allocator phase is
/// currently active.
pub fn alloc_frame() -> Result<Frame> {
    FRAME_ALLOCATOR.get().alloc()
}

/// Frees `frame` back to the phase-2 allocator.
///
/// # Panics
/// Panics (via the bootstrap allocator) if called before the phase-2
/// handover has completed.
pub fn free_frame(frame: Frame) {
    // SAFETY: callers (page-table/address-space teardown) only ever
    // free frames they exclusively owned.
    unsafe { FRAME_ALLOCATOR.get().free(frame) };
}

/// Stage 1 of memory-management bring-up: install the bootstrap frame
/// allocator so early paging work (building the direct map) has
/// somewhere to get frames from.
///
/// # Safety
/// `boot_info` must be the untouched handoff struct passed by the
/// bootloader.
pub unsafe fn init_bootstrap(boot_info: &BootInfo) {
    // SAFETY: forwarded from the caller.
    let bootstrap = unsafe { BootstrapFrameAllocator::new(boot_info) };
    FRAME_ALLOCATOR.init(|| GlobalFrameAllocator {
        inner: SpinLock::new(Allocator::Bootstrap(bootstrap)),
    });
}

/// Stage 2: build the direct map using the bootstrap allocator, then
/// hand over every remaining bootstrap frame to a fresh phase-2
/// allocator anchored in that direct map.
///
/// `max_phys_addr` is the highest physical address this machine reports
/// (from the bootloader's memory map).
pub fn init_paging_and_handover(max_phys_addr: u64) -> Result<()> {
    let pml4_frame = page_table::current_pml4_frame();

    assert!(
        matches!(&*FRAME_ALLOCATOR.get().inner.lock(), Allocator::Bootstrap(_)),
        "init_paging_and_handover called after handover already ran"
    );

    let mut source = GlobalFrameSource;
    page_table::build_direct_map(pml4_frame, max_phys_addr, &mut source, &WATERMARK)?;

    let mut guard = FRAME_ALLOCATOR.get().inner.lock();
    let bootstrap = match core::mem::replace(&mut *guard, Allocator::Phase2(FreeListFrameAllocator::new())) {
        Allocator::Bootstrap(b) => b,
        Allocator::Phase2(_) => unreachable!("checked above"),
    };
    let regions = bootstrap.remaining_regions();
    if let Allocator::Phase2(phase2) = &mut *guard {
        for (base, num_frames) in regions {
            // SAFETY: these regions came straight from the bootstrap
            // allocator's remaining free list and are not referenced
            // anywhere else.
            unsafe { phase2.insert_free_region(base, num_frames) };
        }
        phase2.finish_handover();
    }
    Ok(())
}

/// Allocates and maps a fresh kernel stack, returning the virtual
/// address of its top (the first byte past the highest mapped address,
/// i.e. where a stack pointer starts).
///
/// `slot` selects a disjoint, guard-paged range within
/// `config::KERNEL_STACK_REGION_TOP`, so stacks for different processes
/// or CPUs never alias and none can grow into address 0 (see
/// `SPEC_FULL.md`'s REDESIGN FLAGS).
pub fn allocate_kernel_stack(slot: u64) -> Result<addr::VirtAddr> {
    use crate::config::{KERNEL_STACK_REGION_TOP, KERNEL_STACK_SIZE, PAGE_SIZE};
    use page_table::{DirectMapAccess, MapFlags};

    // One unmapped guard page separates consecutive stacks.
    let stride = KERNEL_STACK_SIZE + PAGE_SIZE;
    let top = KERNEL_STACK_REGION_TOP - slot * stride;
    let base = top - KERNEL_STACK_SIZE;
    let n_pages = KERNEL_STACK_SIZE / PAGE_SIZE;

    let pml4_frame = page_table::current_pml4_frame();
    let mut source = GlobalFrameSource;
    for i in 0..n_pages {
        let frame = alloc_frame()?;
        page_table::map(
            pml4_frame,
            addr::VirtAddr::new(base + i * PAGE_SIZE),
            frame.start_address(),
            MapFlags::WRITABLE | MapFlags::NO_EXECUTE | MapFlags::GLOBAL,
            1,
            &DirectMapAccess,
            &mut source,
        )?;
    }
    Ok(addr::VirtAddr::new(top))
}
