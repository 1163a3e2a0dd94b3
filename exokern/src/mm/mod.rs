//! Memory Management.
//!
//! This module implements the physical memory of the simulated machine: a
//! fixed pool of page frames handed out by a [`FrameAllocator`]. The core
//! abstraction is the [`Page`], which represents a single memory page.
//!
//! Memory allocation and deallocation is closely tied to Rust's ownership and
//! lifetime system: A page is allocated by creating an instance of the
//! [`Page`] struct. Cloning a [`Page`] shares the underlying frame and bumps
//! its reference count, which is how the same frame gets mapped into several
//! address spaces. Once the last [`Page`] instance is dropped, the frame is
//! automatically returned to its allocator, ensuring proper memory management
//! and preventing memory leaks.
pub mod page_table;
pub mod vpt;

use crate::{
    KernelError,
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa},
};
use spin::Mutex;
use std::sync::Arc;

// Frame allocation bitmap. 0: used, 1: unused
struct Arena {
    bitmap: Vec<u64>,
    nframes: usize,
    used: usize,
}

impl Arena {
    fn new(nframes: usize) -> Self {
        // Frame 0 stays reserved so that no page ever lives at Pa::ZERO.
        let total = nframes + 1;
        let mut bitmap = vec![u64::MAX; total.div_ceil(64)];
        bitmap[0] &= !1;
        // Pad back.
        for i in total..bitmap.len() * 64 {
            bitmap[i / 64] &= !(1 << (i % 64));
        }
        Self {
            bitmap,
            nframes,
            used: 0,
        }
    }

    fn alloc(&mut self) -> Option<usize> {
        // search first qword that contains one.
        let pos = self.bitmap.iter().position(|word| *word != 0)?;
        let ofs = self.bitmap[pos].trailing_zeros() as usize;
        self.bitmap[pos] &= !(1 << ofs);
        self.used += 1;
        Some(pos * 64 + ofs)
    }

    fn dealloc(&mut self, pfn: usize) {
        let (pos, ofs) = (pfn / 64, pfn % 64);
        debug_assert_eq!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] |= 1 << ofs;
        self.used -= 1;
    }
}

/// The physical frame pool of one simulated machine.
///
/// Every page frame, page directory and page table of the machine is drawn
/// from this pool. When it runs dry, allocation reports
/// [`KernelError::NoMemory`], which is how resource exhaustion reaches the
/// system-call layer.
pub struct FrameAllocator {
    arena: Mutex<Arena>,
}

impl FrameAllocator {
    /// Create a pool of `nframes` usable frames.
    pub fn new(nframes: usize) -> Arc<Self> {
        Arc::new(Self {
            arena: Mutex::new(Arena::new(nframes)),
        })
    }

    /// Number of frames that are currently unused.
    pub fn free_frames(&self) -> usize {
        let arena = self.arena.lock();
        arena.nframes - arena.used
    }

    /// Number of frames managed by this pool.
    pub fn total_frames(&self) -> usize {
        self.arena.lock().nframes
    }

    fn alloc(&self) -> Option<usize> {
        self.arena.lock().alloc()
    }

    fn dealloc(&self, pfn: usize) {
        self.arena.lock().dealloc(pfn)
    }
}

struct Frame {
    pfn: usize,
    data: Mutex<Box<[u8; PAGE_SIZE]>>,
    allocator: Arc<FrameAllocator>,
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.allocator.dealloc(self.pfn);
    }
}

/// A reference-counted handle to one physical page.
///
/// `Page` represents a single 4 KiB frame of the simulated physical memory.
/// The frame is zero-filled on allocation, shared by cloning, and released
/// when the last handle goes away.
///
/// ## Example:
/// ```
/// use exokern::mm::{FrameAllocator, Page};
///
/// let allocator = FrameAllocator::new(4);
/// let page = Page::new(&allocator).unwrap();
/// let alias = page.clone();
/// assert_eq!(page.pa(), alias.pa());
/// assert_eq!(page.ref_count(), 2);
/// ```
#[derive(Clone)]
pub struct Page {
    inner: Arc<Frame>,
}

impl Page {
    /// Allocate a new zero-filled page from `allocator`.
    ///
    /// # Returns
    /// - `Ok(Page)` on success.
    /// - `Err(KernelError::NoMemory)` if the pool is exhausted.
    pub fn new(allocator: &Arc<FrameAllocator>) -> Result<Self, KernelError> {
        let pfn = allocator.alloc().ok_or(KernelError::NoMemory)?;
        Ok(Self {
            inner: Arc::new(Frame {
                pfn,
                data: Mutex::new(Box::new([0; PAGE_SIZE])),
                allocator: allocator.clone(),
            }),
        })
    }

    /// Get the physical address of this page.
    ///
    /// # Returns
    /// - The physical address ([`Pa`]) of the page.
    #[inline]
    pub fn pa(&self) -> Pa {
        // Frame numbers are bounded by the pool size, far below 2^20.
        Pa::ZERO + (self.inner.pfn << PAGE_SHIFT)
    }

    /// Number of live handles on this frame.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the page.
    ///
    /// # Panics
    /// Panics if the range exceeds the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.inner.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy `buf` into the page starting at `offset`.
    ///
    /// # Panics
    /// Panics if the range exceeds the page.
    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut data = self.inner.data.lock();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:?}, refs: {})", self.pa(), self.ref_count())
    }
}
