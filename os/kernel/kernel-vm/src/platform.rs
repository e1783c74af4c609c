//! # Platform Primitives
//!
//! The VM core never touches hardware page-table entries, the physical pool,
//! disks or the filesystem directly. Everything below it is reached through
//! the narrow traits in this module:
//!
//! | Trait | Provided by | Used for |
//! |-------|-------------|----------|
//! | [`FramePool`] | physical memory manager | obtaining and returning user frames |
//! | [`PhysMapper`] | kernel (HHDM) | reading and writing a frame's bytes |
//! | [`Mmu`] | paging code, one per address space | installing VA → PA mappings |
//! | [`SwapDevice`] | block layer | page-sized swap slots |
//! | [`BackingFile`] | filesystem | lazy segment loads and mmap write-back |

use crate::addresses::{PAGE_BYTES, PhysicalPage, VirtualPage};

/// One frame worth of bytes.
pub type FrameBuffer = [u8; PAGE_BYTES];

/// Source of physical frames for user pages.
///
/// Returns `None` when the pool is exhausted; the frame allocator then falls
/// back to eviction.
pub trait FramePool: Send {
    /// Allocate one page-aligned frame, optionally zeroed.
    fn alloc_page(&mut self, zeroed: bool) -> Option<PhysicalPage>;

    /// Return a frame previously handed out by [`alloc_page`](Self::alloc_page).
    fn free_page(&mut self, frame: PhysicalPage);
}

/// Kernel-side view of physical frames (e.g. via a higher-half direct map).
pub trait PhysMapper: Send + Sync {
    /// Borrow the content of `frame`.
    ///
    /// # Safety
    /// - `frame` must be a frame handed out by the [`FramePool`] and not yet freed.
    /// - The caller must own the frame exclusively for `'a`: no other
    ///   reference to the same frame may be alive at the same time.
    unsafe fn frame_mut<'a>(&self, frame: PhysicalPage) -> &'a mut FrameBuffer;
}

/// Hardware page-table primitive of one address space.
///
/// All methods take `&self`; implementations synchronize internally the same
/// way a hardware walker tolerates concurrent readers.
pub trait Mmu: Send + Sync {
    /// Install `page → frame`. Returns `false` if the mapping could not be
    /// created (e.g. no memory for intermediate tables).
    fn map(&self, page: VirtualPage, frame: PhysicalPage, writable: bool) -> bool;

    /// Remove the mapping for `page`, if any.
    fn unmap(&self, page: VirtualPage);

    /// Translate `page` to the frame it is mapped to.
    fn query(&self, page: VirtualPage) -> Option<PhysicalPage>;

    fn is_dirty(&self, page: VirtualPage) -> bool;
    fn set_dirty(&self, page: VirtualPage, dirty: bool);
    fn is_accessed(&self, page: VirtualPage) -> bool;
    fn set_accessed(&self, page: VirtualPage, accessed: bool);
}

/// A page-granular swap area.
pub trait SwapDevice: Send + Sync {
    /// Number of page-sized slots on the device.
    fn slot_count(&self) -> usize;

    /// Read slot `slot` into `buf`. Returns `false` on device error.
    fn read_slot(&self, slot: usize, buf: &mut FrameBuffer) -> bool;

    /// Write `buf` into slot `slot`. Returns `false` on device error.
    fn write_slot(&self, slot: usize, buf: &FrameBuffer) -> bool;
}

/// An open file as seen by the VM core.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns the number of bytes read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;

    /// Write `buf` at `offset`; returns the number of bytes written.
    fn write_at(&self, offset: u64, buf: &[u8]) -> usize;

    /// Current length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
