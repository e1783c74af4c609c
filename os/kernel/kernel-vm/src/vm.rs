//! # Virtual Memory Manager
//!
//! [`Vm`] ties the global pieces together: the frame allocator, the kernel's
//! view of physical memory and the swap area. Per-process state lives in a
//! [`SupplementalPageTable`] that is passed into every operation.
//!
//! ## Claiming a page
//!
//! ```text
//!  lock page ─► get_frame ─► map VA→PA ─► swap_in/initialize ─► bind
//!                  │                            │
//!                  └─ may evict another page    └─ on error: unmap, release
//! ```
//!
//! A page is only recorded as resident once its content is in place, so a
//! failed claim leaves the page exactly as it was (an uninit page stays
//! uninit, a swapped page keeps its slot).

use crate::addresses::{VirtualAddress, VirtualPage};
use crate::error::VmError;
use crate::evict::EvictionPolicy;
use crate::frame::{FrameAllocator, FrameOwner};
use crate::layout::{VmConfig, is_user_address};
use crate::page::{Backend, Initializer, Page, PageKind, PageRef, UninitPage};
use crate::platform::{FramePool, Mmu, PhysMapper, SwapDevice};
use crate::spt::SupplementalPageTable;
use crate::swap::SwapArea;
use alloc::boxed::Box;
use alloc::sync::Arc;
use log::{debug, info, trace, warn};

pub struct Vm {
    frames: FrameAllocator,
    mapper: Arc<dyn PhysMapper>,
    swap: SwapArea,
    config: VmConfig,
}

impl Vm {
    #[must_use]
    pub fn new(
        pool: Box<dyn FramePool>,
        mapper: Arc<dyn PhysMapper>,
        swap: Arc<dyn SwapDevice>,
        policy: Box<dyn EvictionPolicy>,
        config: VmConfig,
    ) -> Self {
        let swap = SwapArea::new(swap);
        info!(
            "vm: {} swap slots, stack top {}, max stack {:#x}",
            swap.capacity(),
            config.user_stack_top,
            config.max_stack_size
        );
        Self {
            frames: FrameAllocator::new(pool, policy),
            mapper,
            swap,
            config,
        }
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[must_use]
    pub const fn swap(&self) -> &SwapArea {
        &self.swap
    }

    #[must_use]
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    pub(crate) fn mapper(&self) -> &dyn PhysMapper {
        &*self.mapper
    }

    pub(crate) fn backend<'a>(&'a self, mmu: &'a dyn Mmu) -> Backend<'a> {
        Backend {
            mapper: &*self.mapper,
            swap: &self.swap,
            mmu,
        }
    }

    /// Register a lazily initialized page at `va`.
    ///
    /// Nothing is allocated until the page is first touched.
    ///
    /// # Errors
    /// - [`VmError::InvalidMapping`] if `va` is unaligned or not a user address,
    ///   or a file-backed page comes without a file segment.
    /// - [`VmError::DuplicateMapping`] if a page already exists at `va`; the
    ///   table is unchanged.
    pub fn alloc_page_with_initializer(
        &self,
        spt: &mut SupplementalPageTable,
        kind: PageKind,
        va: VirtualAddress,
        writable: bool,
        init: Initializer,
    ) -> Result<(), VmError> {
        self.alloc_page_inner(spt, kind, va, writable, init, false)
    }

    /// Register a zero-filled page at `va`.
    ///
    /// # Errors
    /// See [`alloc_page_with_initializer`](Self::alloc_page_with_initializer).
    pub fn alloc_page(
        &self,
        spt: &mut SupplementalPageTable,
        kind: PageKind,
        va: VirtualAddress,
        writable: bool,
    ) -> Result<(), VmError> {
        self.alloc_page_inner(spt, kind, va, writable, Initializer::Zero, false)
    }

    pub(crate) fn alloc_page_inner(
        &self,
        spt: &mut SupplementalPageTable,
        kind: PageKind,
        va: VirtualAddress,
        writable: bool,
        init: Initializer,
        stack: bool,
    ) -> Result<(), VmError> {
        let page = VirtualPage::from_aligned(va)
            .ok_or(VmError::InvalidMapping("unaligned page address"))?;
        if !is_user_address(va) {
            return Err(VmError::InvalidMapping("page outside user space"));
        }
        let mut page = Page::new(page, writable, UninitPage::new(kind, init)?);
        if stack {
            page = page.into_stack();
        }
        spt.insert(page)?;
        trace!("page {va}: registered {kind:?} (writable: {writable}, stack: {stack})");
        Ok(())
    }

    /// Make the page at `va` resident and mapped.
    ///
    /// Claiming a page that is already resident succeeds without effect.
    ///
    /// # Errors
    /// - [`VmError::NotMapped`] if no page is registered at `va`.
    /// - [`VmError::OutOfMemory`] or [`VmError::SwapExhausted`] if no frame
    ///   could be obtained.
    /// - [`VmError::MapFailed`] or [`VmError::BackingIo`] if the page could not
    ///   be brought in; the page is left unchanged.
    pub fn claim_page(
        &self,
        spt: &SupplementalPageTable,
        va: VirtualAddress,
    ) -> Result<(), VmError> {
        let page = spt.find(va).ok_or(VmError::NotMapped(va))?;
        self.claim(spt.mmu(), page)
    }

    pub(crate) fn claim(&self, mmu: &Arc<dyn Mmu>, page_ref: &PageRef) -> Result<(), VmError> {
        let mut page = page_ref.lock();
        if page.frame().is_some() {
            return Ok(());
        }
        let va = page.va();

        let frame = self.frames.get_frame(&*self.mapper, &self.swap)?;
        if !mmu.map(va, frame.base(), page.writable()) {
            self.frames.release_frame(frame);
            warn!("claim of {va}: cannot install mapping");
            return Err(VmError::MapFailed(va));
        }
        if let Err(e) = page.swap_in(&self.backend(&**mmu), frame) {
            mmu.unmap(va);
            self.frames.release_frame(frame);
            warn!("claim of {va}: {e}");
            return Err(e);
        }

        page.bind(frame);
        self.frames
            .bind(frame, FrameOwner::new(page_ref, va, Arc::clone(mmu)));
        trace!("page {va}: resident in {}", frame.base());
        Ok(())
    }

    /// Tear a page down: write back or drop its content, then give its frame
    /// and mapping up.
    ///
    /// Safe to call on a page that is not resident.
    pub fn deallocate(&self, mmu: &dyn Mmu, page_ref: &PageRef) {
        let mut page = page_ref.lock();
        page.destroy(&self.backend(mmu));
        if let Some(frame) = page.take_frame() {
            mmu.unmap(page.va());
            self.frames.release_frame(frame);
        }
        trace!("page {}: deallocated", page.va());
    }

    /// Remove the page at `va` from `spt` and deallocate it.
    ///
    /// # Errors
    /// [`VmError::NotMapped`] if no page is registered at `va`.
    pub fn remove_page(
        &self,
        spt: &mut SupplementalPageTable,
        va: VirtualAddress,
    ) -> Result<(), VmError> {
        let page = spt.detach(va.page()).ok_or(VmError::NotMapped(va))?;
        self.deallocate(&**spt.mmu(), &page);
        Ok(())
    }

    /// Destroy every page of an address space, e.g. on process exit.
    ///
    /// Dirty file-backed pages are written back first. Afterwards the table
    /// is empty and holds no frames or swap slots.
    pub fn kill(&self, spt: &mut SupplementalPageTable) {
        let pages = spt.take_all();
        let count = pages.len();
        for page in pages.into_values() {
            self.deallocate(&**spt.mmu(), &page);
        }
        debug!("vm: address space torn down ({count} pages)");
    }
}
