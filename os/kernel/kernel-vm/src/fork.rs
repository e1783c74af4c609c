//! # Address-Space Copy
//!
//! `fork` gives the child an independent copy of every page of the parent.
//! Pages are copied eagerly; there is no sharing between the two spaces.
//!
//! | Parent page | Child page |
//! |-------------|------------|
//! | uninit | uninit with the same initializer (file handles are shared) |
//! | resident | new frame with a byte copy, mapped in the child |
//! | swapped out / evicted | new frame filled from swap or file; the parent stays put |
//!
//! A child copy of a dirty resident page starts out dirty as well, so a file
//! page the parent has not written back yet is not lost when the child's copy
//! is evicted first.

use crate::addresses::VirtualPage;
use crate::error::VmError;
use crate::frame::FrameOwner;
use crate::page::PageRef;
use crate::platform::Mmu;
use crate::spt::SupplementalPageTable;
use crate::vm::Vm;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, warn};

impl Vm {
    /// Copy every page of `src` into the empty table `dst`.
    ///
    /// On error `dst` is rolled back to its previous state: every page added
    /// here is deallocated again.
    ///
    /// # Errors
    /// Any error of frame allocation, backing I/O or mapping. Frame
    /// exhaustion ([`VmError::OutOfMemory`]) is the common case.
    pub fn copy_address_space(
        &self,
        dst: &mut SupplementalPageTable,
        src: &SupplementalPageTable,
    ) -> Result<(), VmError> {
        let mut copied: Vec<VirtualPage> = Vec::new();
        for (va, page) in src.iter() {
            if let Err(e) = self.copy_page(dst, src.mmu(), page) {
                warn!("address space copy failed at {va}: {e}");
                for va in copied {
                    if let Some(page) = dst.detach(va) {
                        self.deallocate(&**dst.mmu(), &page);
                    }
                }
                return Err(e);
            }
            copied.push(va);
        }
        for region in src.mmap_regions() {
            dst.insert_region(region.clone());
        }
        debug!("vm: copied address space ({} pages)", copied.len());
        Ok(())
    }

    fn copy_page(
        &self,
        dst: &mut SupplementalPageTable,
        src_mmu: &Arc<dyn Mmu>,
        src_ref: &PageRef,
    ) -> Result<(), VmError> {
        let src = src_ref.lock();
        let child = src.fork();
        if src.is_uninit() {
            return dst.insert(child);
        }
        let (va, writable) = (src.va(), src.writable());
        // Content the parent has not written back yet is the child's too.
        let dirty = src.frame().is_some() && src_mmu.is_dirty(va);

        // Holding the source page lock keeps its frame from being evicted.
        let frame = self.frames().get_frame(self.mapper(), self.swap())?;
        // SAFETY: the frame is unbound, nobody else can reach it.
        let buf = unsafe { self.mapper().frame_mut(frame.base()) };
        if let Err(e) = src.snapshot(&self.backend(&**src_mmu), buf) {
            self.frames().release_frame(frame);
            return Err(e);
        }
        drop(src);

        let child = match dst.insert_ref(child) {
            Ok(child) => child,
            Err(e) => {
                self.frames().release_frame(frame);
                return Err(e);
            }
        };
        if !dst.mmu().map(va, frame.base(), writable) {
            dst.detach(va);
            self.frames().release_frame(frame);
            return Err(VmError::MapFailed(va));
        }
        if dirty {
            dst.mmu().set_dirty(va, true);
        }
        child.lock().bind(frame);
        self.frames()
            .bind(frame, FrameOwner::new(&child, va, Arc::clone(dst.mmu())));
        Ok(())
    }
}
