//! # Program Loading
//!
//! Executable segments are registered page by page as lazily loaded
//! anonymous pages: the first touch reads the page's share of the file and
//! zero-fills the rest. Once loaded they behave like any other anonymous page
//! and are never written back to the executable.

use crate::addresses::{PAGE_SIZE, VirtualAddress};
use crate::error::VmError;
use crate::page::{FileSegment, Initializer, PageKind};
use crate::platform::BackingFile;
use crate::spt::SupplementalPageTable;
use crate::vm::Vm;
use alloc::sync::Arc;
use log::debug;

/// A loadable segment of an executable.
///
/// `read_bytes` bytes starting at `offset` in `file` are placed at `vaddr`,
/// followed by `zero_bytes` zeroes. The sum must be a whole number of pages.
#[derive(Clone)]
pub struct LoadSegment {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    pub vaddr: VirtualAddress,
    pub read_bytes: u64,
    pub zero_bytes: u64,
    pub writable: bool,
}

impl Vm {
    /// Register the pages of `segment` without reading anything yet.
    ///
    /// # Errors
    /// - [`VmError::InvalidMapping`] if the address, offset or size is not
    ///   page-aligned, or the file range overflows.
    /// - [`VmError::DuplicateMapping`] if the segment overlaps a registered page.
    ///   Pages registered before the overlap stay in the table; the caller is
    ///   expected to kill the half-loaded process.
    #[allow(clippy::cast_possible_truncation)]
    pub fn load_segment(
        &self,
        spt: &mut SupplementalPageTable,
        segment: &LoadSegment,
    ) -> Result<(), VmError> {
        let total = segment
            .read_bytes
            .checked_add(segment.zero_bytes)
            .ok_or(VmError::InvalidMapping("segment size overflows"))?;
        if !total.is_multiple_of(PAGE_SIZE) {
            return Err(VmError::InvalidMapping("segment size not page-aligned"));
        }
        if !segment.vaddr.is_page_aligned() {
            return Err(VmError::InvalidMapping("unaligned segment address"));
        }
        if !segment.offset.is_multiple_of(PAGE_SIZE) {
            return Err(VmError::InvalidMapping("unaligned segment offset"));
        }
        if segment.offset.checked_add(segment.read_bytes).is_none() {
            return Err(VmError::InvalidMapping("segment offset overflows"));
        }

        let mut page = segment.vaddr.page();
        let mut offset = segment.offset;
        let mut read_left = segment.read_bytes;
        for _ in 0..total / PAGE_SIZE {
            let page_read = read_left.min(PAGE_SIZE);
            let init = if page_read == 0 {
                Initializer::Zero
            } else {
                Initializer::Load(FileSegment::new(
                    Arc::clone(&segment.file),
                    offset,
                    page_read as usize,
                )?)
            };
            self.alloc_page_with_initializer(
                spt,
                PageKind::Anon,
                page.base(),
                segment.writable,
                init,
            )?;

            read_left -= page_read;
            offset += page_read;
            page = page.forward(1);
        }
        debug!(
            "vm: segment at {} ({} file bytes, {} zero bytes)",
            segment.vaddr, segment.read_bytes, segment.zero_bytes
        );
        Ok(())
    }

    /// Create and claim the first stack page.
    ///
    /// Returns the initial stack pointer (the configured stack top).
    ///
    /// # Errors
    /// Any error of [`Vm::alloc_page`] or [`Vm::claim_page`].
    pub fn setup_stack(&self, spt: &mut SupplementalPageTable) -> Result<VirtualAddress, VmError> {
        let top = self.config().user_stack_top;
        let page = (top - PAGE_SIZE).page();
        self.alloc_stack_page(spt, page)?;
        self.claim_page(spt, page.base())?;
        debug!("vm: stack page {page} ready, rsp {top}");
        Ok(top)
    }
}
