//! # Memory-Mapped Files
//!
//! `mmap` registers one lazily loaded, file-backed page per page of the
//! requested range. Bytes past the end of the file (or past `length`) read as
//! zero and are never written back. Writes reach the file when a dirty page is
//! evicted, unmapped or torn down with its process.

use crate::addresses::{PAGE_SIZE, VirtualAddress, VirtualPage, pages_for};
use crate::error::VmError;
use crate::layout::is_user_address;
use crate::page::{FileSegment, Initializer, PageKind};
use crate::platform::BackingFile;
use crate::spt::{MmapRegion, SupplementalPageTable};
use crate::vm::Vm;
use alloc::sync::Arc;
use log::debug;

impl Vm {
    /// Map `length` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// Returns `addr` on success.
    ///
    /// # Errors
    /// [`VmError::InvalidMapping`] if `addr` is null or unaligned, `length` is
    /// zero, `offset` is unaligned or too large, the file is empty, the range
    /// leaves user space, or the range overlaps a registered page. The table is unchanged.
    #[allow(clippy::cast_possible_truncation)]
    pub fn mmap(
        &self,
        spt: &mut SupplementalPageTable,
        addr: VirtualAddress,
        length: u64,
        writable: bool,
        file: Arc<dyn BackingFile>,
        offset: u64,
    ) -> Result<VirtualAddress, VmError> {
        let start = VirtualPage::from_aligned(addr)
            .filter(|_| !addr.is_null())
            .ok_or(VmError::InvalidMapping("address must be page-aligned and non-null"))?;
        if length == 0 {
            return Err(VmError::InvalidMapping("zero-length mapping"));
        }
        if !offset.is_multiple_of(PAGE_SIZE) {
            return Err(VmError::InvalidMapping("unaligned file offset"));
        }
        let file_len = file.len();
        if file_len == 0 {
            return Err(VmError::InvalidMapping("cannot map an empty file"));
        }
        let page_count = pages_for(length);
        let span = page_count
            .checked_mul(PAGE_SIZE)
            .ok_or(VmError::InvalidMapping("range leaves user space"))?;
        let fits = addr
            .checked_add(span)
            .is_some_and(|end| is_user_address(end - 1));
        if !fits {
            return Err(VmError::InvalidMapping("range leaves user space"));
        }
        if offset.checked_add(span).is_none() {
            return Err(VmError::InvalidMapping("offset overflows"));
        }
        if (0..page_count).any(|i| spt.contains(start.forward(i))) {
            return Err(VmError::InvalidMapping("range overlaps an existing page"));
        }

        let mut file_left = length.min(file_len.saturating_sub(offset));
        for i in 0..page_count {
            let page_read = file_left.min(PAGE_SIZE);
            let page_offset = offset + i * PAGE_SIZE;
            let registered = FileSegment::new(Arc::clone(&file), page_offset, page_read as usize)
                .and_then(|segment| {
                    self.alloc_page_with_initializer(
                        spt,
                        PageKind::File,
                        start.forward(i).base(),
                        writable,
                        Initializer::Load(segment),
                    )
                });
            if let Err(e) = registered {
                for done in 0..i {
                    if let Some(page) = spt.detach(start.forward(done)) {
                        self.deallocate(&**spt.mmu(), &page);
                    }
                }
                return Err(e);
            }
            file_left -= page_read;
        }

        spt.insert_region(MmapRegion::new(start, page_count, file));
        debug!("vm: mapped {page_count} file pages at {addr} (offset {offset:#x})");
        Ok(addr)
    }

    /// Remove the file mapping that starts at `addr`.
    ///
    /// Dirty resident pages are written back before their frames are freed.
    ///
    /// # Errors
    /// [`VmError::NotMapped`] if no mapping starts at `addr`.
    pub fn munmap(
        &self,
        spt: &mut SupplementalPageTable,
        addr: VirtualAddress,
    ) -> Result<(), VmError> {
        if !addr.is_page_aligned() {
            return Err(VmError::NotMapped(addr));
        }
        let region = spt.remove_region(addr.page()).ok_or(VmError::NotMapped(addr))?;
        for page in region.pages() {
            if let Some(page) = spt.detach(page) {
                self.deallocate(&**spt.mmu(), &page);
            }
        }
        debug!("vm: unmapped {} file pages at {addr}", region.page_count());
        Ok(())
    }
}
