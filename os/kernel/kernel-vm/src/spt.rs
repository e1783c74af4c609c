//! # Supplemental Page Table
//!
//! Per-process map from page-aligned user addresses to [`Page`] descriptors,
//! plus the bookkeeping for file mappings created through
//! [`Vm::mmap`](crate::Vm::mmap). The table owns its pages; dropping an entry
//! without going through [`Vm::deallocate`](crate::Vm::deallocate) leaks the
//! frame until eviction reclaims it.

use crate::addresses::{VirtualAddress, VirtualPage};
use crate::error::VmError;
use crate::layout::is_user_address;
use crate::page::{Page, PageRef};
use crate::platform::{BackingFile, Mmu};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

/// A file mapping: `page_count` consecutive pages starting at `start`.
#[derive(Clone)]
pub struct MmapRegion {
    start: VirtualPage,
    page_count: u64,
    file: Arc<dyn BackingFile>,
}

impl MmapRegion {
    pub(crate) fn new(start: VirtualPage, page_count: u64, file: Arc<dyn BackingFile>) -> Self {
        Self {
            start,
            page_count,
            file,
        }
    }

    #[must_use]
    pub const fn start(&self) -> VirtualPage {
        self.start
    }

    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    #[must_use]
    pub fn file(&self) -> &Arc<dyn BackingFile> {
        &self.file
    }

    /// Every page of the region, lowest first.
    pub fn pages(&self) -> impl Iterator<Item = VirtualPage> + '_ {
        (0..self.page_count).map(|i| self.start.forward(i))
    }
}

impl fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapRegion")
            .field("start", &self.start)
            .field("page_count", &self.page_count)
            .finish_non_exhaustive()
    }
}

pub struct SupplementalPageTable {
    pages: BTreeMap<VirtualPage, PageRef>,
    mmaps: BTreeMap<VirtualPage, MmapRegion>,
    mmu: Arc<dyn Mmu>,
}

impl SupplementalPageTable {
    /// An empty table for the address space behind `mmu`.
    #[must_use]
    pub const fn new(mmu: Arc<dyn Mmu>) -> Self {
        Self {
            pages: BTreeMap::new(),
            mmaps: BTreeMap::new(),
            mmu,
        }
    }

    /// The hardware page table of this address space.
    #[must_use]
    pub const fn mmu(&self) -> &Arc<dyn Mmu> {
        &self.mmu
    }

    /// The page covering `va`. Any address inside the page finds it.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&PageRef> {
        self.pages.get(&va.page())
    }

    /// Take ownership of `page`.
    ///
    /// # Errors
    /// [`VmError::DuplicateMapping`] if a page already exists at the same
    /// address; `page` is dropped in that case.
    pub fn insert(&mut self, page: Page) -> Result<(), VmError> {
        self.insert_ref(page).map(drop)
    }

    pub(crate) fn insert_ref(&mut self, page: Page) -> Result<PageRef, VmError> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::DuplicateMapping(va));
        }
        let page = Arc::new(Mutex::new(page));
        self.pages.insert(va, Arc::clone(&page));
        Ok(page)
    }

    /// Remove the entry for `va` without tearing the page down.
    pub(crate) fn detach(&mut self, va: VirtualPage) -> Option<PageRef> {
        self.pages.remove(&va)
    }

    /// Remove every entry, leaving the table empty.
    pub(crate) fn take_all(&mut self) -> BTreeMap<VirtualPage, PageRef> {
        self.mmaps.clear();
        core::mem::take(&mut self.pages)
    }

    #[must_use]
    pub fn contains(&self, va: VirtualPage) -> bool {
        self.pages.contains_key(&va)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// All pages in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (VirtualPage, &PageRef)> {
        self.pages.iter().map(|(va, page)| (*va, page))
    }

    /// Whether a user access of `va` is backed by a page, respecting the
    /// page's write permission. Used to validate system-call buffers.
    #[must_use]
    pub fn is_user_accessible(&self, va: VirtualAddress, write: bool) -> bool {
        if va.is_null() || !is_user_address(va) {
            return false;
        }
        self.find(va).is_some_and(|page| !write || page.lock().writable())
    }

    /// The file mapping starting at `start`.
    #[must_use]
    pub fn mmap_region(&self, start: VirtualPage) -> Option<&MmapRegion> {
        self.mmaps.get(&start)
    }

    pub fn mmap_regions(&self) -> impl Iterator<Item = &MmapRegion> {
        self.mmaps.values()
    }

    pub(crate) fn insert_region(&mut self, region: MmapRegion) {
        self.mmaps.insert(region.start, region);
    }

    pub(crate) fn remove_region(&mut self, start: VirtualPage) -> Option<MmapRegion> {
        self.mmaps.remove(&start)
    }
}

impl fmt::Debug for SupplementalPageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupplementalPageTable")
            .field("pages", &self.pages.len())
            .field("mmaps", &self.mmaps.len())
            .finish_non_exhaustive()
    }
}
