use super::Backend;
use crate::addresses::{PAGE_BYTES, VirtualPage};
use crate::error::VmError;
use crate::platform::{BackingFile, FrameBuffer};
use alloc::sync::Arc;
use core::fmt;
use log::{trace, warn};

/// One page worth of a file: `read_bytes` at `offset`, the rest zero.
#[derive(Clone)]
pub struct FileSegment {
    file: Arc<dyn BackingFile>,
    offset: u64,
    read_bytes: usize,
}

impl FileSegment {
    /// # Errors
    /// [`VmError::InvalidMapping`] if `read_bytes` exceeds a page.
    pub fn new(
        file: Arc<dyn BackingFile>,
        offset: u64,
        read_bytes: usize,
    ) -> Result<Self, VmError> {
        if read_bytes > PAGE_BYTES {
            return Err(VmError::InvalidMapping("segment larger than a page"));
        }
        Ok(Self {
            file,
            offset,
            read_bytes,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<dyn BackingFile> {
        &self.file
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    #[must_use]
    pub const fn zero_bytes(&self) -> usize {
        PAGE_BYTES - self.read_bytes
    }

    pub(crate) fn read_into(
        &self,
        page: VirtualPage,
        buf: &mut FrameBuffer,
    ) -> Result<(), VmError> {
        let (head, tail) = buf.split_at_mut(self.read_bytes);
        if self.file.read_at(self.offset, head) != self.read_bytes {
            return Err(VmError::BackingIo { page });
        }
        tail.fill(0);
        Ok(())
    }

    fn write_back(&self, page: VirtualPage, buf: &FrameBuffer) -> Result<(), VmError> {
        if self.read_bytes == 0 {
            return Ok(());
        }
        if self.file.write_at(self.offset, &buf[..self.read_bytes]) != self.read_bytes {
            return Err(VmError::BackingIo { page });
        }
        trace!("page {page}: wrote {} bytes back at offset {:#x}", self.read_bytes, self.offset);
        Ok(())
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish_non_exhaustive()
    }
}

/// A page mirroring part of a file. Dirty content is written back on
/// eviction and on teardown; clean content is simply dropped.
#[derive(Clone, Debug)]
pub struct FilePage {
    segment: FileSegment,
}

impl FilePage {
    pub(super) const fn new(segment: FileSegment) -> Self {
        Self { segment }
    }

    #[must_use]
    pub const fn segment(&self) -> &FileSegment {
        &self.segment
    }

    pub(super) fn swap_in(&self, page: VirtualPage, buf: &mut FrameBuffer) -> Result<(), VmError> {
        self.segment.read_into(page, buf)
    }

    pub(super) fn swap_out(
        &self,
        page: VirtualPage,
        io: &Backend<'_>,
        buf: &FrameBuffer,
    ) -> Result<(), VmError> {
        if io.mmu.is_dirty(page) {
            self.segment.write_back(page, buf)?;
            io.mmu.set_dirty(page, false);
        }
        Ok(())
    }

    pub(super) fn destroy(
        &self,
        page: VirtualPage,
        io: &Backend<'_>,
        resident: Option<&FrameBuffer>,
    ) {
        let Some(buf) = resident else { return };
        if !io.mmu.is_dirty(page) {
            return;
        }
        // Teardown cannot fail; a lost write-back is reported and dropped.
        match self.segment.write_back(page, buf) {
            Ok(()) => io.mmu.set_dirty(page, false),
            Err(e) => warn!("{e} during teardown"),
        }
    }
}
