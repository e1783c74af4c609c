use super::{AnonPage, Backing, FilePage, FileSegment, PageKind};
use crate::addresses::VirtualPage;
use crate::error::VmError;
use crate::platform::FrameBuffer;
use log::trace;

/// How the content of a lazily created page is produced on first touch.
#[derive(Clone, Debug)]
pub enum Initializer {
    /// Zero-filled page (bss, heap, stack).
    Zero,
    /// `read_bytes` from a file, the rest of the page zeroed.
    Load(FileSegment),
}

impl Initializer {
    fn run(&self, page: VirtualPage, buf: &mut FrameBuffer) -> Result<(), VmError> {
        match self {
            Self::Zero => {
                buf.fill(0);
                Ok(())
            }
            Self::Load(segment) => segment.read_into(page, buf),
        }
    }
}

/// A page that has not been touched yet.
#[derive(Clone, Debug)]
pub struct UninitPage {
    target: PageKind,
    init: Initializer,
}

impl UninitPage {
    /// Delay creation of a `target` page until first touch.
    ///
    /// # Errors
    /// [`VmError::InvalidMapping`] for a file-backed page without a file
    /// segment to mirror.
    pub fn new(target: PageKind, init: Initializer) -> Result<Self, VmError> {
        if target == PageKind::File && !matches!(init, Initializer::Load(_)) {
            return Err(VmError::InvalidMapping("file-backed page needs a file segment"));
        }
        Ok(Self { target, init })
    }

    #[must_use]
    pub const fn target(&self) -> PageKind {
        self.target
    }

    #[must_use]
    pub const fn initializer(&self) -> &Initializer {
        &self.init
    }

    /// Produce the resolved backing and run the delayed initializer into `buf`.
    pub(super) fn initialize(
        &self,
        page: VirtualPage,
        buf: &mut FrameBuffer,
    ) -> Result<Backing, VmError> {
        let backing = match (&self.init, self.target) {
            (Initializer::Load(segment), PageKind::File) => {
                Backing::File(FilePage::new(segment.clone()))
            }
            (_, PageKind::Anon) => Backing::Anon(AnonPage::new()),
            (Initializer::Zero, PageKind::File) => {
                return Err(VmError::InvalidMapping("file-backed page needs a file segment"));
            }
        };
        self.init.run(page, buf)?;
        trace!("page {page}: uninit -> {:?}", self.target);
        Ok(backing)
    }
}
