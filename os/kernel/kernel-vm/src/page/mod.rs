//! # Pages
//!
//! A [`Page`] describes one page-aligned unit of a process's virtual address
//! space: where it lives, whether it may be written, how its content is
//! produced, and which frame currently holds that content (if any).
//!
//! ## Backing kinds
//!
//! Every page carries exactly one [`Backing`]:
//!
//! ```text
//!                 first touch
//!   ┌──────────┐ ─────────────► ┌────────────┐  evict   ┌────────────┐
//!   │  Uninit  │                │ Anon│File  │ ───────► │ Anon│File  │
//!   │ (lazy)   │                │ (resident) │ ◄─────── │ (swapped)  │
//!   └──────────┘                └────────────┘  fault   └────────────┘
//! ```
//!
//! - [`UninitPage`] records the *target* kind and the delayed [`Initializer`].
//!   It turns into its target exactly once, when its content is first needed.
//! - [`AnonPage`] has no durable home; evicted content goes to a swap slot.
//! - [`FilePage`] mirrors a range of an open file; eviction writes dirty
//!   content back to the file instead of to swap.
//!
//! All three share one contract, exposed on [`Backing`]: `swap_in` (which is
//! the first-touch initializer for uninit pages), `swap_out` and `destroy`.
//! Frames are never released here; that is the caller's job.
//!
//! ## Ownership
//!
//! The supplemental page table owns each page through a [`PageRef`]. The frame
//! table only keeps a weak back-reference, so a page that has been
//! deallocated can never be reached through a stale frame entry.

mod anon;
mod file;
mod uninit;

pub use anon::AnonPage;
pub use file::{FilePage, FileSegment};
pub use uninit::{Initializer, UninitPage};

use crate::addresses::VirtualPage;
use crate::error::VmError;
use crate::frame::FrameRef;
use crate::platform::{FrameBuffer, Mmu, PhysMapper};
use crate::swap::SwapArea;
use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

/// Shared handle to a page owned by a supplemental page table.
pub type PageRef = Arc<Mutex<Page>>;

/// The kind a page is, or will become once initialized.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageKind {
    Anon,
    File,
}

/// Everything a backing needs to move content around.
///
/// `mmu` is the address space the page belongs to, which is not necessarily
/// the one of the current process (eviction works across processes).
pub struct Backend<'a> {
    pub mapper: &'a dyn PhysMapper,
    pub swap: &'a SwapArea,
    pub mmu: &'a dyn Mmu,
}

/// The content strategy of a page.
pub enum Backing {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

impl Backing {
    /// Fill `buf` with the page's content.
    ///
    /// For an uninit page this is the first-touch initialization: the backing
    /// is replaced by its resolved kind. On error the backing is left as it
    /// was, so no state is lost.
    fn swap_in(
        &mut self,
        page: VirtualPage,
        io: &Backend<'_>,
        buf: &mut FrameBuffer,
    ) -> Result<(), VmError> {
        match self {
            Self::Uninit(uninit) => {
                let resolved = uninit.initialize(page, buf)?;
                *self = resolved;
                Ok(())
            }
            Self::Anon(anon) => anon.swap_in(page, io, buf),
            Self::File(file) => file.swap_in(page, buf),
        }
    }

    /// Persist `buf` somewhere durable so the frame can be reused.
    fn swap_out(
        &mut self,
        page: VirtualPage,
        io: &Backend<'_>,
        buf: &FrameBuffer,
    ) -> Result<(), VmError> {
        match self {
            Self::Uninit(_) => Err(VmError::NotResident(page)),
            Self::Anon(anon) => anon.swap_out(page, io, buf),
            Self::File(file) => file.swap_out(page, io, buf),
        }
    }

    /// Release variant resources. `resident` is the frame content, if bound.
    fn destroy(&mut self, page: VirtualPage, io: &Backend<'_>, resident: Option<&FrameBuffer>) {
        match self {
            Self::Uninit(_) => {}
            Self::Anon(anon) => anon.destroy(io),
            Self::File(file) => file.destroy(page, io, resident),
        }
    }

    /// The backing a cloned address space starts out with.
    fn fork(&self) -> Self {
        match self {
            Self::Uninit(uninit) => Self::Uninit(uninit.clone()),
            Self::Anon(_) => Self::Anon(AnonPage::new()),
            Self::File(file) => Self::File(file.clone()),
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninit(u) => f.debug_tuple("Uninit").field(&u.target()).finish(),
            Self::Anon(a) => f.debug_tuple("Anon").field(a).finish(),
            Self::File(p) => f.debug_tuple("File").field(p.segment()).finish(),
        }
    }
}

/// One virtual page of one process.
#[derive(Debug)]
pub struct Page {
    va: VirtualPage,
    writable: bool,
    stack: bool,
    backing: Backing,
    frame: Option<FrameRef>,
}

impl Page {
    /// A fresh, lazily initialized page. All pages start out this way.
    #[must_use]
    pub const fn new(va: VirtualPage, writable: bool, uninit: UninitPage) -> Self {
        Self {
            va,
            writable,
            stack: false,
            backing: Backing::Uninit(uninit),
            frame: None,
        }
    }

    /// Mark the page as part of the user stack.
    #[must_use]
    pub fn into_stack(mut self) -> Self {
        self.stack = true;
        self
    }

    #[must_use]
    pub const fn va(&self) -> VirtualPage {
        self.va
    }

    #[must_use]
    pub const fn writable(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub const fn is_stack(&self) -> bool {
        self.stack
    }

    /// The frame currently holding this page's content.
    #[must_use]
    pub const fn frame(&self) -> Option<FrameRef> {
        self.frame
    }

    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    #[must_use]
    pub const fn is_uninit(&self) -> bool {
        matches!(self.backing, Backing::Uninit(_))
    }

    /// The kind this page is, or will become after first touch.
    #[must_use]
    pub const fn kind(&self) -> PageKind {
        match &self.backing {
            Backing::Uninit(uninit) => uninit.target(),
            Backing::Anon(_) => PageKind::Anon,
            Backing::File(_) => PageKind::File,
        }
    }

    /// Populate `frame` with this page's content.
    ///
    /// Does not record the binding; the caller does that once the mapping is
    /// installed.
    pub(crate) fn swap_in(&mut self, io: &Backend<'_>, frame: FrameRef) -> Result<(), VmError> {
        // SAFETY: `frame` came from the frame allocator unbound, so no page
        // and no other thread can reach it.
        let buf = unsafe { io.mapper.frame_mut(frame.base()) };
        self.backing.swap_in(self.va, io, buf)
    }

    /// Persist the content and give up the frame binding.
    ///
    /// Returns the frame that used to hold the page. The hardware mapping is
    /// left in place for the caller to remove.
    pub(crate) fn swap_out(&mut self, io: &Backend<'_>) -> Result<FrameRef, VmError> {
        let frame = self.frame.ok_or(VmError::NotResident(self.va))?;
        // SAFETY: the frame is bound to this page and the page lock is held.
        let buf = unsafe { io.mapper.frame_mut(frame.base()) };
        self.backing.swap_out(self.va, io, buf)?;
        self.frame = None;
        Ok(frame)
    }

    /// Release backing resources (swap slot, dirty file content).
    pub(crate) fn destroy(&mut self, io: &Backend<'_>) {
        // SAFETY: the frame is bound to this page and the page lock is held.
        let resident = self
            .frame
            .map(|frame| unsafe { &*io.mapper.frame_mut(frame.base()) });
        self.backing.destroy(self.va, io, resident);
    }

    /// Copy the current content of an initialized page into `buf` without
    /// changing this page's state.
    pub(crate) fn snapshot(&self, io: &Backend<'_>, buf: &mut FrameBuffer) -> Result<(), VmError> {
        if let Some(frame) = self.frame {
            // SAFETY: the frame is bound to this page and the page lock is
            // held; `buf` belongs to a different, unbound frame.
            let src = unsafe { io.mapper.frame_mut(frame.base()) };
            buf.copy_from_slice(src);
            return Ok(());
        }
        match &self.backing {
            Backing::Uninit(_) => Err(VmError::NotResident(self.va)),
            Backing::Anon(anon) => anon.peek(self.va, io, buf),
            Backing::File(file) => file.segment().read_into(self.va, buf),
        }
    }

    /// A page for a cloned address space at the same address.
    pub(crate) fn fork(&self) -> Self {
        Self {
            va: self.va,
            writable: self.writable,
            stack: self.stack,
            backing: self.backing.fork(),
            frame: None,
        }
    }

    pub(crate) const fn bind(&mut self, frame: FrameRef) {
        self.frame = Some(frame);
    }

    pub(crate) const fn take_frame(&mut self) -> Option<FrameRef> {
        self.frame.take()
    }
}
