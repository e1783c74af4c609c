//! # Frame Table
//!
//! Global bookkeeping for every physical frame currently used by a user page.
//!
//! ```text
//!  slots:  [ F0 ] [ -- ] [ F2 ] [ F3 ]     arena indexed by FrameId
//!            │             │      │
//!            ▼             ▼      ▼
//!          owner         owner  (unbound: being filled by a fault)
//!
//!  ring:   F2, F0                           bound frames, oldest first
//! ```
//!
//! A frame is either *unbound* (handed out by [`FrameAllocator::get_frame`]
//! and not yet attached to a page) or *bound* to exactly one page. Only bound
//! frames are eviction candidates; an unbound frame belongs to whoever
//! requested it.
//!
//! ## Locking
//!
//! The table sits behind a single spin lock. Eviction runs with that lock
//! held and only ever *tries* to lock a victim page, so a fault that holds its
//! own page lock while waiting for the table can never deadlock against it.
//! Lock order: page → frame table → swap bitmap.

use crate::addresses::{PhysicalPage, VirtualPage};
use crate::error::VmError;
use crate::evict::EvictionPolicy;
use crate::page::{Backend, Page};
use crate::platform::{FramePool, Mmu, PhysMapper};
use crate::swap::SwapArea;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::{error, trace, warn};
use spin::Mutex;

/// Index of a frame-table entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameId(usize);

impl FrameId {
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Handle to a frame handed out by the [`FrameAllocator`].
///
/// `seq` distinguishes successive uses of the same table slot, so a stale
/// handle can never release somebody else's frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameRef {
    id: FrameId,
    base: PhysicalPage,
    seq: u64,
}

impl FrameRef {
    #[must_use]
    pub const fn id(&self) -> FrameId {
        self.id
    }

    /// Physical base address of the frame.
    #[must_use]
    pub const fn base(&self) -> PhysicalPage {
        self.base
    }
}

/// The page a bound frame backs, and where that page is mapped.
pub(crate) struct FrameOwner {
    page: Weak<Mutex<Page>>,
    va: VirtualPage,
    mmu: Arc<dyn Mmu>,
}

impl FrameOwner {
    pub(crate) fn new(page: &Arc<Mutex<Page>>, va: VirtualPage, mmu: Arc<dyn Mmu>) -> Self {
        Self {
            page: Arc::downgrade(page),
            va,
            mmu,
        }
    }
}

struct FrameEntry {
    base: PhysicalPage,
    seq: u64,
    owner: Option<FrameOwner>,
}

/// Outcome of one eviction attempt.
enum Attempt {
    Evicted(FrameRef),
    /// The victim is busy; try another one.
    Skip,
    /// The ring held a frame that is no longer in the table.
    Gone,
}

struct FrameTable {
    slots: Vec<Option<FrameEntry>>,
    free_ids: Vec<FrameId>,
    ring: VecDeque<FrameId>,
    pool: Box<dyn FramePool>,
    policy: Box<dyn EvictionPolicy>,
    next_seq: u64,
    evictions: u64,
}

impl FrameTable {
    fn insert(&mut self, base: PhysicalPage) -> FrameRef {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = FrameEntry {
            base,
            seq,
            owner: None,
        };
        let id = if let Some(id) = self.free_ids.pop() {
            self.slots[id.0] = Some(entry);
            id
        } else {
            self.slots.push(Some(entry));
            FrameId(self.slots.len() - 1)
        };
        FrameRef { id, base, seq }
    }

    fn entry_mut(&mut self, frame: FrameRef) -> Option<&mut FrameEntry> {
        self.slots
            .get_mut(frame.id.0)
            .and_then(Option::as_mut)
            .filter(|entry| entry.seq == frame.seq)
    }

    fn select_victim(&mut self) -> Option<FrameId> {
        let Self {
            slots, ring, policy, ..
        } = self;
        policy.select(ring, &mut |id| {
            slots
                .get(id.0)
                .and_then(Option::as_ref)
                .and_then(|entry| entry.owner.as_ref())
                .is_some_and(|owner| {
                    let accessed = owner.mmu.is_accessed(owner.va);
                    if accessed {
                        owner.mmu.set_accessed(owner.va, false);
                    }
                    accessed
                })
        })
    }

    fn evict(&mut self, mapper: &dyn PhysMapper, swap: &SwapArea) -> Result<FrameRef, VmError> {
        // Every bound frame gets two chances to be unlocked.
        let attempts = self.ring.len() * 2;
        let mut exhausted = None;
        for _ in 0..attempts {
            let Some(id) = self.select_victim() else {
                break;
            };
            match self.try_evict(id, mapper, swap) {
                Ok(Attempt::Evicted(frame)) => {
                    self.evictions += 1;
                    return Ok(frame);
                }
                Ok(Attempt::Skip) => self.ring.push_back(id),
                Ok(Attempt::Gone) => {}
                Err(e) => {
                    // Out of swap; a clean file page may still be evictable.
                    self.ring.push_back(id);
                    exhausted = Some(e);
                }
            }
        }
        let err = exhausted.unwrap_or(VmError::OutOfMemory);
        error!(
            "frame table: no evictable frame among {} bound frames: {err}",
            self.ring.len()
        );
        Err(err)
    }

    fn try_evict(
        &mut self,
        id: FrameId,
        mapper: &dyn PhysMapper,
        swap: &SwapArea,
    ) -> Result<Attempt, VmError> {
        let Some(entry) = self.slots.get_mut(id.0).and_then(Option::as_mut) else {
            return Ok(Attempt::Gone);
        };
        let frame = FrameRef {
            id,
            base: entry.base,
            seq: entry.seq,
        };
        let Some(owner) = entry.owner.take() else {
            return Ok(Attempt::Evicted(frame));
        };

        let Some(page) = owner.page.upgrade() else {
            // The page is gone but its frame was never released.
            warn!("frame table: reclaiming orphaned frame {} of {}", frame.base, owner.va);
            owner.mmu.unmap(owner.va);
            return Ok(Attempt::Evicted(frame));
        };
        let Some(mut guard) = page.try_lock() else {
            entry.owner = Some(owner);
            return Ok(Attempt::Skip);
        };

        let io = Backend {
            mapper,
            swap,
            mmu: &*owner.mmu,
        };
        match guard.swap_out(&io) {
            Ok(_) => {
                owner.mmu.unmap(owner.va);
                trace!("frame table: evicted {} from {}", owner.va, frame.base);
                Ok(Attempt::Evicted(frame))
            }
            Err(e) if e.is_kernel_fatal() => {
                entry.owner = Some(owner);
                Err(e)
            }
            Err(e) => {
                warn!("frame table: cannot evict {}: {e}", owner.va);
                entry.owner = Some(owner);
                Ok(Attempt::Skip)
            }
        }
    }
}

/// Hands out frames for user pages, evicting when the pool runs dry.
pub struct FrameAllocator {
    table: Mutex<FrameTable>,
}

impl FrameAllocator {
    #[must_use]
    pub fn new(pool: Box<dyn FramePool>, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            table: Mutex::new(FrameTable {
                slots: Vec::new(),
                free_ids: Vec::new(),
                ring: VecDeque::new(),
                pool,
                policy,
                next_seq: 0,
                evictions: 0,
            }),
        }
    }

    /// Obtain an unbound frame, evicting a resident page if necessary.
    ///
    /// The returned frame is not visible to eviction until it is bound.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if the pool is empty and no victim can be evicted.
    /// - [`VmError::SwapExhausted`] if the chosen victim cannot be swapped out.
    pub fn get_frame(&self, mapper: &dyn PhysMapper, swap: &SwapArea) -> Result<FrameRef, VmError> {
        let mut table = self.table.lock();
        if let Some(base) = table.pool.alloc_page(false) {
            let frame = table.insert(base);
            trace!("frame table: allocated {base}");
            return Ok(frame);
        }
        table.evict(mapper, swap)
    }

    /// Attach `frame` to a page, making it an eviction candidate.
    pub(crate) fn bind(&self, frame: FrameRef, owner: FrameOwner) {
        let mut table = self.table.lock();
        let Some(entry) = table.entry_mut(frame) else {
            warn!("frame table: bind of stale frame {}", frame.base);
            return;
        };
        debug_assert!(entry.owner.is_none(), "frame {} bound twice", frame.base);
        entry.owner = Some(owner);
        table.ring.push_back(frame.id);
    }

    /// Return `frame` to the physical pool. Stale handles are ignored.
    pub fn release_frame(&self, frame: FrameRef) {
        let mut table = self.table.lock();
        if table.entry_mut(frame).is_none() {
            warn!("frame table: release of stale frame {}", frame.base);
            return;
        }
        table.slots[frame.id.0] = None;
        table.free_ids.push(frame.id);
        table.ring.retain(|&id| id != frame.id);
        table.pool.free_page(frame.base);
        trace!("frame table: released {}", frame.base);
    }

    /// Number of frames currently held, bound or not.
    #[must_use]
    pub fn allocated(&self) -> usize {
        let table = self.table.lock();
        table.slots.len() - table.free_ids.len()
    }

    /// Number of frames bound to a page.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.table.lock().ring.len()
    }

    /// Number of evictions performed so far.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.table.lock().evictions
    }

    /// The page `frame` is bound to, if any.
    #[must_use]
    pub fn owner_of(&self, frame: FrameRef) -> Option<VirtualPage> {
        self.table
            .lock()
            .entry_mut(frame)
            .and_then(|entry| entry.owner.as_ref().map(|owner| owner.va))
    }

    /// Check the binding invariants of every bound frame.
    ///
    /// A bound frame must point at a live page that points back at the same
    /// frame, and the owning address space must map the page to it. No two
    /// entries may share a physical frame. Pages that are locked right now are
    /// skipped.
    ///
    /// # Errors
    /// The first frame that violates an invariant.
    pub fn audit(&self) -> Result<(), FrameId> {
        let table = self.table.lock();
        let mut seen = Vec::new();
        for (index, entry) in table.slots.iter().enumerate() {
            let id = FrameId(index);
            let Some(entry) = entry else { continue };
            if seen.contains(&entry.base) {
                return Err(id);
            }
            seen.push(entry.base);

            let Some(owner) = &entry.owner else { continue };
            let page = owner.page.upgrade().ok_or(id)?;
            if let Some(page) = page.try_lock() {
                let points_back = page
                    .frame()
                    .is_some_and(|f| f.id == id && f.seq == entry.seq);
                if !points_back || page.va() != owner.va {
                    return Err(id);
                }
            }
            if owner.mmu.query(owner.va) != Some(entry.base) {
                return Err(id);
            }
        }
        Ok(())
    }
}
