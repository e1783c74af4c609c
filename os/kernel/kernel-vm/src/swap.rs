//! # Swap Area
//!
//! Anonymous pages that get evicted are written to a page-sized slot of a
//! [`SwapDevice`]. Slot ownership is tracked in a bitmap guarded by its own
//! lock; the bitmap lock is always taken *after* the frame-table lock.
//!
//! A [`SwapSlot`] is a move-only token: the page that holds it is the only
//! party able to read it back or release it, so a slot cannot be freed twice.

use crate::addresses::VirtualPage;
use crate::error::VmError;
use crate::platform::{FrameBuffer, SwapDevice};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, trace};
use spin::Mutex;

/// Index of an occupied swap slot.
#[derive(Debug, Eq, PartialEq)]
pub struct SwapSlot(usize);

impl SwapSlot {
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0
    }
}

/// Fixed-size occupancy bitmap.
struct SlotBitmap {
    words: Vec<u64>,
    len: usize,
    used: usize,
}

impl SlotBitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            used: 0,
        }
    }

    /// Claim the lowest free slot.
    fn claim(&mut self) -> Option<usize> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let idx = w * 64 + bit;
            if idx >= self.len {
                return None;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Some(idx);
        }
        None
    }

    fn release(&mut self, idx: usize) {
        let (w, bit) = (idx / 64, idx % 64);
        debug_assert!(self.words[w] & (1 << bit) != 0, "slot {idx} not in use");
        self.words[w] &= !(1 << bit);
        self.used -= 1;
    }
}

pub struct SwapArea {
    device: Arc<dyn SwapDevice>,
    slots: Mutex<SlotBitmap>,
}

impl SwapArea {
    #[must_use]
    pub fn new(device: Arc<dyn SwapDevice>) -> Self {
        let slots = SlotBitmap::new(device.slot_count());
        Self {
            device,
            slots: Mutex::new(slots),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.lock().len
    }

    #[must_use]
    pub fn used_slots(&self) -> usize {
        self.slots.lock().used
    }

    /// Persist `buf` (the content of `page`) into a fresh slot.
    ///
    /// # Errors
    /// - [`VmError::SwapExhausted`] if no slot is free.
    /// - [`VmError::BackingIo`] if the device write fails; the slot is released again.
    pub fn store(&self, page: VirtualPage, buf: &FrameBuffer) -> Result<SwapSlot, VmError> {
        let Some(idx) = self.slots.lock().claim() else {
            debug!("swap: no free slot for {page}");
            return Err(VmError::SwapExhausted);
        };
        if !self.device.write_slot(idx, buf) {
            self.slots.lock().release(idx);
            return Err(VmError::BackingIo { page });
        }
        trace!("swap: stored {page} in slot {idx}");
        Ok(SwapSlot(idx))
    }

    /// Copy the slot content into `buf` without releasing the slot.
    ///
    /// # Errors
    /// [`VmError::BackingIo`] if the device read fails.
    pub fn peek(
        &self,
        page: VirtualPage,
        slot: &SwapSlot,
        buf: &mut FrameBuffer,
    ) -> Result<(), VmError> {
        if self.device.read_slot(slot.0, buf) {
            Ok(())
        } else {
            Err(VmError::BackingIo { page })
        }
    }

    /// Read the slot back into `buf` and release it.
    ///
    /// On error the slot stays owned by the caller so the content is not lost.
    ///
    /// # Errors
    /// [`VmError::BackingIo`] if the device read fails.
    pub fn load(
        &self,
        page: VirtualPage,
        slot: SwapSlot,
        buf: &mut FrameBuffer,
    ) -> Result<(), (SwapSlot, VmError)> {
        if let Err(e) = self.peek(page, &slot, buf) {
            return Err((slot, e));
        }
        trace!("swap: loaded {page} from slot {}", slot.0);
        self.release(slot);
        Ok(())
    }

    /// Give a slot back without reading it.
    pub fn release(&self, slot: SwapSlot) {
        self.slots.lock().release(slot.0);
    }
}
