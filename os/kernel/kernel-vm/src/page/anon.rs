use super::Backend;
use crate::addresses::VirtualPage;
use crate::error::VmError;
use crate::platform::FrameBuffer;
use crate::swap::SwapSlot;

/// A page with no file behind it. Evicted content lives in a swap slot.
#[derive(Debug, Default)]
pub struct AnonPage {
    slot: Option<SwapSlot>,
}

impl AnonPage {
    #[must_use]
    pub const fn new() -> Self {
        Self { slot: None }
    }

    /// The swap slot currently holding this page, if it is swapped out.
    #[must_use]
    pub fn swap_slot(&self) -> Option<usize> {
        self.slot.as_ref().map(SwapSlot::index)
    }

    pub(super) fn swap_in(
        &mut self,
        page: VirtualPage,
        io: &Backend<'_>,
        buf: &mut FrameBuffer,
    ) -> Result<(), VmError> {
        let slot = self.slot.take().ok_or(VmError::NotResident(page))?;
        io.swap.load(page, slot, buf).map_err(|(slot, e)| {
            self.slot = Some(slot);
            e
        })
    }

    pub(super) fn swap_out(
        &mut self,
        page: VirtualPage,
        io: &Backend<'_>,
        buf: &FrameBuffer,
    ) -> Result<(), VmError> {
        debug_assert!(self.slot.is_none(), "resident page {page} still owns a swap slot");
        self.slot = Some(io.swap.store(page, buf)?);
        Ok(())
    }

    pub(super) fn peek(
        &self,
        page: VirtualPage,
        io: &Backend<'_>,
        buf: &mut FrameBuffer,
    ) -> Result<(), VmError> {
        let slot = self.slot.as_ref().ok_or(VmError::NotResident(page))?;
        io.swap.peek(page, slot, buf)
    }

    pub(super) fn destroy(&mut self, io: &Backend<'_>) {
        if let Some(slot) = self.slot.take() {
            io.swap.release(slot);
        }
    }
}
