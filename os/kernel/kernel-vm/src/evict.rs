//! # Victim Selection
//!
//! The frame table keeps every *bound* frame in a ring ordered by the time it
//! was bound (oldest at the front). An [`EvictionPolicy`] takes one candidate
//! out of that ring. If the candidate cannot be evicted right now (its page
//! is locked by a concurrent fault), the frame table pushes it to the back and
//! asks again, so selection is deterministic for a given ring and bit state.

use crate::frame::FrameId;
use alloc::collections::VecDeque;

/// Chooses which bound frame to evict next.
pub trait EvictionPolicy: Send {
    /// Remove and return the next victim from `ring`.
    ///
    /// `referenced` reports whether a frame was accessed since it was last
    /// inspected, clearing the hardware accessed bit as a side effect.
    fn select(
        &mut self,
        ring: &mut VecDeque<FrameId>,
        referenced: &mut dyn FnMut(FrameId) -> bool,
    ) -> Option<FrameId>;
}

/// Oldest-bound-first. Ignores accessed bits entirely.
#[derive(Debug, Default, Copy, Clone)]
pub struct Fifo;

impl EvictionPolicy for Fifo {
    fn select(
        &mut self,
        ring: &mut VecDeque<FrameId>,
        _referenced: &mut dyn FnMut(FrameId) -> bool,
    ) -> Option<FrameId> {
        ring.pop_front()
    }
}

/// Second-chance clock over the ring.
///
/// A frame whose accessed bit is set gets the bit cleared and is moved to the
/// back. After at most one full sweep every bit is clear, so the second sweep
/// always yields a victim.
#[derive(Debug, Default, Copy, Clone)]
pub struct Clock;

impl EvictionPolicy for Clock {
    fn select(
        &mut self,
        ring: &mut VecDeque<FrameId>,
        referenced: &mut dyn FnMut(FrameId) -> bool,
    ) -> Option<FrameId> {
        for _ in 0..ring.len() {
            let id = ring.pop_front()?;
            if !referenced(id) {
                return Some(id);
            }
            ring.push_back(id);
        }
        ring.pop_front()
    }
}
