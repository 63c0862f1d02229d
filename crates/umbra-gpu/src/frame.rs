//! Frame slots.
//!
//! Every mutable per-frame resource exists once per present slot and is
//! indexed by the [`FrameIndex`] that acquisition returned. Slots are not
//! visited round-robin; code must never derive a slot from its own counter.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Present slot returned by `Renderer::acquire_next_frame`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIndex(u32);

impl FrameIndex {
    /// Wrap a raw slot index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Slot index as usize.
    pub const fn get(self) -> usize {
        self.0 as usize
    }

    /// Slot index as reported by the swapchain.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// One `T` per frame slot.
#[derive(Clone, Debug)]
pub struct PerFrame<T> {
    slots: Vec<T>,
}

impl<T> PerFrame<T> {
    /// Build `count` slots with `f`, stopping at the first error.
    pub fn try_new<E>(count: usize, mut f: impl FnMut(FrameIndex) -> Result<T, E>) -> Result<Self, E> {
        assert!(count > 0, "PerFrame needs at least one slot");
        let slots = (0..count)
            .map(|i| f(FrameIndex::new(i as u32)))
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Self { slots })
    }

    /// Build `count` slots with `f`.
    pub fn new(count: usize, mut f: impl FnMut(FrameIndex) -> T) -> Self {
        Self::try_new(count, |i| Ok::<_, std::convert::Infallible>(f(i)))
            .unwrap_or_else(|never| match never {})
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a `PerFrame` has at least one slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over slots with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (FrameIndex, &T)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (FrameIndex::new(i as u32), slot))
    }

    /// Iterate mutably over slots.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }

    /// Consume into slot values, in index order.
    pub fn into_inner(self) -> Vec<T> {
        self.slots
    }
}

impl<T> Index<FrameIndex> for PerFrame<T> {
    type Output = T;

    #[track_caller]
    fn index(&self, frame: FrameIndex) -> &T {
        &self.slots[frame.get()]
    }
}

impl<T> IndexMut<FrameIndex> for PerFrame<T> {
    #[track_caller]
    fn index_mut(&mut self, frame: FrameIndex) -> &mut T {
        &mut self.slots[frame.get()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_by_frame() {
        let mut slots = PerFrame::new(3, |i| i.get() * 10);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[FrameIndex::new(2)], 20);
        slots[FrameIndex::new(1)] = 7;
        assert_eq!(slots.into_inner(), [0, 7, 20]);
    }

    #[test]
    fn try_new_stops_at_error() {
        let mut built = 0;
        let result = PerFrame::try_new(3, |i| {
            if i.get() == 1 {
                Err("boom")
            } else {
                built += 1;
                Ok(())
            }
        });
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(built, 1);
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn foreign_slot_panics() {
        let slots = PerFrame::new(2, |_| ());
        let _ = slots[FrameIndex::new(2)];
    }
}
