use std::fmt::{Display, Formatter};

use bit_set::BitSet;
use tracing::{debug, error, trace};

use crate::error::EngineError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SlotIndex(u32);

impl Display for SlotIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SlotIndex {
    pub fn from_raw(value: u32) -> SlotIndex {
        SlotIndex(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    fn as_usize(&self) -> usize {
        self.0.safe_cast()
    }
}

/// A fixed-capacity arena of reusable slots with a stack of free indexes. The backing store is
///  allocated once, so acquiring and releasing a slot never allocates.
///
/// Every index is either on the free stack or in use, never both. Occupancy is tracked
///  separately so that releasing a slot twice (or releasing a slot that was never handed out)
///  is detected rather than corrupting the free stack.
pub struct SlotPool<T> {
    slots: Vec<T>,
    free_stack: Vec<SlotIndex>,
    in_use: BitSet,
}

impl<T: Default> SlotPool<T> {
    pub fn new(capacity: usize) -> SlotPool<T> {
        let capacity_u32: u32 = capacity.prechecked_cast();

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);

        SlotPool {
            slots,
            // lowest indexes on top of the stack
            free_stack: (0..capacity_u32).rev().map(SlotIndex).collect(),
            in_use: BitSet::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_in_use(&self) -> usize {
        self.slots.len() - self.free_stack.len()
    }

    pub fn is_in_use(&self, index: SlotIndex) -> bool {
        self.in_use.contains(index.as_usize())
    }

    /// Returns `None` if all slots are in use - this is a 'try again later' rather than an error
    pub fn acquire(&mut self) -> Option<SlotIndex> {
        match self.free_stack.pop() {
            Some(index) => {
                trace!("acquired slot {}", index);
                let is_new = self.in_use.insert(index.as_usize());
                debug_assert!(is_new, "slot {} was on the free stack while in use", index);
                Some(index)
            }
            None => {
                debug!("slot pool exhausted: all {} slots in use", self.slots.len());
                None
            }
        }
    }

    /// Puts the slot back on the free stack, resetting its content
    pub fn release(&mut self, index: SlotIndex) -> Result<(), EngineError> {
        if !self.in_use.remove(index.as_usize()) {
            error!("attempt to release slot {} which is not in use", index);
            return Err(EngineError::double_release(index));
        }

        self.slots[index.as_usize()] = T::default();
        self.free_stack.push(index);
        trace!("released slot {}", index);
        Ok(())
    }

    pub fn get(&self, index: SlotIndex) -> Option<&T> {
        if self.is_in_use(index) {
            self.slots.get(index.as_usize())
        }
        else {
            None
        }
    }

    pub fn get_mut(&mut self, index: SlotIndex) -> Option<&mut T> {
        if self.is_in_use(index) {
            self.slots.get_mut(index.as_usize())
        }
        else {
            None
        }
    }

    /// iterates over all slots that are currently in use
    pub fn iter_in_use(&self) -> impl Iterator<Item = (SlotIndex, &T)> + '_ {
        self.in_use.iter()
            .map(|i| (SlotIndex(i.prechecked_cast()), &self.slots[i]))
    }
}
