//! Table of in-flight operations.
//!
//! [`Slots`] owns every [`Operation`] between submission and completion. The
//! slot index doubles as the tag handed to the kernel (`aio_data`, `user_data`)
//! or to a worker thread. A completion carries the index back, and
//! [`Slots::take`] moves the operation out exactly once. A tag never
//! has to be cast back into a pointer.
//!
//! The number of slots is the domain's queue depth. When all of them are in
//! use, [`Slots::try_insert`] hands the operation back.
//!
//! Callers wrap [`Slots`] in a mutex. Never invoke a callback while holding it.

use tracing::trace;

use crate::{ops::Operation, LaunchError};

pub(crate) struct Slots {
    /// Id of the owning domain.
    id: usize,
    storage: Vec<Option<Box<Operation>>>,
    unused_indices: Vec<usize>,
}

impl Slots {
    pub(crate) fn new(id: usize, capacity: usize) -> Result<Slots, LaunchError> {
        if capacity == 0 {
            return Err(LaunchError::ZeroQueueDepth);
        }
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| LaunchError::OutOfMemory)?;
        storage.resize_with(capacity, || None);
        let mut unused_indices = Vec::new();
        unused_indices
            .try_reserve_exact(capacity)
            .map_err(|_| LaunchError::OutOfMemory)?;
        // pop() hands out low indices first
        unused_indices.extend((0..capacity).rev());
        Ok(Slots {
            id,
            storage,
            unused_indices,
        })
    }

    /// Store `op` and return its index, or give it back if every slot is taken.
    pub(crate) fn try_insert(&mut self, op: Box<Operation>) -> Result<usize, Box<Operation>> {
        let Some(idx) = self.unused_indices.pop() else {
            trace!(domain_id = self.id, "no free slot");
            return Err(op);
        };
        let slot = &mut self.storage[idx];
        assert!(
            slot.is_none(),
            "implementation error: unused index {idx} refers to an occupied slot"
        );
        *slot = Some(op);
        Ok(idx)
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> Option<&mut Operation> {
        self.storage.get_mut(idx).and_then(|slot| slot.as_deref_mut())
    }

    /// Remove the operation in slot `idx` and free the slot.
    ///
    /// Panics if the slot is empty: a tag came back twice, or one we never issued.
    pub(crate) fn take(&mut self, idx: usize) -> Box<Operation> {
        let Some(op) = self.storage.get_mut(idx).and_then(Option::take) else {
            panic!(
                "implementation error: no operation in slot {idx} of domain {}",
                self.id
            );
        };
        self.unused_indices.push(idx);
        op
    }

    /// Remove every remaining operation, for shutdown paths that can no longer
    /// wait for their completions.
    pub(crate) fn drain_all(&mut self) -> Vec<Box<Operation>> {
        let mut ops = Vec::new();
        for (idx, slot) in self.storage.iter_mut().enumerate() {
            if let Some(op) = slot.take() {
                self.unused_indices.push(idx);
                ops.push(op);
            }
        }
        ops
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.storage.len() - self.unused_indices.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.storage.len()
    }
}
