// Copyright (C) Microsoft Corporation. All rights reserved.

//! Host view of the SeP context cache.
//!
//! The table mirrors which context UID each device slot holds. Allocation and
//! the submission of the descriptor that uses the slot must happen under the
//! same lock, see [`crate::op::SubmitTxn`].

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use sep_interface::ContextUid;
use sep_interface::HostError;

/// Slots to clear in [`CacheTable::invalidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Invalidate {
    /// Exactly this context
    Uid(ContextUid),

    /// Every context owned by a client
    Owner(u32),
}

impl Invalidate {
    fn matches(&self, uid: &ContextUid) -> bool {
        match self {
            Invalidate::Uid(target) => target == uid,
            Invalidate::Owner(owner) => uid.owner == *owner,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotEntry {
    uid: Option<ContextUid>,
    valid: bool,
    stamp: u64,
}

/// Slot table. Access goes through [`ContextCache::lock`].
#[derive(Debug)]
pub(crate) struct CacheTable {
    slots: Vec<SlotEntry>,
    clock: u64,
}

impl CacheTable {
    fn new(slots: usize) -> Self {
        Self {
            slots: vec![SlotEntry::default(); slots],
            clock: 0,
        }
    }

    /// Returns the slot for `uid`.
    ///
    /// # Arguments
    /// * `uid` - Context to place
    /// * `pinned` - Slots that must not be chosen as victims
    ///
    /// # Returns
    /// The slot index and whether the device must load the context first.
    ///
    /// # Error
    /// * `HostError::NoResource` - Every slot is pinned
    pub(crate) fn allocate(&mut self, uid: ContextUid, pinned: &[u16]) -> Result<(u16, bool), HostError> {
        if let Some(index) = self
            .slots
            .iter()
            .position(|s| s.valid && s.uid == Some(uid))
        {
            tracing::trace!(%uid, slot = index, "Cache hit");
            return Ok((index as u16, false));
        }

        let candidates = self
            .slots
            .iter()
            .enumerate()
            .filter(|(index, _)| !pinned.contains(&(*index as u16)));

        // Free slots first, then the oldest allocation. `min_by_key` keeps the
        // first of equal keys, which breaks ties by slot index.
        let victim = candidates
            .min_by_key(|(_, s)| (s.valid, s.stamp))
            .map(|(index, _)| index);

        let Some(index) = victim else {
            tracing::error!(%uid, "Every cache slot is pinned");
            return Err(HostError::NoResource);
        };

        self.clock += 1;
        let slot = &mut self.slots[index];
        if let (true, Some(old)) = (slot.valid, slot.uid) {
            tracing::trace!(slot = index, evicted = %old, %uid, "Cache eviction");
        }
        *slot = SlotEntry {
            uid: Some(uid),
            valid: true,
            stamp: self.clock,
        };

        Ok((index as u16, true))
    }

    /// Marks every slot matching `which` invalid. Returns the number cleared.
    pub(crate) fn invalidate(&mut self, which: Invalidate) -> usize {
        let mut cleared = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let (true, Some(uid)) = (slot.valid, slot.uid) {
                if which.matches(&uid) {
                    tracing::trace!(slot = index, %uid, "Cache slot invalidated");
                    slot.valid = false;
                    cleared += 1;
                }
            }
        }
        cleared
    }

    /// Returns the valid resident UIDs by slot.
    pub(crate) fn residents(&self) -> Vec<(u16, ContextUid)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid)
            .filter_map(|(index, s)| s.uid.map(|uid| (index as u16, uid)))
            .collect()
    }

    /// Returns the number of slots.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Context cache shared by every client of a device.
#[derive(Debug)]
pub(crate) struct ContextCache {
    table: Mutex<CacheTable>,
}

impl ContextCache {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            table: Mutex::new(CacheTable::new(slots)),
        }
    }

    /// Takes the cache lock. The lock is held across slot allocation and descriptor enqueue.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheTable> {
        self.table.lock()
    }

    pub(crate) fn invalidate(&self, which: Invalidate) -> usize {
        self.table.lock().invalidate(which)
    }

    pub(crate) fn residents(&self) -> Vec<(u16, ContextUid)> {
        self.table.lock().residents()
    }
}
