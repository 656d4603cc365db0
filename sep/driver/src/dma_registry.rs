// Copyright (C) Microsoft Corporation. All rights reserved.

//! DMA memory reference registry.
//!
//! A fixed table of mapped buffers. Each entry is guarded by its own lock and
//! addressed by a [`MemRefId`] carrying a generation, so a handle that
//! outlived its entry is rejected instead of reaching a new occupant.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use sep_interface::DmaAddr;
use sep_interface::DmaDirection;
use sep_interface::DmaSpace;
use sep_interface::HostBuffer;
use sep_interface::HostError;
use sep_interface::DMA_PAGE_SIZE;
use tracing::instrument;

/// Handle to a registered memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRefId {
    index: u32,
    generation: u32,
}

impl fmt::Display for MemRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// A host buffer range mapped for device access.
///
/// The range is mapped one host page at a time, so a range crossing page
/// boundaries yields several device segments. Dropping the object unmaps it.
#[derive(Debug)]
pub struct DmaObject {
    space: Arc<DmaSpace>,
    buf: HostBuffer,
    offset: usize,
    len: usize,
    dir: DmaDirection,
    segments: Vec<(DmaAddr, usize)>,
}

impl DmaObject {
    /// Maps `len` bytes of `buf` starting at `offset`.
    ///
    /// # Error
    /// * `HostError::BadPointer` - The range lies outside the buffer
    pub fn map(
        space: &Arc<DmaSpace>,
        buf: &HostBuffer,
        offset: usize,
        len: usize,
        dir: DmaDirection,
    ) -> Result<Self, HostError> {
        let mut obj = Self {
            space: space.clone(),
            buf: buf.clone(),
            offset,
            len,
            dir,
            segments: Vec::new(),
        };

        let end = offset.checked_add(len).ok_or(HostError::BadPointer)?;
        if end > buf.len() {
            tracing::error!(offset, len, buf_len = buf.len(), "Buffer range out of bounds");
            Err(HostError::BadPointer)?
        }

        let mut pos = offset;
        while pos < end {
            let chunk = (DMA_PAGE_SIZE - pos % DMA_PAGE_SIZE).min(end - pos);
            // Segments mapped so far are released by Drop on failure.
            let addr = space.map(buf, pos, chunk, dir).map_err(|err| {
                tracing::error!(?err, pos, chunk, "DMA map failed");
                HostError::BadPointer
            })?;
            obj.segments.push((addr, chunk));
            pos += chunk;
        }

        Ok(obj)
    }

    /// Returns the device segments.
    #[cfg(test)]
    pub fn segments(&self) -> &[(DmaAddr, usize)] {
        &self.segments
    }

    /// Returns the device segments covering `len` bytes at `offset` within the object.
    pub fn segments_in(&self, offset: usize, len: usize) -> Option<Vec<(DmaAddr, usize)>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }

        let mut out = Vec::new();
        let mut seg_start = 0;
        for &(addr, seg_len) in &self.segments {
            let seg_end = seg_start + seg_len;
            let from = offset.max(seg_start);
            let to = end.min(seg_end);
            if from < to {
                out.push((DmaAddr(addr.0 + (from - seg_start) as u64), to - from));
            }
            seg_start = seg_end;
        }
        Some(out)
    }

    /// Returns the mapped length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the access direction.
    pub fn dir(&self) -> DmaDirection {
        self.dir
    }

    /// Returns the host buffer behind the object.
    pub fn buffer(&self) -> &HostBuffer {
        &self.buf
    }

    /// Returns the offset of the range within the host buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Drop for DmaObject {
    fn drop(&mut self) {
        for (addr, _) in self.segments.drain(..) {
            if let Err(err) = self.space.unmap(addr) {
                tracing::error!(?err, %addr, "DMA unmap failed");
            }
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    generation: u32,
    object: Option<Arc<DmaObject>>,
    refcount: usize,
}

/// Per-client table of memory references.
#[derive(Debug)]
pub struct DmaRegistry {
    space: Arc<DmaSpace>,
    slots: Vec<Mutex<Entry>>,
}

impl DmaRegistry {
    /// Creates a registry with `size` entries.
    pub fn new(space: Arc<DmaSpace>, size: usize) -> Self {
        Self {
            space,
            slots: (0..size).map(|_| Mutex::new(Entry::default())).collect(),
        }
    }

    fn entry(&self, id: MemRefId) -> Result<&Mutex<Entry>, HostError> {
        self.slots.get(id.index as usize).ok_or(HostError::BadPointer)
    }

    /// Maps a buffer range and stores it in a free entry with reference count 1.
    ///
    /// # Arguments
    /// * `dir` - Device access direction
    /// * `buf` - Host buffer
    /// * `offset` - Start of the range
    /// * `len` - Length of the range
    ///
    /// # Returns
    /// * `MemRefId` - Handle of the new entry
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - Empty range
    /// * `HostError::BadPointer` - Range outside the buffer
    /// * `HostError::NoResource` - The table is full
    #[instrument(skip(self, buf))]
    pub fn register(
        &self,
        dir: DmaDirection,
        buf: &HostBuffer,
        offset: usize,
        len: usize,
    ) -> Result<MemRefId, HostError> {
        if len == 0 {
            Err(HostError::InvalidArgument)?
        }

        let object = Arc::new(DmaObject::map(&self.space, buf, offset, len, dir)?);

        for (index, slot) in self.slots.iter().enumerate() {
            let mut entry = slot.lock();
            if entry.object.is_some() {
                continue;
            }

            entry.generation = entry.generation.wrapping_add(1);
            entry.object = Some(object);
            entry.refcount = 1;
            let id = MemRefId {
                index: index as u32,
                generation: entry.generation,
            };
            tracing::debug!(memref = %id, "Memory reference registered");
            return Ok(id);
        }

        tracing::error!(slots = self.slots.len(), "Memory reference table full");
        Err(HostError::NoResource)
    }

    /// Takes an additional reference.
    ///
    /// # Error
    /// * `HostError::BadPointer` - The handle is stale or unknown
    pub fn acquire(&self, id: MemRefId) -> Result<Arc<DmaObject>, HostError> {
        let mut entry = self.entry(id)?.lock();
        let object = match entry.object.clone() {
            Some(object) if entry.generation == id.generation => object,
            _ => {
                tracing::error!(memref = %id, "Acquire of stale memory reference");
                Err(HostError::BadPointer)?
            }
        };

        entry.refcount += 1;
        Ok(object)
    }

    /// Drops a reference taken by [`DmaRegistry::acquire`]. Never frees.
    pub fn release(&self, id: MemRefId) {
        let Ok(slot) = self.entry(id) else {
            return;
        };
        let mut entry = slot.lock();
        if entry.object.is_none() || entry.generation != id.generation {
            tracing::warn!(memref = %id, "Release of stale memory reference");
        } else if entry.refcount > 1 {
            entry.refcount -= 1;
        } else {
            tracing::error!(memref = %id, "Unbalanced memory reference release");
        }
    }

    /// Unmaps the buffer and clears the entry.
    ///
    /// # Error
    /// * `HostError::BadPointer` - The handle is stale or unknown
    /// * `HostError::Busy` - References taken by `acquire` are outstanding
    #[instrument(skip(self))]
    pub fn free(&self, id: MemRefId) -> Result<(), HostError> {
        let mut entry = self.entry(id)?.lock();
        if entry.object.is_none() || entry.generation != id.generation {
            tracing::error!(memref = %id, "Free of stale memory reference");
            Err(HostError::BadPointer)?
        }
        if entry.refcount > 1 {
            tracing::debug!(memref = %id, refcount = entry.refcount, "Memory reference busy");
            Err(HostError::Busy)?
        }

        entry.object = None;
        entry.refcount = 0;
        Ok(())
    }

    /// Clears every entry regardless of reference count.
    ///
    /// Callers must have drained all operations using the entries.
    pub fn free_all(&self) -> usize {
        let mut freed = 0;
        for slot in &self.slots {
            let mut entry = slot.lock();
            if entry.object.take().is_some() {
                entry.refcount = 0;
                freed += 1;
            }
        }
        freed
    }

    /// Returns the number of entries in use.
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().object.is_some())
            .count()
    }
}

/// An acquired memory reference, released on drop.
#[derive(Debug)]
pub(crate) struct MemRefHold {
    registry: Arc<DmaRegistry>,
    id: MemRefId,
    object: Arc<DmaObject>,
}

impl MemRefHold {
    pub(crate) fn acquire(registry: &Arc<DmaRegistry>, id: MemRefId) -> Result<Self, HostError> {
        let object = registry.acquire(id)?;
        Ok(Self {
            registry: registry.clone(),
            id,
            object,
        })
    }

    pub(crate) fn object(&self) -> &DmaObject {
        &self.object
    }
}

impl Drop for MemRefHold {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}
