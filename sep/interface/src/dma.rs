// Copyright (C) Microsoft Corporation. All rights reserved.

//! DMA address space shared by the host and the SeP.
//!
//! Host memory is modelled as [`HostBuffer`]s. Mapping a range of a buffer
//! assigns it a device address; the device can only touch memory through
//! mapped addresses and only in the mapped direction.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Granule of device address assignment and of buffer pinning.
pub const DMA_PAGE_SIZE: usize = 4096;

const DMA_BASE: u64 = 0x1_0000_0000;

/// Device-visible address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DmaAddr(pub u64);

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Direction of device access to a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads
    ToDevice,

    /// Device writes
    FromDevice,

    /// Device reads and writes
    Bidirectional,
}

impl DmaDirection {
    /// Returns true when the device may read the mapping.
    pub fn device_reads(self) -> bool {
        matches!(self, DmaDirection::ToDevice | DmaDirection::Bidirectional)
    }

    /// Returns true when the device may write the mapping.
    pub fn device_writes(self) -> bool {
        matches!(self, DmaDirection::FromDevice | DmaDirection::Bidirectional)
    }
}

/// Failure of a device access or of a mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaFault {
    /// Address range is not mapped
    Unmapped(DmaAddr),

    /// Mapping does not allow the access direction
    Direction(DmaAddr),

    /// Host range is empty or outside the buffer
    BadRange,
}

/// Host memory that may be mapped for device access.
///
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct HostBuffer(Arc<RwLock<Vec<u8>>>);

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

impl HostBuffer {
    /// Allocates a zero-filled buffer.
    pub fn new(len: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0; len])))
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self(Arc::new(RwLock::new(data.to_vec())))
    }

    /// Returns the buffer size.
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Returns true for a zero-sized buffer.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out the whole buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.read().clone()
    }

    /// Copies out `len` bytes at `offset`.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let data = self.0.read();
        data.get(offset..offset.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// Copies `src` into the buffer at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> bool {
        let mut data = self.0.write();
        let Some(end) = offset.checked_add(src.len()) else {
            return false;
        };
        match data.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Runs `f` with exclusive access to the contents.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.0.write())
    }

    /// Returns a value that is equal for handles sharing storage.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Returns true when both handles share storage.
    pub fn ptr_eq(a: &HostBuffer, b: &HostBuffer) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

#[derive(Debug)]
struct Mapping {
    buf: HostBuffer,
    offset: usize,
    len: usize,
    dir: DmaDirection,
}

#[derive(Debug, Default)]
struct DmaSpaceInner {
    next: u64,
    maps: BTreeMap<u64, Mapping>,
}

impl DmaSpaceInner {
    fn lookup(&self, addr: DmaAddr, len: usize) -> Result<(&Mapping, usize), DmaFault> {
        let (start, mapping) = self
            .maps
            .range(..=addr.0)
            .next_back()
            .ok_or(DmaFault::Unmapped(addr))?;

        let offset = (addr.0 - start) as usize;
        match offset.checked_add(len) {
            Some(end) if end <= mapping.len => Ok((mapping, offset)),
            _ => Err(DmaFault::Unmapped(addr)),
        }
    }
}

/// IOMMU model: the set of host ranges currently visible to the device.
#[derive(Debug)]
pub struct DmaSpace {
    inner: RwLock<DmaSpaceInner>,
}

impl Default for DmaSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaSpace {
    /// Creates an empty address space.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DmaSpaceInner {
                next: DMA_BASE,
                maps: BTreeMap::new(),
            }),
        }
    }

    /// Maps `len` bytes of `buf` at `offset`.
    ///
    /// Each mapping starts on a fresh page and is followed by an unmapped
    /// guard page, so an overrun faults instead of reaching a neighbour.
    ///
    /// # Error
    /// * `DmaFault::BadRange` - The range is empty or outside the buffer
    pub fn map(
        &self,
        buf: &HostBuffer,
        offset: usize,
        len: usize,
        dir: DmaDirection,
    ) -> Result<DmaAddr, DmaFault> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= buf.len());
        if len == 0 || !in_bounds {
            Err(DmaFault::BadRange)?
        }

        let mut inner = self.inner.write();
        let addr = inner.next;
        let pages = len.div_ceil(DMA_PAGE_SIZE) + 1;
        inner.next += (pages * DMA_PAGE_SIZE) as u64;
        inner.maps.insert(
            addr,
            Mapping {
                buf: buf.clone(),
                offset,
                len,
                dir,
            },
        );

        tracing::trace!(addr = %DmaAddr(addr), len, ?dir, "DMA map");
        Ok(DmaAddr(addr))
    }

    /// Removes a mapping created by [`DmaSpace::map`].
    ///
    /// # Error
    /// * `DmaFault::Unmapped` - No mapping starts at `addr`
    pub fn unmap(&self, addr: DmaAddr) -> Result<(), DmaFault> {
        match self.inner.write().maps.remove(&addr.0) {
            Some(_) => {
                tracing::trace!(addr = %addr, "DMA unmap");
                Ok(())
            }
            None => Err(DmaFault::Unmapped(addr)),
        }
    }

    /// Device read of `len` bytes at `addr`.
    pub fn read(&self, addr: DmaAddr, len: usize) -> Result<Vec<u8>, DmaFault> {
        let inner = self.inner.read();
        let (mapping, offset) = inner.lookup(addr, len)?;
        if !mapping.dir.device_reads() {
            Err(DmaFault::Direction(addr))?
        }

        mapping
            .buf
            .read_at(mapping.offset + offset, len)
            .ok_or(DmaFault::Unmapped(addr))
    }

    /// Device write of `data` at `addr`.
    pub fn write(&self, addr: DmaAddr, data: &[u8]) -> Result<(), DmaFault> {
        let inner = self.inner.read();
        let (mapping, offset) = inner.lookup(addr, data.len())?;
        if !mapping.dir.device_writes() {
            Err(DmaFault::Direction(addr))?
        }

        if mapping.buf.write_at(mapping.offset + offset, data) {
            Ok(())
        } else {
            Err(DmaFault::Unmapped(addr))
        }
    }

    /// Resolves a device range to the host memory behind it.
    ///
    /// # Returns
    /// An identity of the backing buffer and the host offset of `addr`.
    pub fn host_location(&self, addr: DmaAddr, len: usize) -> Result<(usize, usize), DmaFault> {
        let inner = self.inner.read();
        let (mapping, offset) = inner.lookup(addr, len)?;
        Ok((mapping.buf.identity(), mapping.offset + offset))
    }

    /// Returns the number of live mappings.
    pub fn mapping_count(&self) -> usize {
        self.inner.read().maps.len()
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    #[test]
    fn test_map_read_write() {
        let space = DmaSpace::new();
        let buf = HostBuffer::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let addr = space.map(&buf, 2, 4, DmaDirection::Bidirectional).unwrap();
        assert_eq!(space.read(addr, 4).unwrap(), vec![3, 4, 5, 6]);
        assert_eq!(space.read(DmaAddr(addr.0 + 1), 2).unwrap(), vec![4, 5]);
        assert_eq!(
            space.host_location(DmaAddr(addr.0 + 1), 2).unwrap(),
            (buf.identity(), 3)
        );

        space.write(DmaAddr(addr.0 + 3), &[0xff]).unwrap();
        assert_eq!(buf.to_vec(), vec![1, 2, 3, 4, 5, 0xff, 7, 8]);
    }

    #[test]
    fn test_access_beyond_mapping_faults() {
        let space = DmaSpace::new();
        let buf = HostBuffer::new(DMA_PAGE_SIZE * 2);

        let addr = space.map(&buf, 0, 10, DmaDirection::ToDevice).unwrap();
        assert_eq!(space.read(addr, 11), Err(DmaFault::Unmapped(addr)));

        let other = space.map(&buf, 0, 10, DmaDirection::ToDevice).unwrap();
        assert!(other.0 >= addr.0 + 2 * DMA_PAGE_SIZE as u64);
    }

    #[test]
    fn test_direction_is_enforced() {
        let space = DmaSpace::new();
        let buf = HostBuffer::new(16);

        let din = space.map(&buf, 0, 16, DmaDirection::ToDevice).unwrap();
        let dout = space.map(&buf, 0, 16, DmaDirection::FromDevice).unwrap();

        assert_eq!(space.write(din, &[0; 4]), Err(DmaFault::Direction(din)));
        assert_eq!(space.read(dout, 4), Err(DmaFault::Direction(dout)));
    }

    #[test]
    fn test_unmap() {
        let space = DmaSpace::new();
        let buf = HostBuffer::new(16);

        let addr = space.map(&buf, 0, 16, DmaDirection::ToDevice).unwrap();
        assert_eq!(space.mapping_count(), 1);
        space.unmap(addr).unwrap();
        assert_eq!(space.mapping_count(), 0);
        assert_eq!(space.unmap(addr), Err(DmaFault::Unmapped(addr)));
        assert!(space.read(addr, 1).is_err());
    }

    #[test]
    fn test_empty_range_is_rejected() {
        let space = DmaSpace::new();
        let buf = HostBuffer::new(16);
        assert_eq!(
            space.map(&buf, 0, 0, DmaDirection::ToDevice),
            Err(DmaFault::BadRange)
        );
        assert_eq!(
            space.map(&buf, 8, 9, DmaDirection::ToDevice),
            Err(DmaFault::BadRange)
        );
    }
}
