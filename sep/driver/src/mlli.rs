// Copyright (C) Microsoft Corporation. All rights reserved.

//! MLLI (scatter/gather table) builder.

use std::sync::Arc;

use parking_lot::Mutex;
use sep_interface::DataRef;
use sep_interface::DmaAddr;
use sep_interface::DmaDirection;
use sep_interface::DmaSpace;
use sep_interface::HostBuffer;
use sep_interface::HostError;
use sep_interface::MlliEntry;
use zerocopy::IntoBytes;

use crate::dma_registry::DmaObject;

/// A range of a mapped object to include in a table.
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    /// Mapped object
    pub object: &'a DmaObject,

    /// Start within the object
    pub offset: usize,

    /// Length
    pub len: usize,
}

impl<'a> Source<'a> {
    /// The whole object.
    pub fn whole(object: &'a DmaObject) -> Self {
        Self {
            object,
            offset: 0,
            len: object.len(),
        }
    }
}

/// Block granularity for algorithms that only process whole blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSplit {
    /// Processing block size
    pub block_size: usize,

    /// Keep the last block back even when the data is block aligned
    pub hold_last: bool,
}

/// Result of [`MlliBuilder::create`].
#[derive(Debug)]
pub enum MlliOutcome {
    /// A table covering the consumed bytes
    Table(Arc<MlliTable>),

    /// There was no data at all
    Empty,

    /// Less than one block of data; buffer it and retry with more
    NotEnoughData,
}

#[derive(Debug)]
struct Mapped {
    data_ref: DataRef,
    host_bufs: Vec<(HostBuffer, DmaAddr)>,
}

/// A device-consumable description of one data stream.
///
/// Owned by the operation that built it. [`MlliTable::destroy`] may be called
/// any number of times; it also runs on drop.
#[derive(Debug)]
pub struct MlliTable {
    space: Arc<DmaSpace>,
    consumed: usize,
    mapped: Mutex<Option<Mapped>>,
}

impl MlliTable {
    /// Returns how the device finds the stream; [`DataRef::Null`] once destroyed.
    pub fn data_ref(&self) -> DataRef {
        self.mapped
            .lock()
            .as_ref()
            .map(|m| m.data_ref)
            .unwrap_or_default()
    }

    /// Returns the number of source bytes described, excluding any prefix.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Releases the table and prefix storage.
    pub fn destroy(&self) {
        let Some(mapped) = self.mapped.lock().take() else {
            return;
        };
        for (_, addr) in mapped.host_bufs {
            if let Err(err) = self.space.unmap(addr) {
                tracing::error!(?err, %addr, "MLLI unmap failed");
            }
        }
    }
}

impl Drop for MlliTable {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Input and output tables of one operation.
///
/// When input and output are the same memory both fields hold the same table.
#[derive(Debug)]
pub struct IoTables {
    /// Input stream
    pub input: Arc<MlliTable>,

    /// Output stream
    pub output: Arc<MlliTable>,
}

/// Builds [`MlliTable`]s in one DMA address space.
#[derive(Debug)]
pub struct MlliBuilder {
    space: Arc<DmaSpace>,
}

impl MlliBuilder {
    /// Creates a builder.
    pub fn new(space: Arc<DmaSpace>) -> Self {
        Self { space }
    }

    fn map_host(&self, bytes: &[u8], bufs: &mut Vec<(HostBuffer, DmaAddr)>) -> Result<DmaAddr, HostError> {
        let buf = HostBuffer::from_slice(bytes);
        let addr = self
            .space
            .map(&buf, 0, bytes.len(), DmaDirection::ToDevice)
            .map_err(|err| {
                tracing::error!(?err, "Failed to map MLLI storage");
                HostError::NoResource
            })?;
        bufs.push((buf, addr));
        Ok(addr)
    }

    fn release(&self, bufs: Vec<(HostBuffer, DmaAddr)>) {
        for (_, addr) in bufs {
            if let Err(err) = self.space.unmap(addr) {
                tracing::error!(?err, %addr, "MLLI unmap failed");
            }
        }
    }

    fn build(&self, segments: Vec<(DmaAddr, usize)>, mut bufs: Vec<(HostBuffer, DmaAddr)>) -> Result<Mapped, HostError> {
        let data_ref = match segments.as_slice() {
            [] => DataRef::Null,
            [(addr, len)] => DataRef::Dlli {
                addr: *addr,
                len: *len as u32,
            },
            _ => {
                let entries: Vec<MlliEntry> = segments
                    .iter()
                    .map(|(addr, len)| MlliEntry {
                        addr: addr.0,
                        len: *len as u32,
                        rsvd: 0,
                    })
                    .collect();
                let result = self.map_host(entries.as_bytes(), &mut bufs);
                match result {
                    Ok(table) => DataRef::Mlli {
                        table,
                        entries: entries.len() as u32,
                    },
                    Err(err) => {
                        self.release(bufs);
                        return Err(err);
                    }
                }
            }
        };

        Ok(Mapped {
            data_ref,
            host_bufs: bufs,
        })
    }

    /// Builds a table over `prefix` followed by `sources`.
    ///
    /// # Arguments
    /// * `prefix` - Host composed bytes placed before the data as their own segment
    /// * `sources` - Mapped ranges, in stream order
    /// * `split` - Limit the table to whole blocks of the combined stream
    ///
    /// # Returns
    /// * `MlliOutcome::Empty` - No bytes at all
    /// * `MlliOutcome::NotEnoughData` - With `split`, less than one block is available
    /// * `MlliOutcome::Table` - The table; with `split` it covers the leading whole blocks
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - A source range is outside its object
    /// * `HostError::NoResource` - Table storage could not be mapped
    pub fn create(
        &self,
        prefix: &[u8],
        sources: &[Source<'_>],
        split: Option<BlockSplit>,
    ) -> Result<MlliOutcome, HostError> {
        let data_len: usize = sources.iter().map(|s| s.len).sum();
        let total = prefix.len() + data_len;
        if total == 0 {
            return Ok(MlliOutcome::Empty);
        }

        let usable = match split {
            None => total,
            Some(split) => {
                let mut usable = total / split.block_size * split.block_size;
                if split.hold_last && usable == total {
                    usable = usable.saturating_sub(split.block_size);
                }
                if usable == 0 {
                    return Ok(MlliOutcome::NotEnoughData);
                }
                usable
            }
        };
        if usable < prefix.len() {
            tracing::error!(usable, prefix = prefix.len(), "Prefix longer than the usable stream");
            Err(HostError::InvalidArgument)?
        }
        let consumed = usable - prefix.len();

        let mut segments = Vec::new();
        let mut bufs = Vec::new();
        if !prefix.is_empty() {
            segments.push((self.map_host(prefix, &mut bufs)?, prefix.len()));
        }

        let mut remaining = consumed;
        for source in sources {
            if remaining == 0 {
                break;
            }
            let take = source.len.min(remaining);
            let Some(segs) = source.object.segments_in(source.offset, take) else {
                self.release(bufs);
                tracing::error!(offset = source.offset, len = take, "Source range outside its object");
                return Err(HostError::InvalidArgument);
            };
            segments.extend(segs);
            remaining -= take;
        }

        let mapped = self.build(segments, bufs)?;
        tracing::trace!(data_ref = ?mapped.data_ref, consumed, "MLLI table built");

        Ok(MlliOutcome::Table(Arc::new(MlliTable {
            space: self.space.clone(),
            consumed,
            mapped: Mutex::new(Some(mapped)),
        })))
    }

    /// Builds a table over one source without a prefix or block split.
    ///
    /// An empty source yields a table describing [`DataRef::Null`].
    pub fn create_simple(&self, source: Source<'_>) -> Result<Arc<MlliTable>, HostError> {
        match self.create(&[], &[source], None)? {
            MlliOutcome::Table(table) => Ok(table),
            _ => Ok(Arc::new(MlliTable {
                space: self.space.clone(),
                consumed: 0,
                mapped: Mutex::new(None),
            })),
        }
    }

    /// Builds the input and output tables of an operation.
    ///
    /// If `output` describes exactly the same memory as `input`, the input
    /// table is shared instead of building a second one.
    pub fn create_io(&self, input: Source<'_>, output: Source<'_>) -> Result<IoTables, HostError> {
        let same = HostBuffer::ptr_eq(input.object.buffer(), output.object.buffer())
            && input.object.offset() + input.offset == output.object.offset() + output.offset
            && input.len == output.len;

        let input_table = self.create_simple(input)?;
        let output_table = if same {
            input_table.clone()
        } else {
            self.create_simple(output)?
        };

        Ok(IoTables {
            input: input_table,
            output: output_table,
        })
    }
}
