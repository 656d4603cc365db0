// Copyright (C) Microsoft Corporation. All rights reserved.

//! Data stream access for the simulated SeP.
//!
//! Every access goes through the DMA address space, so a stream the host did
//! not map (or mapped in the wrong direction) faults here.

use std::ops::Range;

use sep_interface::DataRef;
use sep_interface::DeviceStatus;
use sep_interface::DmaAddr;
use sep_interface::DmaSpace;
use sep_interface::MlliEntry;
use sep_interface::MLLI_ENTRY_SIZE;
use zerocopy::FromBytes;

fn segments(
    dma: &DmaSpace,
    data: &DataRef,
    fault: DeviceStatus,
) -> Result<Vec<(DmaAddr, usize)>, DeviceStatus> {
    match *data {
        DataRef::Null => Ok(Vec::new()),
        DataRef::Dlli { addr, len } => Ok(vec![(addr, len as usize)]),
        DataRef::Mlli { table, entries } => {
            let raw = dma
                .read(table, entries as usize * MLLI_ENTRY_SIZE)
                .map_err(|err| {
                    tracing::warn!(?err, %table, entries, "MLLI table read fault");
                    fault
                })?;

            raw.chunks_exact(MLLI_ENTRY_SIZE)
                .map(|chunk| {
                    let entry = MlliEntry::read_from_bytes(chunk).map_err(|_| fault)?;
                    Ok((DmaAddr(entry.addr), entry.len as usize))
                })
                .collect()
        }
    }
}

/// Reads an input stream.
///
/// # Error
/// * `DeviceStatus::InvalDinPtr` - A segment or the table is not readable
pub fn gather(dma: &DmaSpace, din: &DataRef) -> Result<Vec<u8>, DeviceStatus> {
    let mut out = Vec::new();
    for (addr, len) in segments(dma, din, DeviceStatus::InvalDinPtr)? {
        let bytes = dma.read(addr, len).map_err(|err| {
            tracing::warn!(?err, %addr, len, "Input DMA fault");
            DeviceStatus::InvalDinPtr
        })?;
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

/// Returns the total size of an output stream.
pub fn capacity(dma: &DmaSpace, dout: &DataRef) -> Result<usize, DeviceStatus> {
    Ok(segments(dma, dout, DeviceStatus::InvalDoutPtr)?
        .iter()
        .map(|(_, len)| len)
        .sum())
}

/// Writes `bytes` to the start of an output stream.
///
/// # Error
/// * `DeviceStatus::InvalDataSize` - The stream is shorter than `bytes`
/// * `DeviceStatus::InvalDoutPtr` - A segment or the table is not writable
pub fn scatter(dma: &DmaSpace, dout: &DataRef, bytes: &[u8]) -> Result<(), DeviceStatus> {
    let segs = segments(dma, dout, DeviceStatus::InvalDoutPtr)?;
    if segs.iter().map(|(_, len)| len).sum::<usize>() < bytes.len() {
        tracing::warn!(need = bytes.len(), "Output stream too short");
        Err(DeviceStatus::InvalDataSize)?
    }

    let mut rest = bytes;
    for (addr, len) in segs {
        if rest.is_empty() {
            break;
        }
        let (now, later) = rest.split_at(len.min(rest.len()));
        dma.write(addr, now).map_err(|err| {
            tracing::warn!(?err, %addr, len, "Output DMA fault");
            DeviceStatus::InvalDoutPtr
        })?;
        rest = later;
    }
    Ok(())
}

fn host_ranges(
    dma: &DmaSpace,
    data: &DataRef,
    fault: DeviceStatus,
) -> Result<Vec<(usize, Range<usize>)>, DeviceStatus> {
    segments(dma, data, fault)?
        .into_iter()
        .map(|(addr, len)| {
            let (buf, offset) = dma.host_location(addr, len).map_err(|_| fault)?;
            Ok((buf, offset..offset + len))
        })
        .collect()
}

/// Rejects input and output streams that share memory without being identical.
///
/// # Error
/// * `DeviceStatus::DinDoutOverlap` - The streams partially overlap
pub fn check_overlap(dma: &DmaSpace, din: &DataRef, dout: &DataRef) -> Result<(), DeviceStatus> {
    if din.is_null() || dout.is_null() {
        return Ok(());
    }

    let input = host_ranges(dma, din, DeviceStatus::InvalDinPtr)?;
    let output = host_ranges(dma, dout, DeviceStatus::InvalDoutPtr)?;
    if input == output {
        return Ok(());
    }

    for (ibuf, irange) in &input {
        for (obuf, orange) in &output {
            if ibuf == obuf && irange.start < orange.end && orange.start < irange.end {
                tracing::warn!(?irange, ?orange, "Input and output overlap");
                Err(DeviceStatus::DinDoutOverlap)?
            }
        }
    }
    Ok(())
}
