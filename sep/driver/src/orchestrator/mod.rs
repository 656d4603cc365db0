// Copyright (C) Microsoft Corporation. All rights reserved.

//! Operation orchestrator.
//!
//! Every verb follows the same shape: map the contexts, build the tables,
//! bind and submit under the cache lock, wait (or return pending), then clean
//! up. Cleanup is carried by [`OpResources`] and runs whatever the outcome.

mod auth_enc;
mod combined;
mod hash;
mod mac;
mod rpc;
mod sym_cipher;

pub use combined::CombinedContext;
use sep_interface::*;

use crate::client::BufRange;
use crate::client::ClientInner;
use crate::client::PostFn;
use crate::context::CryptoContext;
use crate::context::CtxKind;
use crate::context::CtxState;
use crate::dma_registry::DmaObject;
use crate::mlli::BlockSplit;
use crate::mlli::MlliOutcome;
use crate::mlli::Source;
use crate::op::OpResources;
use crate::op::Plan;

/// Input stream prepared by [`ClientInner::map_input`].
pub(crate) enum Input {
    /// Stream to submit and the number of caller bytes it covers
    Table { data: DataRef, consumed: usize },

    /// Nothing to process
    Empty,

    /// Less than one block available
    NotEnoughData,
}

/// A prepared hash or MAC process pass.
pub(crate) enum Pass {
    /// Submit, then keep the given tail as the new remainder
    Submit(OpResources, Plan, Vec<u8>),

    /// Everything fit in the host remainder
    Buffered,
}

/// Post-processing that stores the unprocessed tail in the context.
pub(crate) fn keep_tail(tail: Vec<u8>) -> PostFn<()> {
    Box::new(move |_: &ClientInner, res: &mut OpResources| -> SepResult<()> {
        if let Some(ctx) = res.ctxs.first() {
            ctx.lock().remainder = tail;
        }
        Ok(())
    })
}

/// Fails with `HostError::InvalidArgument` when `range` cannot take `needed` bytes.
pub(crate) fn check_output(range: &BufRange<'_>, needed: usize) -> SepResult<()> {
    if range.len < needed {
        tracing::error!(len = range.len, needed, "Output buffer too small");
        Err(HostError::InvalidArgument)?
    }
    Ok(())
}

/// Returns the parameters of the single context in `res`.
///
/// # Error
/// * `DeviceStatus::BadCtx` - Wrong class or a state outside `allowed`
pub(crate) fn ctx_kind(res: &OpResources, class: AlgClass, allowed: &[CtxState]) -> SepResult<CtxKind> {
    let ctx = res.ctxs.first().ok_or(HostError::InvalidArgument)?;
    let inner = ctx.lock();
    if inner.class() != class {
        tracing::error!(ctx_class = ?inner.class(), ?class, "Context used with the wrong algorithm class");
        Err(SepError::Device(DeviceStatus::BadCtx))?
    }
    inner.expect(allowed)
}

/// Marks every context of a successful operation with `state`.
pub(crate) fn set_state(res: &OpResources, state: CtxState) {
    for ctx in &res.ctxs {
        ctx.lock().set_state(state);
    }
}

/// Ends the lifetime of every context of an operation.
pub(crate) fn retire_all(client: &ClientInner, res: &OpResources) {
    for ctx in &res.ctxs {
        client.retire(ctx);
    }
}

impl ClientInner {
    /// Maps `ctx` and starts a new lifetime with `body`.
    pub(crate) fn begin_ctx<T: CtxBody>(
        &self,
        ctx: &CryptoContext,
        kind: CtxKind,
        mode: u32,
        body: &T,
        state: CtxState,
    ) -> SepResult<OpResources> {
        let mut res = self.begin_op()?;
        self.map_ctx(&mut res, ctx)?;

        let uid = self.device.next_uid(self.id);
        let previous = match res.ctxs.first() {
            Some(mapped) => mapped.lock().begin(uid, kind, mode, body, state)?,
            None => Err(HostError::InvalidArgument)?,
        };
        self.invalidate_uid(previous);
        tracing::debug!(%uid, ?kind, "Context initialized on the host");
        Ok(res)
    }

    /// Prepares a block-granular hash or MAC pass.
    ///
    /// The held-back remainder is sent ahead of `din` as the table prefix. A
    /// CMAC context also holds back a final whole block so finalize always has
    /// one.
    pub(crate) fn digest_pass(&self, ctx: &CryptoContext, din: &BufRange<'_>, class: AlgClass) -> SepResult<Pass> {
        let mut res = self.begin_op()?;
        self.map_ctx(&mut res, ctx)?;
        let split = match ctx_kind(&res, class, &[CtxState::Initialized])? {
            CtxKind::Hash(mode) => BlockSplit {
                block_size: mode.block_size(),
                hold_last: false,
            },
            CtxKind::Mac(mode) => BlockSplit {
                block_size: mode.block_size(),
                hold_last: mode == MacMode::AesCmac,
            },
            _ => return Err(SepError::Device(DeviceStatus::BadCtx)),
        };

        let remainder = ctx.lock().remainder.clone();
        match self.map_input(&mut res, &remainder, std::slice::from_ref(din), Some(split))? {
            Input::Table { data, consumed } => {
                let tail = tail_of(din, consumed)?;
                let plan = Plan::Crypto {
                    op: CryptoOp::Process,
                    din: data,
                    dout: DataRef::Null,
                };
                Ok(Pass::Submit(res, plan, tail))
            }
            Input::NotEnoughData => {
                let bytes = din.read()?;
                ctx.lock().remainder.extend_from_slice(&bytes);
                tracing::trace!(buffered = bytes.len(), "Input shorter than a block, buffered");
                Ok(Pass::Buffered)
            }
            Input::Empty => Ok(Pass::Buffered),
        }
    }

    /// Maps the held-back remainder followed by `din` as the final input.
    pub(crate) fn final_input(&self, res: &mut OpResources, ctx: &CryptoContext, din: &BufRange<'_>) -> SepResult<DataRef> {
        let remainder = ctx.lock().remainder.clone();
        match self.map_input(res, &remainder, std::slice::from_ref(din), None)? {
            Input::Table { data, .. } => Ok(data),
            _ => Ok(DataRef::Null),
        }
    }

    /// Maps a caller range. An empty range maps nothing.
    fn map_range(&self, range: &BufRange<'_>, dir: DmaDirection) -> SepResult<Option<DmaObject>> {
        if range.len == 0 {
            return Ok(None);
        }
        let object = DmaObject::map(&self.device.space, range.buf, range.offset, range.len, dir)?;
        Ok(Some(object))
    }

    /// Maps an input and an output range.
    ///
    /// Identical ranges are mapped once for both directions and share one table.
    pub(crate) fn map_io(
        &self,
        res: &mut OpResources,
        din: &BufRange<'_>,
        dout: &BufRange<'_>,
    ) -> SepResult<(DataRef, DataRef)> {
        if din.len > 0 && din.same_as(dout) {
            let Some(object) = self.map_range(din, DmaDirection::Bidirectional)? else {
                return Ok((DataRef::Null, DataRef::Null));
            };
            let io = self
                .device
                .mlli
                .create_io(Source::whole(&object), Source::whole(&object))?;
            res.objects.push(object);
            let din_ref = res.hold_table(io.input);
            let dout_ref = res.hold_table(io.output);
            return Ok((din_ref, dout_ref));
        }

        let din_ref = self.map_simple(res, din, DmaDirection::ToDevice)?;
        let dout_ref = self.map_simple(res, dout, DmaDirection::FromDevice)?;
        Ok((din_ref, dout_ref))
    }

    /// Maps one range with a plain table.
    pub(crate) fn map_simple(
        &self,
        res: &mut OpResources,
        range: &BufRange<'_>,
        dir: DmaDirection,
    ) -> SepResult<DataRef> {
        let Some(object) = self.map_range(range, dir)? else {
            return Ok(DataRef::Null);
        };
        let table = self.device.mlli.create_simple(Source::whole(&object))?;
        res.objects.push(object);
        Ok(res.hold_table(table))
    }

    /// Maps `prefix` followed by `inputs` as one input stream.
    ///
    /// With `split` the stream covers whole blocks only; the caller keeps the
    /// uncovered tail of the last input.
    pub(crate) fn map_input(
        &self,
        res: &mut OpResources,
        prefix: &[u8],
        inputs: &[BufRange<'_>],
        split: Option<BlockSplit>,
    ) -> SepResult<Input> {
        let objects = inputs
            .iter()
            .map(|range| self.map_range(range, DmaDirection::ToDevice))
            .collect::<SepResult<Vec<_>>>()?;
        let objects: Vec<DmaObject> = objects.into_iter().flatten().collect();
        let sources: Vec<Source<'_>> = objects.iter().map(Source::whole).collect();

        let outcome = self.device.mlli.create(prefix, &sources, split)?;
        drop(sources);

        match outcome {
            MlliOutcome::Table(table) => {
                let consumed = table.consumed();
                res.objects.extend(objects);
                let data = res.hold_table(table);
                Ok(Input::Table { data, consumed })
            }
            MlliOutcome::Empty => Ok(Input::Empty),
            MlliOutcome::NotEnoughData => Ok(Input::NotEnoughData),
        }
    }

    /// Allocates and maps a driver-owned output buffer of `len` bytes.
    pub(crate) fn map_result(&self, res: &mut OpResources, len: usize) -> SepResult<(HostBuffer, DataRef)> {
        let buf = HostBuffer::new(len);
        let data = self.map_simple(res, &BufRange::from(&buf), DmaDirection::FromDevice)?;
        Ok((buf, data))
    }
}

/// Reads the caller bytes of `range` from `consumed` on.
pub(crate) fn tail_of(range: &BufRange<'_>, consumed: usize) -> SepResult<Vec<u8>> {
    let tail = BufRange {
        buf: range.buf,
        offset: range.offset + consumed.min(range.len),
        len: range.len.saturating_sub(consumed),
    };
    Ok(tail.read()?)
}

/// Reads a result buffer filled by the device.
pub(crate) fn read_result(buf: &HostBuffer, len: usize) -> SepResult<Vec<u8>> {
    buf.read_at(0, len).ok_or_else(|| SepError::Host(HostError::Io))
}
