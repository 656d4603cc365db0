// Copyright (C) Microsoft Corporation. All rights reserved.

//! Hash verbs.

use sep_interface::*;
use tracing::instrument;
use zerocopy::FromZeros;

use super::*;
use crate::client::Callback;
use crate::client::Client;
use crate::op::Plan;

fn digest_of(mode: HashMode, buf: HostBuffer) -> impl FnOnce(&ClientInner, &mut OpResources) -> SepResult<Vec<u8>> {
    move |client, res| {
        retire_all(client, res);
        read_result(&buf, mode.digest_size())
    }
}

impl Client {
    /// Initializes a hash context.
    #[instrument(skip_all, fields(client = self.inner.id, ?mode))]
    pub fn hash_init(&self, ctx: &CryptoContext, mode: HashMode) -> SepResult<()> {
        let res = self.inner.begin_ctx(
            ctx,
            CtxKind::Hash(mode),
            mode as u32,
            &HashCtx::new_zeroed(),
            CtxState::Uninitialized,
        )?;
        let plan = Plan::Crypto {
            op: CryptoOp::Init,
            din: DataRef::Null,
            dout: DataRef::Null,
        };
        self.inner.execute(res, plan, |_, res| {
            set_state(res, CtxState::Initialized);
            Ok(())
        })
    }

    /// Hashes data of any length.
    ///
    /// Whole blocks go to the device; a shorter tail is kept on the host and
    /// prepended to the next call.
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn hash_process(&self, ctx: &CryptoContext, din: BufRange<'_>) -> SepResult<()> {
        match self.inner.digest_pass(ctx, &din, AlgClass::Hash)? {
            Pass::Submit(res, plan, tail) => self.inner.execute(res, plan, keep_tail(tail)),
            Pass::Buffered => Ok(()),
        }
    }

    /// Asynchronous [`Client::hash_process`].
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn hash_process_async(
        &self,
        ctx: &CryptoContext,
        din: BufRange<'_>,
        may_backlog: bool,
        callback: impl FnOnce(SepResult<()>) + Send + 'static,
    ) -> SepResult<()> {
        let callback: Callback<()> = Box::new(callback);
        match self.inner.digest_pass(ctx, &din, AlgClass::Hash)? {
            Pass::Submit(res, plan, tail) => {
                self.inner
                    .execute_async(res, plan, may_backlog, keep_tail(tail), callback)
            }
            Pass::Buffered => {
                self.inner.complete_now(callback, Ok(()));
                Ok(())
            }
        }
    }

    /// Hashes the last data and returns the digest.
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn hash_finalize(&self, ctx: &CryptoContext, din: BufRange<'_>) -> SepResult<Vec<u8>> {
        let inner = &self.inner;
        let mut res = inner.begin_op()?;
        inner.map_ctx(&mut res, ctx)?;
        let CtxKind::Hash(mode) = ctx_kind(&res, AlgClass::Hash, &[CtxState::Initialized])? else {
            return Err(SepError::Device(DeviceStatus::BadCtx));
        };

        let data = inner.final_input(&mut res, ctx, &din)?;
        let (buf, dout) = inner.map_result(&mut res, mode.digest_size())?;
        let plan = Plan::Crypto {
            op: CryptoOp::Finalize,
            din: data,
            dout,
        };
        inner.execute(res, plan, digest_of(mode, buf))
    }

    /// Hashes `din` in one pass and returns the digest.
    #[instrument(skip_all, fields(client = self.inner.id, ?mode, len = din.len))]
    pub fn hash_integrated(&self, ctx: &CryptoContext, mode: HashMode, din: BufRange<'_>) -> SepResult<Vec<u8>> {
        let inner = &self.inner;
        let mut res = inner.begin_ctx(
            ctx,
            CtxKind::Hash(mode),
            mode as u32,
            &HashCtx::new_zeroed(),
            CtxState::Uninitialized,
        )?;
        let data = inner.map_simple(&mut res, &din, DmaDirection::ToDevice)?;
        let (buf, dout) = inner.map_result(&mut res, mode.digest_size())?;
        let plan = Plan::Crypto {
            op: CryptoOp::Integrated,
            din: data,
            dout,
        };
        inner.execute(res, plan, digest_of(mode, buf))
    }
}
