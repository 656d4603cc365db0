// Copyright (C) Microsoft Corporation. All rights reserved.

//! MAC verbs.

use sep_interface::*;
use tracing::instrument;
use zerocopy::FromZeros;

use super::*;
use crate::client::Callback;
use crate::client::Client;

fn mac_body(props: &MacProps) -> MacCtx {
    let mut body = MacCtx::new_zeroed();
    body.key[..props.key.len()].copy_from_slice(&props.key);
    body.key_len = props.key.len() as u32;
    body
}

fn mac_of(mode: MacMode, buf: HostBuffer) -> impl FnOnce(&ClientInner, &mut OpResources) -> SepResult<Vec<u8>> {
    move |client, res| {
        retire_all(client, res);
        read_result(&buf, mode.mac_size())
    }
}

impl ClientInner {
    fn mac_begin(&self, ctx: &CryptoContext, props: &MacProps) -> SepResult<OpResources> {
        AlgProps::Mac(props.clone()).validate()?;
        self.begin_ctx(
            ctx,
            CtxKind::Mac(props.mode),
            props.mode.to_raw(),
            &mac_body(props),
            CtxState::Uninitialized,
        )
    }
}

impl Client {
    /// Initializes a MAC context.
    ///
    /// # Arguments
    /// * `ctx` - Context of class [`AlgClass::Mac`]
    /// * `props` - HMAC hash or CMAC, and the key
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - Empty or oversized HMAC key, or a
    ///   CMAC key that is not an AES key
    #[instrument(skip_all, fields(client = self.inner.id, mode = ?props.mode))]
    pub fn mac_init(&self, ctx: &CryptoContext, props: &MacProps) -> SepResult<()> {
        let res = self.inner.mac_begin(ctx, props)?;
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

    /// Authenticates data of any length.
    ///
    /// Partial blocks are held on the host until the next call. A CMAC context
    /// always keeps its last whole block back for finalize.
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn mac_process(&self, ctx: &CryptoContext, din: BufRange<'_>) -> SepResult<()> {
        match self.inner.digest_pass(ctx, &din, AlgClass::Mac)? {
            Pass::Submit(res, plan, tail) => self.inner.execute(res, plan, keep_tail(tail)),
            Pass::Buffered => Ok(()),
        }
    }

    /// Asynchronous [`Client::mac_process`].
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn mac_process_async(
        &self,
        ctx: &CryptoContext,
        din: BufRange<'_>,
        may_backlog: bool,
        callback: impl FnOnce(SepResult<()>) + Send + 'static,
    ) -> SepResult<()> {
        let callback: Callback<()> = Box::new(callback);
        match self.inner.digest_pass(ctx, &din, AlgClass::Mac)? {
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

    /// Authenticates the last data and returns the MAC.
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn mac_finalize(&self, ctx: &CryptoContext, din: BufRange<'_>) -> SepResult<Vec<u8>> {
        let inner = &self.inner;
        let mut res = inner.begin_op()?;
        inner.map_ctx(&mut res, ctx)?;
        let CtxKind::Mac(mode) = ctx_kind(&res, AlgClass::Mac, &[CtxState::Initialized])? else {
            return Err(SepError::Device(DeviceStatus::BadCtx));
        };

        let data = inner.final_input(&mut res, ctx, &din)?;
        let (buf, dout) = inner.map_result(&mut res, mode.mac_size())?;
        let plan = Plan::Crypto {
            op: CryptoOp::Finalize,
            din: data,
            dout,
        };
        inner.execute(res, plan, mac_of(mode, buf))
    }

    /// Computes the MAC of `din` in one pass.
    #[instrument(skip_all, fields(client = self.inner.id, mode = ?props.mode, len = din.len))]
    pub fn mac_integrated(&self, ctx: &CryptoContext, props: &MacProps, din: BufRange<'_>) -> SepResult<Vec<u8>> {
        let inner = &self.inner;
        let mut res = inner.mac_begin(ctx, props)?;
        let data = inner.map_simple(&mut res, &din, DmaDirection::ToDevice)?;
        let (buf, dout) = inner.map_result(&mut res, props.mode.mac_size())?;
        let plan = Plan::Crypto {
            op: CryptoOp::Integrated,
            din: data,
            dout,
        };
        inner.execute(res, plan, mac_of(props.mode, buf))
    }
}
