// Copyright (C) Microsoft Corporation. All rights reserved.

//! Symmetric cipher verbs.

use sep_interface::*;
use tracing::instrument;
use zerocopy::FromZeros;

use super::*;
use crate::client::Callback;
use crate::client::no_result;
use crate::client::Client;
use crate::op::Plan;

fn cipher_body(props: &SymCipherProps) -> CipherCtx {
    let mut body = CipherCtx::new_zeroed();
    body.key[..props.key.len()].copy_from_slice(&props.key);
    body.iv = props.iv;
    body.key_len = props.key.len() as u32;
    body.direction = props.direction as u32;
    body
}

impl ClientInner {
    fn sym_cipher_begin(&self, ctx: &CryptoContext, props: &SymCipherProps) -> SepResult<OpResources> {
        AlgProps::SymCipher(props.clone()).validate()?;
        self.begin_ctx(
            ctx,
            CtxKind::SymCipher { mode: props.mode },
            props.mode as u32,
            &cipher_body(props),
            CtxState::Uninitialized,
        )
    }

    /// Prepares a process or finalize pass. `None` when there is nothing to process.
    fn sym_cipher_data(
        &self,
        ctx: &CryptoContext,
        op: CryptoOp,
        din: &BufRange<'_>,
        dout: &BufRange<'_>,
    ) -> SepResult<Option<(OpResources, Plan)>> {
        check_output(dout, din.len)?;
        let mut res = self.begin_op()?;
        self.map_ctx(&mut res, ctx)?;
        ctx_kind(&res, AlgClass::SymCipher, &[CtxState::Initialized])?;

        if din.len == 0 && op == CryptoOp::Process {
            return Ok(None);
        }

        let (din, dout) = self.map_io(&mut res, din, dout)?;
        Ok(Some((res, Plan::Crypto { op, din, dout })))
    }
}

impl Client {
    /// Initializes a symmetric cipher context.
    ///
    /// # Arguments
    /// * `ctx` - Context of class [`AlgClass::SymCipher`]
    /// * `props` - Mode, direction, key and IV
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - Invalid key size
    /// * `DeviceStatus::BadCtx` - The context is of another class
    #[instrument(skip_all, fields(client = self.inner.id, mode = ?props.mode))]
    pub fn sym_cipher_init(&self, ctx: &CryptoContext, props: &SymCipherProps) -> SepResult<()> {
        let res = self.inner.sym_cipher_begin(ctx, props)?;
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

    /// Encrypts or decrypts whole blocks.
    ///
    /// # Arguments
    /// * `ctx` - Initialized context
    /// * `din` - Input, a multiple of the block size
    /// * `dout` - Output, at least as long as `din`; may be the same range as `din`
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - `dout` is too short
    /// * `DeviceStatus::InvalDataSize` - `din` is not block aligned
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn sym_cipher_process(&self, ctx: &CryptoContext, din: BufRange<'_>, dout: BufRange<'_>) -> SepResult<()> {
        match self.inner.sym_cipher_data(ctx, CryptoOp::Process, &din, &dout)? {
            Some((res, plan)) => self.inner.execute(res, plan, |_, _| Ok(())),
            None => Ok(()),
        }
    }

    /// Asynchronous [`Client::sym_cipher_process`].
    ///
    /// Returns once the request is pending; `callback` receives the outcome.
    /// Without `may_backlog` a full ring fails the call with `HostError::NoResource`.
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn sym_cipher_process_async(
        &self,
        ctx: &CryptoContext,
        din: BufRange<'_>,
        dout: BufRange<'_>,
        may_backlog: bool,
        callback: impl FnOnce(SepResult<()>) + Send + 'static,
    ) -> SepResult<()> {
        let callback: Callback<()> = Box::new(callback);
        match self.inner.sym_cipher_data(ctx, CryptoOp::Process, &din, &dout)? {
            Some((res, plan)) => {
                self.inner
                    .execute_async(res, plan, may_backlog, Box::new(no_result), callback)
            }
            None => {
                self.inner.complete_now(callback, Ok(()));
                Ok(())
            }
        }
    }

    /// Processes the last data and ends the context's lifetime.
    ///
    /// A trailing partial block is accepted in CTR mode only.
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn sym_cipher_finalize(&self, ctx: &CryptoContext, din: BufRange<'_>, dout: BufRange<'_>) -> SepResult<()> {
        match self.inner.sym_cipher_data(ctx, CryptoOp::Finalize, &din, &dout)? {
            Some((res, plan)) => self.inner.execute(res, plan, |client, res| {
                retire_all(client, res);
                Ok(())
            }),
            None => Ok(()),
        }
    }

    /// Init, process and finalize in one pass.
    #[instrument(skip_all, fields(client = self.inner.id, mode = ?props.mode, len = din.len))]
    pub fn sym_cipher_integrated(
        &self,
        ctx: &CryptoContext,
        props: &SymCipherProps,
        din: BufRange<'_>,
        dout: BufRange<'_>,
    ) -> SepResult<()> {
        check_output(&dout, din.len)?;
        let mut res = self.inner.sym_cipher_begin(ctx, props)?;
        let (din, dout) = self.inner.map_io(&mut res, &din, &dout)?;
        let plan = Plan::Crypto {
            op: CryptoOp::Integrated,
            din,
            dout,
        };
        self.inner.execute(res, plan, |client, res| {
            retire_all(client, res);
            Ok(())
        })
    }
}
