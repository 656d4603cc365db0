// Copyright (C) Microsoft Corporation. All rights reserved.

//! Authenticated-encryption (AES-CCM) verbs.
//!
//! The device initializes a CCM context from the encoded associated data.
//! When the properties announce associated data, `auth_enc_init` only
//! prepares the host blob and leaves the context in `PartialInit`; the first
//! `auth_enc_process` call carries the associated data and performs the
//! postponed device init.

use sep_interface::*;
use tracing::instrument;
use zerocopy::FromZeros;

use super::*;
use crate::client::Callback;
use crate::client::no_result;
use crate::client::Client;

fn auth_enc_body(props: &AuthEncProps) -> AuthEncCtx {
    let mut body = AuthEncCtx::new_zeroed();
    body.key[..props.key.len()].copy_from_slice(&props.key);
    body.nonce[..props.nonce.len()].copy_from_slice(&props.nonce);
    body.adata_len = props.adata_len as u64;
    body.text_len = props.text_len as u64;
    body.key_len = props.key.len() as u32;
    body.direction = props.direction as u32;
    body.nonce_len = props.nonce.len() as u32;
    body.tag_len = props.tag_len as u32;
    body
}

fn auth_enc_kind(props: &AuthEncProps) -> CtxKind {
    CtxKind::AuthEnc {
        direction: props.direction,
        tag_len: props.tag_len,
        adata_len: props.adata_len,
        text_len: props.text_len,
    }
}

/// Size of the finalize output for `din_len` input bytes.
fn final_len(direction: CryptoDirection, tag_len: usize, din_len: usize) -> SepResult<usize> {
    match direction {
        CryptoDirection::Encrypt => Ok(din_len + tag_len),
        CryptoDirection::Decrypt => match din_len.checked_sub(tag_len) {
            Some(len) => Ok(len),
            None => {
                tracing::error!(din_len, tag_len, "Input shorter than the tag");
                Err(HostError::InvalidArgument)?
            }
        },
    }
}

/// A prepared CCM process pass.
enum Step {
    /// Submit with the given post-processing
    Submit(OpResources, Plan, PostFn<()>),

    /// Nothing to send
    Done,
}

fn mark_initialized(_: &ClientInner, res: &mut OpResources) -> SepResult<()> {
    set_state(res, CtxState::Initialized);
    Ok(())
}

impl ClientInner {
    fn auth_enc_begin(&self, ctx: &CryptoContext, props: &AuthEncProps, state: CtxState) -> SepResult<OpResources> {
        AlgProps::AuthEnc(props.clone()).validate()?;
        self.begin_ctx(
            ctx,
            auth_enc_kind(props),
            props.mode as u32,
            &auth_enc_body(props),
            state,
        )
    }

    fn auth_enc_step(&self, ctx: &CryptoContext, din: &BufRange<'_>, dout: &BufRange<'_>) -> SepResult<Step> {
        let mut res = self.begin_op()?;
        self.map_ctx(&mut res, ctx)?;
        let allowed = [CtxState::PartialInit, CtxState::Initialized];
        let CtxKind::AuthEnc { adata_len, .. } = ctx_kind(&res, AlgClass::AuthEnc, &allowed)? else {
            return Err(SepError::Device(DeviceStatus::BadCtx));
        };

        if ctx.state() == CtxState::PartialInit {
            if din.len != adata_len {
                tracing::error!(len = din.len, adata_len, "Postponed init needs the whole associated data");
                Err(HostError::InvalidArgument)?
            }

            let prefix = ccm_adata_prefix(adata_len);
            let data = match self.map_input(&mut res, &prefix, std::slice::from_ref(din), None)? {
                Input::Table { data, .. } => data,
                _ => DataRef::Null,
            };
            let plan = Plan::Crypto {
                op: CryptoOp::Init,
                din: data,
                dout: DataRef::Null,
            };
            tracing::debug!(adata_len, "Running postponed CCM init");
            return Ok(Step::Submit(res, plan, Box::new(mark_initialized)));
        }

        check_output(dout, din.len)?;
        if din.len == 0 {
            return Ok(Step::Done);
        }
        let (din, dout) = self.map_io(&mut res, din, dout)?;
        let plan = Plan::Crypto {
            op: CryptoOp::Process,
            din,
            dout,
        };
        Ok(Step::Submit(res, plan, Box::new(no_result)))
    }
}

impl Client {
    /// Initializes an authenticated-encryption context.
    ///
    /// With `props.adata_len > 0` nothing is sent to the device yet: the
    /// context becomes `PartialInit` and the next [`Client::auth_enc_process`]
    /// must pass exactly the associated data.
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - Invalid key, nonce or tag size
    #[instrument(skip_all, fields(client = self.inner.id, mode = ?props.mode, adata_len = props.adata_len))]
    pub fn auth_enc_init(&self, ctx: &CryptoContext, props: &AuthEncProps) -> SepResult<()> {
        if props.adata_len > 0 {
            self.inner.auth_enc_begin(ctx, props, CtxState::PartialInit)?;
            return Ok(());
        }

        let res = self.inner.auth_enc_begin(ctx, props, CtxState::Uninitialized)?;
        let plan = Plan::Crypto {
            op: CryptoOp::Init,
            din: DataRef::Null,
            dout: DataRef::Null,
        };
        self.inner.execute(res, plan, mark_initialized)
    }

    /// Feeds associated data (first call after a postponed init) or payload.
    ///
    /// # Arguments
    /// * `ctx` - Context in `PartialInit` or `Initialized` state
    /// * `din` - The associated data, or whole blocks of payload
    /// * `dout` - Payload output; ignored while feeding associated data
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - Associated data of the wrong size, or
    ///   `dout` too short
    /// * `DeviceStatus::InvalDataSize` - Payload not block aligned or beyond
    ///   the announced length
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn auth_enc_process(&self, ctx: &CryptoContext, din: BufRange<'_>, dout: BufRange<'_>) -> SepResult<()> {
        match self.inner.auth_enc_step(ctx, &din, &dout)? {
            Step::Submit(res, plan, post) => self.inner.execute(res, plan, post),
            Step::Done => Ok(()),
        }
    }

    /// Asynchronous [`Client::auth_enc_process`].
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn auth_enc_process_async(
        &self,
        ctx: &CryptoContext,
        din: BufRange<'_>,
        dout: BufRange<'_>,
        may_backlog: bool,
        callback: impl FnOnce(SepResult<()>) + Send + 'static,
    ) -> SepResult<()> {
        let callback: Callback<()> = Box::new(callback);
        match self.inner.auth_enc_step(ctx, &din, &dout)? {
            Step::Submit(res, plan, post) => self.inner.execute_async(res, plan, may_backlog, post, callback),
            Step::Done => {
                self.inner.complete_now(callback, Ok(()));
                Ok(())
            }
        }
    }

    /// Processes the remaining payload and produces or checks the tag.
    ///
    /// Encryption writes `din.len + tag_len` bytes (ciphertext then tag).
    /// Decryption takes ciphertext followed by the tag and writes
    /// `din.len - tag_len` bytes of plaintext. `dout` must not overlap `din`.
    ///
    /// # Returns
    /// * `usize` - Number of bytes written to `dout`
    ///
    /// # Error
    /// * `DeviceStatus::AuthFailed` - Tag mismatch on decryption
    /// * `DeviceStatus::InvalDataSize` - Total payload differs from the announced length
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn auth_enc_finalize(&self, ctx: &CryptoContext, din: BufRange<'_>, dout: BufRange<'_>) -> SepResult<usize> {
        let inner = &self.inner;
        let mut res = inner.begin_op()?;
        inner.map_ctx(&mut res, ctx)?;
        let CtxKind::AuthEnc {
            direction, tag_len, ..
        } = ctx_kind(&res, AlgClass::AuthEnc, &[CtxState::Initialized])?
        else {
            return Err(SepError::Device(DeviceStatus::BadCtx));
        };

        let out_len = final_len(direction, tag_len, din.len)?;
        check_output(&dout, out_len)?;
        let data = inner.map_simple(&mut res, &din, DmaDirection::ToDevice)?;
        let out = BufRange::new(dout.buf, dout.offset, out_len);
        let out = inner.map_simple(&mut res, &out, DmaDirection::FromDevice)?;
        let plan = Plan::Crypto {
            op: CryptoOp::Finalize,
            din: data,
            dout: out,
        };
        inner.execute(res, plan, move |client, res| {
            retire_all(client, res);
            Ok(out_len)
        })
    }

    /// Init, process and finalize in one pass.
    ///
    /// # Arguments
    /// * `adata` - Associated data, `props.adata_len` bytes
    /// * `din` - Whole payload (decryption: ciphertext followed by the tag)
    /// * `dout` - Output, see [`Client::auth_enc_finalize`]
    ///
    /// # Returns
    /// * `usize` - Number of bytes written to `dout`
    #[instrument(skip_all, fields(client = self.inner.id, mode = ?props.mode, len = din.len))]
    pub fn auth_enc_integrated(
        &self,
        ctx: &CryptoContext,
        props: &AuthEncProps,
        adata: BufRange<'_>,
        din: BufRange<'_>,
        dout: BufRange<'_>,
    ) -> SepResult<usize> {
        if adata.len != props.adata_len {
            tracing::error!(len = adata.len, adata_len = props.adata_len, "Associated data size mismatch");
            Err(HostError::InvalidArgument)?
        }
        let out_len = final_len(props.direction, props.tag_len, din.len)?;
        check_output(&dout, out_len)?;

        let inner = &self.inner;
        let mut res = inner.auth_enc_begin(ctx, props, CtxState::Uninitialized)?;
        let prefix = ccm_adata_prefix(props.adata_len);
        let data = match inner.map_input(&mut res, &prefix, &[adata, din], None)? {
            Input::Table { data, .. } => data,
            _ => DataRef::Null,
        };
        let out = BufRange::new(dout.buf, dout.offset, out_len);
        let out = inner.map_simple(&mut res, &out, DmaDirection::FromDevice)?;
        let plan = Plan::Crypto {
            op: CryptoOp::Integrated,
            din: data,
            dout: out,
        };
        inner.execute(res, plan, move |client, res| {
            retire_all(client, res);
            Ok(out_len)
        })
    }
}
