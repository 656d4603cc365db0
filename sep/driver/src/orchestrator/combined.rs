// Copyright (C) Microsoft Corporation. All rights reserved.

//! Combined chain verbs.
//!
//! A chain runs up to [`MAX_COMBINED_NODES`] initialized contexts in one
//! device pass. The contexts keep their own lifetimes; the chain only pins
//! them together for each pass.

use sep_interface::*;
use tracing::instrument;

use super::*;
use crate::client::Callback;
use crate::client::no_result;
use crate::client::Client;

/// A validated chain topology over a set of contexts.
#[derive(Debug, Clone)]
pub struct CombinedContext {
    scheme: CombinedScheme,
    nodes: Vec<ChainNode>,
    ctxs: Vec<CryptoContext>,
}

impl CombinedContext {
    /// Returns the packed topology.
    pub fn scheme(&self) -> CombinedScheme {
        self.scheme
    }

    /// Returns the chain nodes.
    pub fn nodes(&self) -> &[ChainNode] {
        &self.nodes
    }

    fn has_cipher(&self) -> bool {
        self.nodes.iter().any(|node| node.engine == EngineType::Aes)
    }

    /// True when a member is a CMAC context. CMAC needs the last block at
    /// finalize, which a chain pass cannot hold back for every member.
    fn has_cmac(&self) -> bool {
        self.ctxs.iter().any(|ctx| {
            matches!(
                ctx.lock().expect(&[CtxState::Initialized]),
                Ok(CtxKind::Mac(MacMode::AesCmac))
            )
        })
    }

    /// Largest processing block of the chain.
    fn block_size(&self) -> usize {
        self.ctxs
            .iter()
            .filter_map(|ctx| ctx.lock().expect(&[CtxState::Initialized]).ok())
            .map(|kind| kind.block_size())
            .max()
            .unwrap_or(AES_BLOCK_SIZE)
    }
}

fn engine_class(engine: EngineType) -> Option<AlgClass> {
    match engine {
        EngineType::Aes => Some(AlgClass::SymCipher),
        EngineType::Hash => Some(AlgClass::Hash),
        EngineType::Mac => Some(AlgClass::Mac),
        EngineType::Null => None,
    }
}

/// Checks that every context can take part in a pass.
///
/// # Error
/// * `DeviceStatus::BadCtx` - Uninitialized, or holding buffered input
fn check_members(ctxs: &[CryptoContext]) -> SepResult<()> {
    for ctx in ctxs {
        let inner = ctx.lock();
        inner.expect(&[CtxState::Initialized])?;
        if !inner.remainder.is_empty() {
            tracing::error!(uid = ?inner.uid(), buffered = inner.remainder.len(), "Chain member holds buffered input");
            Err(SepError::Device(DeviceStatus::BadCtx))?
        }
    }
    Ok(())
}

/// Reads the per-node results out of the context blobs after a finalize pass.
fn chain_results(client: &ClientInner, res: &mut OpResources) -> SepResult<Vec<Vec<u8>>> {
    let mut results = Vec::with_capacity(res.ctxs.len());
    for mapped in &res.ctxs {
        let inner = mapped.lock();
        let result = match inner.expect(&[CtxState::Initialized])? {
            CtxKind::Hash(mode) => inner
                .body::<HashCtx>()
                .map(|body| body.digest[..mode.digest_size()].to_vec()),
            CtxKind::Mac(mode) => inner
                .body::<MacCtx>()
                .map(|body| body.mac[..mode.mac_size()].to_vec()),
            _ => Some(Vec::new()),
        };
        results.push(result.ok_or(HostError::Io)?);
    }
    retire_all(client, res);
    Ok(results)
}

impl ClientInner {
    fn combined_pass(
        &self,
        chain: &CombinedContext,
        din: &BufRange<'_>,
        dout: &BufRange<'_>,
        finalize: bool,
    ) -> SepResult<(OpResources, Plan)> {
        if chain.has_cipher() {
            check_output(dout, din.len)?;
        }
        check_members(&chain.ctxs)?;
        if !finalize && chain.has_cmac() {
            tracing::error!(len = din.len, "A chain with a CMAC member takes its input at finalize");
            Err(HostError::InvalidArgument)?
        }
        if !finalize && din.len % chain.block_size() != 0 {
            tracing::error!(len = din.len, block = chain.block_size(), "Chain input not block aligned");
            Err(HostError::InvalidArgument)?
        }

        let mut res = self.begin_op()?;
        for ctx in &chain.ctxs {
            self.map_ctx(&mut res, ctx)?;
        }

        let (din, dout) = if chain.has_cipher() {
            self.map_io(&mut res, din, dout)?
        } else {
            (self.map_simple(&mut res, din, DmaDirection::ToDevice)?, DataRef::Null)
        };
        let plan = Plan::Combined {
            scheme: chain.scheme,
            din,
            dout,
            finalize,
        };
        Ok((res, plan))
    }
}

impl Client {
    /// Builds a chain over initialized contexts.
    ///
    /// # Arguments
    /// * `nodes` - Topology; node `i` runs on `ctxs[i]`
    /// * `ctxs` - Distinct contexts whose classes match the node engines
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - Length mismatch, a topology that cannot
    ///   be encoded, or a context listed twice
    /// * `DeviceStatus::BadCtx` - Engine and context class differ, or a
    ///   context is not initialized
    #[instrument(skip_all, fields(client = self.inner.id, nodes = nodes.len()))]
    pub fn combined_init(&self, nodes: &[ChainNode], ctxs: &[&CryptoContext]) -> SepResult<CombinedContext> {
        if nodes.len() != ctxs.len() {
            tracing::error!(nodes = nodes.len(), ctxs = ctxs.len(), "One context per node required");
            Err(HostError::InvalidArgument)?
        }
        let Some(scheme) = CombinedScheme::encode(nodes) else {
            tracing::error!(?nodes, "Unsupported chain topology");
            return Err(SepError::Host(HostError::InvalidArgument));
        };

        for (i, ctx) in ctxs.iter().enumerate() {
            if ctxs[..i].iter().any(|other| other.same(ctx)) {
                tracing::error!(node = i, "Context used twice in one chain");
                Err(HostError::InvalidArgument)?
            }
        }

        for (node, ctx) in nodes.iter().zip(ctxs) {
            if engine_class(node.engine) != Some(ctx.class()) {
                tracing::error!(?node, class = ?ctx.class(), "Chain node does not match its context");
                Err(SepError::Device(DeviceStatus::BadCtx))?
            }
        }

        let ctxs: Vec<CryptoContext> = ctxs.iter().map(|ctx| (*ctx).clone()).collect();
        check_members(&ctxs)?;
        tracing::debug!(scheme = scheme.0, "Chain built");
        Ok(CombinedContext {
            scheme,
            nodes: nodes.to_vec(),
            ctxs,
        })
    }

    /// Runs whole blocks through the chain.
    ///
    /// `din.len` must be a multiple of the largest block size in the chain.
    /// Chains with a CMAC member reject this with `HostError::InvalidArgument`
    /// and take all of their input in [`Client::combined_finalize`].
    /// The cipher output is written to `dout`; chains without a cipher node
    /// ignore `dout`.
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn combined_process(&self, chain: &CombinedContext, din: BufRange<'_>, dout: BufRange<'_>) -> SepResult<()> {
        let (res, plan) = self.inner.combined_pass(chain, &din, &dout, false)?;
        self.inner.execute(res, plan, no_result)
    }

    /// Asynchronous [`Client::combined_process`].
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn combined_process_async(
        &self,
        chain: &CombinedContext,
        din: BufRange<'_>,
        dout: BufRange<'_>,
        may_backlog: bool,
        callback: impl FnOnce(SepResult<()>) + Send + 'static,
    ) -> SepResult<()> {
        let callback: Callback<()> = Box::new(callback);
        let (res, plan) = self.inner.combined_pass(chain, &din, &dout, false)?;
        self.inner
            .execute_async(res, plan, may_backlog, Box::new(no_result), callback)
    }

    /// Runs the last data through the chain and ends every member's lifetime.
    ///
    /// # Returns
    /// One entry per node: the digest or MAC for hash and MAC nodes, empty for
    /// cipher nodes (their output went to `dout`).
    #[instrument(skip_all, fields(client = self.inner.id, len = din.len))]
    pub fn combined_finalize(
        &self,
        chain: &CombinedContext,
        din: BufRange<'_>,
        dout: BufRange<'_>,
    ) -> SepResult<Vec<Vec<u8>>> {
        let (res, plan) = self.inner.combined_pass(chain, &din, &dout, true)?;
        self.inner.execute(res, plan, chain_results)
    }
}

