// Copyright (C) Microsoft Corporation. All rights reserved.

//! Descriptor execution for the simulated SeP.

use std::collections::HashMap;
use std::sync::Arc;

use sep_interface::*;
use tracing::instrument;
use uuid::Uuid;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::applet::Applet;
use crate::applet::AppletParam;
use crate::applet::RpcAgent;
use crate::crypto::aes;
use crate::crypto::aes::AesKey;
use crate::crypto::ccm::CcmState;
use crate::crypto::cmac;
use crate::crypto::hmac;
use crate::crypto::sha::ShaState;
use crate::data;

type DevResult<T> = Result<T, DeviceStatus>;

#[derive(Debug)]
struct Slot {
    uid: ContextUid,
    blob: Vec<u8>,
}

struct AppletSession {
    applet: Arc<dyn Applet>,
    value: u64,
}

/// Device side state touched by descriptors.
pub(crate) struct Engine {
    dma: Arc<DmaSpace>,
    slots: Vec<Option<Slot>>,
    applets: HashMap<Uuid, Arc<dyn Applet>>,
    agents: HashMap<u16, Arc<dyn RpcAgent>>,
    sessions: HashMap<u32, AppletSession>,
    next_handle: u32,
    fail_next: Option<DeviceStatus>,
    executed: u64,
}

fn header(blob: &[u8]) -> DevResult<(SepCtxHeader, AlgClass)> {
    let hdr = SepCtxHeader::read(blob).ok_or(DeviceStatus::BadCtx)?;
    let class = AlgClass::try_from(hdr.alg).map_err(|_| DeviceStatus::Unsup)?;
    Ok((hdr, class))
}

fn read_body<T: CtxBody>(blob: &[u8]) -> DevResult<T> {
    T::read(blob).ok_or(DeviceStatus::BadCtx)
}

fn write_body<T: CtxBody>(blob: &mut [u8], body: &T) -> DevResult<()> {
    if body.write(blob) {
        Ok(())
    } else {
        Err(DeviceStatus::BadCtx)
    }
}

fn key_bytes(key: &[u8], len: u32) -> DevResult<&[u8]> {
    key.get(..len as usize).ok_or(DeviceStatus::BadCtx)
}

fn require_empty(input: &[u8]) -> DevResult<()> {
    if input.is_empty() {
        Ok(())
    } else {
        Err(DeviceStatus::InvalDataSize)
    }
}

fn sym_cipher(op: CryptoOp, blob: &mut [u8], input: &[u8]) -> DevResult<Vec<u8>> {
    let (hdr, _) = header(blob)?;
    let mode = CipherMode::try_from(hdr.mode).map_err(|_| DeviceStatus::Unsup)?;
    let mut body: CipherCtx = read_body(blob)?;
    let direction = CryptoDirection::try_from(body.direction).map_err(|_| DeviceStatus::BadCtx)?;
    let key = AesKey::new(key_bytes(&body.key, body.key_len)?)?;

    let mut iv = body.iv;
    let out = match op {
        CryptoOp::Init => {
            require_empty(input)?;
            Vec::new()
        }
        CryptoOp::Process => aes::cipher(&key, mode, direction, &mut iv, input, false)?,
        CryptoOp::Finalize | CryptoOp::Integrated => {
            aes::cipher(&key, mode, direction, &mut iv, input, true)?
        }
    };

    body.iv = iv;
    write_body(blob, &body)?;
    Ok(out)
}

fn hash(op: CryptoOp, blob: &mut [u8], input: &[u8]) -> DevResult<Vec<u8>> {
    let (hdr, _) = header(blob)?;
    let mode = HashMode::try_from(hdr.mode).map_err(|_| DeviceStatus::Unsup)?;
    let mut body: HashCtx = read_body(blob)?;
    let count = body.byte_count;

    let out = match op {
        CryptoOp::Init => {
            require_empty(input)?;
            body.state = ShaState::new(mode).store();
            body.byte_count = 0;
            Vec::new()
        }
        CryptoOp::Process => {
            let mut state = ShaState::load(mode, &body.state);
            state.compress(input)?;
            body.state = state.store();
            body.byte_count = count + input.len() as u64;
            Vec::new()
        }
        CryptoOp::Finalize | CryptoOp::Integrated => {
            let (state, count) = if op == CryptoOp::Integrated {
                (ShaState::new(mode), 0)
            } else {
                (ShaState::load(mode, &body.state), count)
            };
            let digest = state.finish(mode, input, count + input.len() as u64);
            body.digest[..digest.len()].copy_from_slice(&digest);
            digest
        }
    };

    write_body(blob, &body)?;
    Ok(out)
}

fn mac(op: CryptoOp, blob: &mut [u8], input: &[u8]) -> DevResult<Vec<u8>> {
    let (hdr, _) = header(blob)?;
    let mode = MacMode::from_raw(hdr.mode).map_err(|_| DeviceStatus::Unsup)?;
    let mut body: MacCtx = read_body(blob)?;
    let key = key_bytes(&body.key, body.key_len)?.to_vec();

    if matches!(op, CryptoOp::Init | CryptoOp::Integrated) {
        match mode {
            MacMode::Hmac(hash) => {
                let (inner, outer) = hmac::init(hash, &key);
                body.inner = inner.store();
                body.outer = outer.store();
                body.byte_count = hash.block_size() as u64;
            }
            MacMode::AesCmac => {
                let (k1, k2) = cmac::subkeys(&AesKey::new(&key)?);
                body.subkey1 = k1;
                body.subkey2 = k2;
                body.chain = [0; AES_BLOCK_SIZE];
                body.byte_count = 0;
            }
        }
    }

    let count = body.byte_count;
    let out = match (op, mode) {
        (CryptoOp::Init, _) => {
            require_empty(input)?;
            Vec::new()
        }
        (CryptoOp::Process, MacMode::Hmac(hash)) => {
            let mut inner = ShaState::load(hash, &body.inner);
            inner.compress(input)?;
            body.inner = inner.store();
            body.byte_count = count + input.len() as u64;
            Vec::new()
        }
        (CryptoOp::Process, MacMode::AesCmac) => {
            let mut chain = body.chain;
            cmac::update(&AesKey::new(&key)?, &mut chain, input)?;
            body.chain = chain;
            body.byte_count = count + input.len() as u64;
            Vec::new()
        }
        (_, MacMode::Hmac(hash)) => {
            let inner = ShaState::load(hash, &body.inner);
            let outer = ShaState::load(hash, &body.outer);
            hmac::finish(hash, inner, outer, input, count)
        }
        (_, MacMode::AesCmac) => {
            let mut chain = body.chain;
            let (k1, k2) = (body.subkey1, body.subkey2);
            cmac::finish(&AesKey::new(&key)?, &mut chain, &k1, &k2, input).to_vec()
        }
    };

    if !out.is_empty() {
        body.mac[..out.len()].copy_from_slice(&out);
    }
    write_body(blob, &body)?;
    Ok(out)
}

fn auth_enc_setup_len(blob: &[u8]) -> DevResult<usize> {
    let body: AuthEncCtx = read_body(blob)?;
    let adata_len = body.adata_len as usize;
    Ok(ccm_adata_prefix(adata_len).len() + adata_len)
}

fn auth_enc(op: CryptoOp, blob: &mut [u8], input: &[u8]) -> DevResult<Vec<u8>> {
    let (hdr, _) = header(blob)?;
    AuthEncMode::try_from(hdr.mode).map_err(|_| DeviceStatus::Unsup)?;
    let mut body: AuthEncCtx = read_body(blob)?;
    let key = AesKey::new(key_bytes(&body.key, body.key_len)?)?;
    let nonce = body.nonce.get(..body.nonce_len as usize).ok_or(DeviceStatus::BadCtx)?.to_vec();
    let tag_len = body.tag_len as usize;
    let encrypt = CryptoDirection::try_from(body.direction).map_err(|_| DeviceStatus::BadCtx)?
        == CryptoDirection::Encrypt;
    let (adata_len, text_len, processed) = (body.adata_len, body.text_len, body.processed);

    if op == CryptoOp::Integrated {
        let setup_len = auth_enc_setup_len(blob)?;
        if input.len() < setup_len {
            Err(DeviceStatus::InvalDataSize)?
        }
        let (setup, rest) = input.split_at(setup_len);
        auth_enc(CryptoOp::Init, blob, setup)?;
        return auth_enc(CryptoOp::Finalize, blob, rest);
    }

    if op == CryptoOp::Init {
        let prefix = ccm_adata_prefix(adata_len as usize);
        if input.len() != prefix.len() + adata_len as usize || !input.starts_with(&prefix) {
            tracing::debug!(len = input.len(), adata_len, "Malformed CCM associated data");
            Err(DeviceStatus::InvalDataSize)?
        }

        let state = CcmState::start(&key, &nonce, tag_len, text_len, input)?;
        body.mac = state.mac;
        body.ctr = state.ctr;
        body.processed = 0;
        write_body(blob, &body)?;
        return Ok(Vec::new());
    }

    let mut state = CcmState {
        mac: body.mac,
        ctr: body.ctr,
        q: 15 - nonce.len(),
    };

    let out = if op == CryptoOp::Process {
        if input.is_empty() || input.len() % AES_BLOCK_SIZE != 0 {
            Err(DeviceStatus::InvalDataSize)?
        }
        if processed + input.len() as u64 > text_len {
            Err(DeviceStatus::InvalDataSize)?
        }
        body.processed = processed + input.len() as u64;
        state.process(&key, encrypt, input)
    } else {
        let (text, expected) = if encrypt {
            (input, None)
        } else {
            let split = input
                .len()
                .checked_sub(tag_len)
                .ok_or(DeviceStatus::InvalDataSize)?;
            let (text, tag) = input.split_at(split);
            (text, Some(tag))
        };
        if processed + text.len() as u64 != text_len {
            tracing::debug!(processed, len = text.len(), text_len, "CCM payload length mismatch");
            Err(DeviceStatus::InvalDataSize)?
        }

        let mut out = state.process(&key, encrypt, text);
        let tag = state.tag(&key, &nonce, tag_len);
        match expected {
            None => out.extend_from_slice(&tag),
            Some(expected) if expected == tag.as_slice() => (),
            Some(_) => {
                tracing::debug!("CCM tag mismatch");
                Err(DeviceStatus::AuthFailed)?
            }
        }

        body.processed = text_len;
        body.tag[..tag.len()].copy_from_slice(&tag);
        out
    };

    body.mac = state.mac;
    body.ctr = state.ctr;
    write_body(blob, &body)?;
    Ok(out)
}

/// Runs one crypto verb against a context blob.
fn run_class(op: CryptoOp, blob: &mut [u8], input: &[u8]) -> DevResult<Vec<u8>> {
    let (_, class) = header(blob)?;
    match class {
        AlgClass::SymCipher => sym_cipher(op, blob, input),
        AlgClass::AuthEnc => auth_enc(op, blob, input),
        AlgClass::Mac => mac(op, blob, input),
        AlgClass::Hash => hash(op, blob, input),
    }
}

impl Engine {
    pub(crate) fn new(dma: Arc<DmaSpace>, cache_slots: usize) -> Self {
        Self {
            dma,
            slots: (0..cache_slots).map(|_| None).collect(),
            applets: HashMap::new(),
            agents: HashMap::new(),
            sessions: HashMap::new(),
            next_handle: 1,
            fail_next: None,
            executed: 0,
        }
    }

    pub(crate) fn register_applet(&mut self, id: Uuid, applet: Arc<dyn Applet>) {
        self.applets.insert(id, applet);
    }

    pub(crate) fn register_agent(&mut self, id: u16, agent: Arc<dyn RpcAgent>) {
        self.agents.insert(id, agent);
    }

    pub(crate) fn fail_next(&mut self, status: DeviceStatus) {
        self.fail_next = Some(status);
    }

    pub(crate) fn executed(&self) -> u64 {
        self.executed
    }

    pub(crate) fn slot_uid(&self, slot: usize) -> Option<ContextUid> {
        self.slots.get(slot)?.as_ref().map(|s| s.uid)
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Executes one descriptor and returns its completion status.
    #[instrument(skip_all, fields(desc = desc.name()))]
    pub(crate) fn execute(&mut self, desc: &Descriptor) -> DeviceStatus {
        self.executed += 1;

        let result = match desc {
            Descriptor::Crypto { op, ctx, din, dout } => self.crypto(*op, ctx, din, dout),
            Descriptor::Load { ctxs } => self.load(ctxs),
            Descriptor::Combined {
                scheme,
                ctxs,
                din,
                dout,
                finalize,
            } => self.combined(*scheme, ctxs, din, dout, *finalize),
            Descriptor::Rpc {
                agent,
                func,
                params,
                memrefs,
            } => self.rpc(*agent, *func, params, memrefs),
            Descriptor::AppletOpen { app, params } => self.applet_open(app, params),
            Descriptor::AppletInvoke {
                handle,
                cmd,
                params,
            } => self.applet_invoke(*handle, *cmd, params),
            Descriptor::AppletClose { handle } => self.applet_close(*handle),
        };

        match result {
            Ok(()) => DeviceStatus::None,
            Err(status) => {
                tracing::debug!(%status, "Descriptor failed");
                status
            }
        }
    }

    /// Makes the slot named by `ctx` hold its context and returns a working copy of the blob.
    fn bind(&mut self, ctx: &CtxRef) -> DevResult<Vec<u8>> {
        let slot = self
            .slots
            .get_mut(ctx.slot as usize)
            .ok_or(DeviceStatus::BadCtx)?;

        if ctx.load {
            let raw = self
                .dma
                .read(ctx.addr, SEP_CTX_HEADER_SIZE)
                .map_err(|_| DeviceStatus::BadCtx)?;
            let (hdr, class) = header(&raw)?;
            if hdr.uid() != ctx.uid {
                tracing::warn!(expected = %ctx.uid, found = %hdr.uid(), "Context UID mismatch on load");
                Err(DeviceStatus::BadCtx)?
            }

            let blob = self
                .dma
                .read(ctx.addr, ctx_blob_size(class))
                .map_err(|_| DeviceStatus::BadCtx)?;
            tracing::trace!(slot = ctx.slot, uid = %ctx.uid, "Context loaded");
            *slot = Some(Slot { uid: ctx.uid, blob });
        }

        match slot {
            Some(resident) if resident.uid == ctx.uid => Ok(resident.blob.clone()),
            resident => {
                tracing::warn!(
                    slot = ctx.slot,
                    expected = %ctx.uid,
                    resident = ?resident.as_ref().map(|s| s.uid),
                    "Cache residency mismatch"
                );
                Err(DeviceStatus::BadCtx)
            }
        }
    }

    /// Stores an updated blob in its slot and writes it through to host memory.
    fn commit(&mut self, ctx: &CtxRef, blob: Vec<u8>) -> DevResult<()> {
        self.dma
            .write(ctx.addr, &blob)
            .map_err(|_| DeviceStatus::BadCtx)?;
        if let Some(Some(slot)) = self.slots.get_mut(ctx.slot as usize) {
            slot.blob = blob;
        }
        Ok(())
    }

    fn evict(&mut self, ctxs: &[CtxRef]) {
        for ctx in ctxs {
            if let Some(slot) = self.slots.get_mut(ctx.slot as usize) {
                *slot = None;
            }
        }
    }

    fn injected_fault(&mut self, ctxs: &[CtxRef]) -> DevResult<()> {
        match self.fail_next.take() {
            Some(status) => {
                tracing::debug!(%status, "Injected fault");
                self.evict(ctxs);
                Err(status)
            }
            None => Ok(()),
        }
    }

    fn crypto(&mut self, op: CryptoOp, ctx: &CtxRef, din: &DataRef, dout: &DataRef) -> DevResult<()> {
        let ctxs = std::slice::from_ref(ctx);
        self.injected_fault(ctxs)?;

        let result = self.bind(ctx).and_then(|mut blob| {
            data::check_overlap(&self.dma, din, dout)?;
            let input = data::gather(&self.dma, din)?;
            let output = run_class(op, &mut blob, &input)?;
            if !output.is_empty() {
                data::scatter(&self.dma, dout, &output)?;
            }
            Ok(blob)
        });

        match result {
            Ok(blob) => self.commit(ctx, blob),
            Err(status) => {
                self.evict(ctxs);
                Err(status)
            }
        }
    }

    fn load(&mut self, ctxs: &[CtxRef]) -> DevResult<()> {
        for ctx in ctxs {
            if let Err(status) = self.bind(ctx) {
                self.evict(ctxs);
                Err(status)?
            }
        }
        Ok(())
    }

    fn combined(
        &mut self,
        scheme: CombinedScheme,
        ctxs: &[CtxRef],
        din: &DataRef,
        dout: &DataRef,
        finalize: bool,
    ) -> DevResult<()> {
        self.injected_fault(ctxs)?;

        let result = self.combined_pass(scheme, ctxs, din, dout, finalize);
        match result {
            Ok(blobs) => {
                for (ctx, blob) in ctxs.iter().zip(blobs) {
                    self.commit(ctx, blob)?;
                }
                Ok(())
            }
            Err(status) => {
                self.evict(ctxs);
                Err(status)
            }
        }
    }

    fn combined_pass(
        &mut self,
        scheme: CombinedScheme,
        ctxs: &[CtxRef],
        din: &DataRef,
        dout: &DataRef,
        finalize: bool,
    ) -> DevResult<Vec<Vec<u8>>> {
        let nodes = scheme.decode().ok_or(DeviceStatus::Unsup)?;
        if nodes.is_empty() || nodes.len() != ctxs.len() {
            Err(DeviceStatus::BadCtx)?
        }

        let mut blobs = ctxs
            .iter()
            .map(|ctx| self.bind(ctx))
            .collect::<DevResult<Vec<_>>>()?;

        data::check_overlap(&self.dma, din, dout)?;
        let input = data::gather(&self.dma, din)?;
        let op = if finalize {
            CryptoOp::Finalize
        } else {
            CryptoOp::Process
        };

        let mut prev = input.clone();
        let mut cipher_out = None;
        for (node, blob) in nodes.iter().zip(blobs.iter_mut()) {
            let (_, class) = header(blob)?;
            let engine_matches = matches!(
                (node.engine, class),
                (EngineType::Aes, AlgClass::SymCipher)
                    | (EngineType::Hash, AlgClass::Hash)
                    | (EngineType::Mac, AlgClass::Mac)
            );
            if !engine_matches {
                tracing::debug!(?node, ?class, "Chain node does not match its context");
                Err(DeviceStatus::BadCtx)?
            }

            let src = match node.source {
                EngineSource::Din => input.clone(),
                EngineSource::PrevOutput => prev.clone(),
            };
            let out = run_class(op, blob, &src)?;
            prev = if node.engine == EngineType::Aes {
                cipher_out = Some(out.clone());
                out
            } else {
                src
            };
        }

        if let Some(out) = cipher_out {
            data::scatter(&self.dma, dout, &out)?;
        }
        Ok(blobs)
    }

    fn rpc(&mut self, agent: u16, func: u16, params: &DataRef, memrefs: &[MemRefDesc]) -> DevResult<()> {
        let handler = self.agents.get(&agent).cloned().ok_or_else(|| {
            tracing::warn!(agent, "Unknown RPC agent");
            DeviceStatus::Unsup
        })?;

        let mut blob = data::gather(&self.dma, params)?;
        let mut buffers = memrefs
            .iter()
            .map(|m| {
                if m.dir.device_reads() {
                    data::gather(&self.dma, &m.data)
                } else {
                    data::capacity(&self.dma, &m.data).map(|len| vec![0; len])
                }
            })
            .collect::<DevResult<Vec<_>>>()?;

        let status = handler.call(func, &mut blob, &mut buffers);

        data::scatter(&self.dma, params, &blob)?;
        for (m, buf) in memrefs.iter().zip(&buffers) {
            if m.dir.device_writes() {
                data::scatter(&self.dma, &m.data, buf)?;
            }
        }
        status.into_result().map_err(|e| e.device_status())
    }

    fn read_block(&self, params: &DataRef) -> DevResult<WireParamBlock> {
        let raw = data::gather(&self.dma, params)?;
        WireParamBlock::read_from_bytes(&raw).map_err(|_| DeviceStatus::InvalDataSize)
    }

    fn decode_params(&self, block: &WireParamBlock) -> Option<Vec<AppletParam>> {
        let count = block.count as usize;
        let wire = block.params;
        wire.get(..count)?
            .iter()
            .map(|param| {
                let kind = param.kind;
                if kind == PARAM_KIND_NONE {
                    return Some(AppletParam::None);
                }

                let dir = ParamDir::from_raw(param.dir)?;
                match kind {
                    PARAM_KIND_VALUE => Some(AppletParam::Value {
                        dir,
                        a: param.a,
                        b: param.b,
                    }),
                    PARAM_KIND_MEMREF => {
                        let data_ref = param.data()?;
                        let size = param.size as usize;
                        let mut data = if dir.is_input() {
                            data::gather(&self.dma, &data_ref).ok()?
                        } else {
                            vec![0; size]
                        };
                        data.resize(size, 0);
                        Some(AppletParam::MemRef { dir, data, size })
                    }
                    _ => None,
                }
            })
            .collect()
    }

    fn encode_params(&self, block: &mut WireParamBlock, params: &[AppletParam]) -> DevResult<()> {
        let mut wire = block.params;
        for (slot, param) in wire.iter_mut().zip(params) {
            match param {
                AppletParam::Value { dir, a, b } if dir.is_output() => {
                    slot.a = *a;
                    slot.b = *b;
                }
                AppletParam::MemRef { dir, data, size } if dir.is_output() => {
                    let capacity = slot.size as usize;
                    if *size <= capacity {
                        let data_ref = slot.data().ok_or(DeviceStatus::InvalDoutPtr)?;
                        let len = (*size).min(data.len());
                        data::scatter(&self.dma, &data_ref, &data[..len])?;
                    }
                    slot.size = *size as u32;
                }
                _ => (),
            }
        }
        block.params = wire;
        Ok(())
    }

    fn finish_applet_call(
        &self,
        params: &DataRef,
        block: &mut WireParamBlock,
        list: &[AppletParam],
        ret_code: u32,
    ) -> DevResult<()> {
        block.ret_code = ret_code;
        block.ret_origin = RET_ORIGIN_APPLET;
        self.encode_params(block, list)?;
        data::scatter(&self.dma, params, block.as_bytes())
    }

    fn device_reject(&self, params: &DataRef, block: &mut WireParamBlock, code: u32) -> DevResult<()> {
        tracing::debug!(code, "Applet call rejected by device");
        block.ret_code = code;
        block.ret_origin = RET_ORIGIN_DEVICE;
        data::scatter(&self.dma, params, block.as_bytes())
    }

    fn applet_open(&mut self, app: &Uuid, params: &DataRef) -> DevResult<()> {
        let mut block = self.read_block(params)?;
        let Some(applet) = self.applets.get(app).cloned() else {
            tracing::warn!(%app, "Unknown applet");
            return self.device_reject(params, &mut block, RET_CODE_ITEM_NOT_FOUND);
        };
        let Some(mut list) = self.decode_params(&block) else {
            return self.device_reject(params, &mut block, RET_CODE_BAD_PARAMETERS);
        };

        let ret_code = match applet.open_session(&mut list) {
            Ok(value) => {
                let handle = self.next_handle;
                self.next_handle = self.next_handle.wrapping_add(1).max(1);
                self.sessions.insert(handle, AppletSession { applet, value });
                block.session = handle;
                tracing::debug!(%app, handle, "Applet session opened");
                0
            }
            Err(code) => code,
        };

        self.finish_applet_call(params, &mut block, &list, ret_code)
    }

    fn applet_invoke(&mut self, handle: u32, cmd: u32, params: &DataRef) -> DevResult<()> {
        let mut block = self.read_block(params)?;
        let Some(session) = self.sessions.get(&handle) else {
            return self.device_reject(params, &mut block, RET_CODE_BAD_STATE);
        };
        let (applet, value) = (session.applet.clone(), session.value);
        let Some(mut list) = self.decode_params(&block) else {
            return self.device_reject(params, &mut block, RET_CODE_BAD_PARAMETERS);
        };

        let ret_code = applet.invoke(value, cmd, &mut list);
        self.finish_applet_call(params, &mut block, &list, ret_code)
    }

    fn applet_close(&mut self, handle: u32) -> DevResult<()> {
        if let Some(session) = self.sessions.remove(&handle) {
            session.applet.close_session(session.value);
            tracing::debug!(handle, "Applet session closed");
        }
        Ok(())
    }
}
