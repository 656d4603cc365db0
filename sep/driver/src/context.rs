// Copyright (C) Microsoft Corporation. All rights reserved.

//! Crypto context manager.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use sep_interface::*;

/// Lifecycle state of a [`CryptoContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxState {
    /// No usable state
    Uninitialized,

    /// Properties are recorded; device initialization waits for the first processing call
    PartialInit,

    /// Ready for processing
    Initialized,
}

impl CtxState {
    fn to_raw(self) -> u32 {
        match self {
            CtxState::Uninitialized => 0,
            CtxState::PartialInit => 1,
            CtxState::Initialized => 2,
        }
    }
}

/// Host side algorithm parameters recorded at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtxKind {
    SymCipher {
        mode: CipherMode,
    },
    AuthEnc {
        direction: CryptoDirection,
        tag_len: usize,
        adata_len: usize,
        text_len: usize,
    },
    Mac(MacMode),
    Hash(HashMode),
}

impl CtxKind {
    /// Processing granularity of block-oriented input.
    pub(crate) fn block_size(&self) -> usize {
        match self {
            CtxKind::SymCipher { .. } | CtxKind::AuthEnc { .. } => AES_BLOCK_SIZE,
            CtxKind::Mac(mode) => mode.block_size(),
            CtxKind::Hash(mode) => mode.block_size(),
        }
    }
}

pub(crate) struct CtxInner {
    owner: u32,
    class: AlgClass,
    uid: Option<ContextUid>,
    kind: Option<CtxKind>,
    state: CtxState,
    blob: HostBuffer,
    mapped: bool,

    /// Input bytes short of a processing block, prepended to the next call
    pub(crate) remainder: Vec<u8>,
}

impl CtxInner {
    pub(crate) fn class(&self) -> AlgClass {
        self.class
    }

    pub(crate) fn uid(&self) -> Option<ContextUid> {
        self.uid
    }

    /// Returns the recorded parameters if the state is one of `allowed`.
    ///
    /// # Error
    /// * `DeviceStatus::BadCtx` - The state does not allow the operation
    pub(crate) fn expect(&self, allowed: &[CtxState]) -> SepResult<CtxKind> {
        match self.kind {
            Some(kind) if allowed.contains(&self.state) => Ok(kind),
            _ => {
                tracing::error!(state = ?self.state, ?allowed, uid = ?self.uid, "Context state does not allow the operation");
                Err(SepError::Device(DeviceStatus::BadCtx))
            }
        }
    }

    /// Starts a new lifetime of the context.
    ///
    /// Draws nothing itself: the caller passes the fresh UID. The header and
    /// `body` are written to the blob.
    ///
    /// # Returns
    /// The UID of the previous lifetime, which the caller must invalidate.
    ///
    /// # Error
    /// * `DeviceStatus::BadCtx` - The body class differs from the context class
    pub(crate) fn begin<T: CtxBody>(
        &mut self,
        uid: ContextUid,
        kind: CtxKind,
        mode: u32,
        body: &T,
        state: CtxState,
    ) -> SepResult<Option<ContextUid>> {
        if T::CLASS != self.class {
            tracing::error!(ctx_class = ?self.class, requested = ?T::CLASS, "Context class mismatch");
            Err(SepError::Device(DeviceStatus::BadCtx))?
        }

        let header = SepCtxHeader {
            alg: self.class as u32,
            mode,
            uid_owner: uid.owner,
            host_state: state.to_raw(),
            uid_seq: uid.seq,
        };
        let written = self.blob.with_mut(|blob| {
            blob.fill(0);
            header.write(blob) && body.write(blob)
        });
        if !written {
            tracing::error!(class = ?self.class, "Context blob too small");
            Err(SepError::Device(DeviceStatus::BadCtx))?
        }

        let previous = self.uid.replace(uid);
        self.kind = Some(kind);
        self.state = state;
        self.remainder.clear();
        Ok(previous)
    }

    pub(crate) fn set_state(&mut self, state: CtxState) {
        self.state = state;
    }

    /// Ends the current lifetime. Returns the UID to invalidate.
    pub(crate) fn retire(&mut self) -> Option<ContextUid> {
        self.state = CtxState::Uninitialized;
        self.remainder.clear();
        self.uid.take()
    }

    /// Reads the class body from the blob.
    pub(crate) fn body<T: CtxBody>(&self) -> Option<T> {
        T::read(&self.blob.to_vec())
    }
}

/// Host representation of one algorithm context.
///
/// Cloning yields another handle to the same context. A context belongs to
/// the client that created it and may be used by one operation at a time;
/// a second concurrent operation fails with `HostError::Busy`.
#[derive(Clone)]
pub struct CryptoContext(Arc<Mutex<CtxInner>>);

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.lock();
        f.debug_struct("CryptoContext")
            .field("class", &inner.class)
            .field("uid", &inner.uid)
            .field("state", &inner.state)
            .finish()
    }
}

impl CryptoContext {
    pub(crate) fn new(owner: u32, class: AlgClass) -> Self {
        Self(Arc::new(Mutex::new(CtxInner {
            owner,
            class,
            uid: None,
            kind: None,
            state: CtxState::Uninitialized,
            blob: HostBuffer::new(ctx_blob_size(class)),
            mapped: false,
            remainder: Vec::new(),
        })))
    }

    /// Returns the algorithm class.
    pub fn class(&self) -> AlgClass {
        self.0.lock().class
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> CtxState {
        self.0.lock().state
    }

    /// Returns the UID of the current lifetime, if initialized.
    pub fn uid(&self) -> Option<ContextUid> {
        self.0.lock().uid
    }

    pub(crate) fn same(&self, other: &CryptoContext) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.0.lock()
    }

    /// Pins the context for one operation.
    ///
    /// # Arguments
    /// * `owner` - Client performing the operation
    /// * `space` - Address space to map the blob into
    ///
    /// # Error
    /// * `HostError::Busy` - Another operation has the context mapped
    /// * `HostError::BadPointer` - The blob could not be mapped
    /// * `DeviceStatus::BadCtx` - The context belongs to another client
    pub(crate) fn map(&self, owner: u32, space: &Arc<DmaSpace>) -> SepResult<MappedContext> {
        let mut inner = self.0.lock();
        if inner.owner != owner {
            tracing::error!(owner = inner.owner, caller = owner, "Context used by a foreign client");
            Err(SepError::Device(DeviceStatus::BadCtx))?
        }
        if inner.mapped {
            tracing::debug!(uid = ?inner.uid, "Context already mapped");
            Err(HostError::Busy)?
        }

        let addr = space
            .map(&inner.blob, 0, inner.blob.len(), DmaDirection::Bidirectional)
            .map_err(|err| {
                tracing::error!(?err, "Failed to map context blob");
                HostError::BadPointer
            })?;
        inner.mapped = true;

        Ok(MappedContext {
            ctx: self.clone(),
            space: space.clone(),
            addr,
        })
    }
}

/// A context pinned for one operation. Dropping it unmaps the context.
pub(crate) struct MappedContext {
    ctx: CryptoContext,
    space: Arc<DmaSpace>,
    addr: DmaAddr,
}

impl MappedContext {
    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.ctx.0.lock()
    }

    /// Returns the UID and blob address a descriptor refers to.
    pub(crate) fn binding(&self) -> Option<(ContextUid, DmaAddr)> {
        self.lock().uid.map(|uid| (uid, self.addr))
    }
}

impl Drop for MappedContext {
    fn drop(&mut self) {
        if let Err(err) = self.space.unmap(self.addr) {
            tracing::error!(?err, addr = %self.addr, "Failed to unmap context blob");
        }

        let mut inner = self.ctx.0.lock();
        let state = inner.state.to_raw();
        inner.blob.with_mut(|blob| {
            if let Some(mut header) = SepCtxHeader::read(blob) {
                header.host_state = state;
                header.write(blob);
            }
        });
        inner.mapped = false;
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;
    use zerocopy::FromZeros;

    use super::*;

    fn uid(seq: u64) -> ContextUid {
        ContextUid { owner: 7, seq }
    }

    #[test]
    fn test_map_is_exclusive() {
        let space = Arc::new(DmaSpace::new());
        let ctx = CryptoContext::new(7, AlgClass::Hash);

        let mapped = ctx.map(7, &space).unwrap();
        assert_eq!(
            ctx.map(7, &space).err(),
            Some(SepError::Host(HostError::Busy))
        );
        drop(mapped);
        assert_eq!(space.mapping_count(), 0);
        assert!(ctx.map(7, &space).is_ok());
    }

    #[test]
    fn test_foreign_client_is_rejected() {
        let space = Arc::new(DmaSpace::new());
        let ctx = CryptoContext::new(7, AlgClass::Hash);
        assert_eq!(
            ctx.map(8, &space).err(),
            Some(SepError::Device(DeviceStatus::BadCtx))
        );
    }

    #[test]
    fn test_begin_writes_header_and_rotates_uid() {
        let ctx = CryptoContext::new(7, AlgClass::Hash);
        let mut inner = ctx.lock();
        let kind = CtxKind::Hash(HashMode::Sha256);
        let body = HashCtx::new_zeroed();

        let previous = inner
            .begin(uid(1), kind, HashMode::Sha256 as u32, &body, CtxState::Initialized)
            .unwrap();
        assert_eq!(previous, None);

        let header = SepCtxHeader::read(&inner.blob.to_vec()).unwrap();
        assert_eq!(header.uid(), uid(1));
        assert_eq!({ header.alg }, AlgClass::Hash as u32);

        let previous = inner
            .begin(uid(2), kind, HashMode::Sha256 as u32, &body, CtxState::Initialized)
            .unwrap();
        assert_eq!(previous, Some(uid(1)));
        assert_eq!(inner.retire(), Some(uid(2)));
        assert_eq!(inner.state, CtxState::Uninitialized);
    }

    #[test]
    fn test_class_mismatch_is_bad_ctx() {
        let ctx = CryptoContext::new(7, AlgClass::SymCipher);
        let result = ctx.lock().begin(
            uid(1),
            CtxKind::Hash(HashMode::Sha1),
            HashMode::Sha1 as u32,
            &HashCtx::new_zeroed(),
            CtxState::Initialized,
        );
        assert_eq!(result, Err(SepError::Device(DeviceStatus::BadCtx)));
    }

    #[test]
    fn test_state_check() {
        let ctx = CryptoContext::new(7, AlgClass::Hash);
        let mut inner = ctx.lock();
        assert!(inner.expect(&[CtxState::Initialized]).is_err());

        inner
            .begin(
                uid(1),
                CtxKind::Hash(HashMode::Sha1),
                HashMode::Sha1 as u32,
                &HashCtx::new_zeroed(),
                CtxState::Initialized,
            )
            .unwrap();
        assert_eq!(
            inner.expect(&[CtxState::Initialized]).unwrap(),
            CtxKind::Hash(HashMode::Sha1)
        );
        inner.set_state(CtxState::Uninitialized);
        assert!(inner.expect(&[CtxState::Initialized, CtxState::PartialInit]).is_err());
    }

    #[test]
    fn test_unmap_records_host_state() {
        let space = Arc::new(DmaSpace::new());
        let ctx = CryptoContext::new(7, AlgClass::Hash);
        ctx.lock()
            .begin(
                uid(1),
                CtxKind::Hash(HashMode::Sha1),
                HashMode::Sha1 as u32,
                &HashCtx::new_zeroed(),
                CtxState::Initialized,
            )
            .unwrap();

        let mapped = ctx.map(7, &space).unwrap();
        mapped.lock().set_state(CtxState::Uninitialized);
        drop(mapped);

        let header = SepCtxHeader::read(&ctx.lock().blob.to_vec()).unwrap();
        assert_eq!({ header.host_state }, 0);
    }
}
