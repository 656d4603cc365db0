// Copyright (C) Microsoft Corporation. All rights reserved.

//! Client sessions.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use sep_interface::*;
use tracing::instrument;

use crate::applet::SessionTable;
use crate::cache::Invalidate;
use crate::context::CryptoContext;
use crate::context::MappedContext;
use crate::device::DeviceInner;
use crate::dma_registry::DmaRegistry;
use crate::dma_registry::MemRefId;
use crate::op::Inflight;
use crate::op::OpResources;
use crate::op::Plan;
use crate::op::SubmitTxn;
use crate::queue::OpTracker;
use crate::queue::Waiter;

/// A byte range of a host buffer handed to an operation.
#[derive(Debug, Clone, Copy)]
pub struct BufRange<'a> {
    /// Buffer
    pub buf: &'a HostBuffer,

    /// Start of the range
    pub offset: usize,

    /// Length of the range
    pub len: usize,
}

impl<'a> BufRange<'a> {
    /// Creates a range.
    pub fn new(buf: &'a HostBuffer, offset: usize, len: usize) -> Self {
        Self { buf, offset, len }
    }

    /// An empty range.
    pub fn empty(buf: &'a HostBuffer) -> Self {
        Self {
            buf,
            offset: 0,
            len: 0,
        }
    }

    /// Returns true if both describe exactly the same bytes.
    pub fn same_as(&self, other: &BufRange<'_>) -> bool {
        HostBuffer::ptr_eq(self.buf, other.buf) && self.offset == other.offset && self.len == other.len
    }

    /// Copies the bytes out of the buffer.
    pub(crate) fn read(&self) -> Result<Vec<u8>, HostError> {
        self.buf.read_at(self.offset, self.len).ok_or_else(|| {
            tracing::error!(offset = self.offset, len = self.len, "Range outside its buffer");
            HostError::BadPointer
        })
    }
}

impl<'a> From<&'a HostBuffer> for BufRange<'a> {
    fn from(buf: &'a HostBuffer) -> Self {
        Self {
            buf,
            offset: 0,
            len: buf.len(),
        }
    }
}

/// Completion callback of an asynchronous operation.
pub type Callback<T> = Box<dyn FnOnce(SepResult<T>) + Send>;

/// Result post-processing run once the device reported success.
pub(crate) type PostFn<T> = Box<dyn FnOnce(&ClientInner, &mut OpResources) -> SepResult<T> + Send>;

/// Post-processing of operations without a result.
pub(crate) fn no_result(_: &ClientInner, _: &mut OpResources) -> SepResult<()> {
    Ok(())
}

pub(crate) struct ClientInner {
    pub(crate) id: u32,
    pub(crate) device: Arc<DeviceInner>,
    pub(crate) registry: Arc<DmaRegistry>,
    pub(crate) sessions: SessionTable,
    pub(crate) inflight: Arc<Inflight>,
    closed: AtomicBool,
}

fn stage(
    txn: &mut SubmitTxn<'_>,
    tracker: &Arc<OpTracker>,
    bindings: &[(ContextUid, DmaAddr)],
    plan: Plan,
    allow_backlog: bool,
) -> Result<(), HostError> {
    let refs = bindings
        .iter()
        .map(|binding| txn.bind(*binding))
        .collect::<Result<Vec<_>, _>>()?;

    let descs = plan.descriptors(&refs)?;
    let last = descs.len().saturating_sub(1);
    for (i, desc) in descs.into_iter().enumerate() {
        let waiter = if i == last {
            Waiter::Last(tracker.clone())
        } else {
            Waiter::Step(tracker.clone())
        };
        txn.submit(desc, waiter, allow_backlog)?;
    }
    Ok(())
}

impl ClientInner {
    /// Starts an operation on behalf of this client.
    ///
    /// # Error
    /// * `HostError::BadPointer` - The client was closed
    pub(crate) fn begin_op(&self) -> SepResult<OpResources> {
        let res = OpResources::new(self.inflight.enter());
        if self.closed.load(Ordering::SeqCst) {
            tracing::error!(client = self.id, "Operation on a closed client");
            Err(HostError::BadPointer)?
        }
        Ok(res)
    }

    /// Maps a context into `res`.
    pub(crate) fn map_ctx(&self, res: &mut OpResources, ctx: &CryptoContext) -> SepResult<()> {
        let mapped = ctx.map(self.id, &self.device.space)?;
        res.ctxs.push(mapped);
        Ok(())
    }

    /// Ends a context's lifetime and drops it from the cache.
    pub(crate) fn retire(&self, ctx: &MappedContext) {
        let uid = ctx.lock().retire();
        if let Some(uid) = uid {
            self.device.cache.invalidate(Invalidate::Uid(uid));
        }
    }

    pub(crate) fn invalidate_uid(&self, uid: Option<ContextUid>) {
        if let Some(uid) = uid {
            self.device.cache.invalidate(Invalidate::Uid(uid));
        }
    }

    /// Binds the contexts and submits the plan's descriptors as one unit.
    fn submit(
        &self,
        tracker: &Arc<OpTracker>,
        bindings: &[(ContextUid, DmaAddr)],
        plan: Plan,
        allow_backlog: bool,
    ) -> SepResult<()> {
        let device = &self.device;
        let mut txn = SubmitTxn::begin(device.cache.lock(), &device.queue);

        match stage(&mut txn, tracker, bindings, plan, allow_backlog) {
            Ok(()) => {
                txn.commit();
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = ?err, client = self.id, "Submission failed");
                txn.rollback(Box::new(tracker.clone()));
                Err(err)?
            }
        }
    }

    /// Applies the device outcome to the contexts of a finished operation.
    ///
    /// A device failure leaves every involved context uninitialized and out of
    /// the cache; `post` only runs on success.
    fn complete_op<T>(
        &self,
        status: DeviceStatus,
        res: &mut OpResources,
        post: impl FnOnce(&ClientInner, &mut OpResources) -> SepResult<T>,
    ) -> SepResult<T> {
        if !status.is_none() {
            for ctx in &res.ctxs {
                self.retire(ctx);
            }
            tracing::warn!(%status, client = self.id, "Operation failed on the device");
            Err(SepError::Device(status))?
        }
        post(self, res)
    }

    /// Submits and blocks until the operation completed.
    ///
    /// Synchronous callers may always wait in the backlog.
    pub(crate) fn execute<T>(
        &self,
        res: OpResources,
        plan: Plan,
        post: impl FnOnce(&ClientInner, &mut OpResources) -> SepResult<T>,
    ) -> SepResult<T> {
        let bindings = res.bindings()?;
        let tracker = Arc::new(OpTracker::new(res));
        self.submit(&tracker, &bindings, plan, true)?;

        let (status, mut res) = tracker.wait();
        self.complete_op(status, &mut res, post)
    }

    /// Reports an asynchronous operation that needed no device work.
    pub(crate) fn complete_now<T: Send + 'static>(&self, callback: Callback<T>, result: SepResult<T>) {
        self.device
            .queue
            .work()
            .schedule(Box::new(move || callback(result)));
    }

    /// Submits and returns once the descriptors were accepted.
    ///
    /// `post` and `callback` run on the deferred-work thread after completion.
    pub(crate) fn execute_async<T: 'static>(
        self: &Arc<Self>,
        res: OpResources,
        plan: Plan,
        may_backlog: bool,
        post: PostFn<T>,
        callback: Callback<T>,
    ) -> SepResult<()> {
        let bindings = res.bindings()?;
        let client = self.clone();
        let tracker = Arc::new(OpTracker::with_continuation(
            res,
            Box::new(move |status, mut res| {
                let result = client.complete_op(status, &mut res, post);
                drop(res);
                callback(result);
            }),
        ));
        self.submit(&tracker, &bindings, plan, may_backlog)
    }
}

/// A client session of a [`crate::SepDevice`].
///
/// Owns its memory references, applet sessions and contexts. Closing the
/// client (explicitly or by dropping it) waits for its outstanding
/// operations and reclaims all of them.
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.inner.id).finish()
    }
}

impl Client {
    pub(crate) fn new(device: Arc<DeviceInner>, id: u32) -> Self {
        let config = device.config;
        let registry = Arc::new(DmaRegistry::new(device.space.clone(), config.memref_slots));
        Self {
            inner: Arc::new(ClientInner {
                id,
                device,
                registry,
                sessions: SessionTable::new(config.session_slots),
                inflight: Arc::new(Inflight::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the client identity, the owner half of its context UIDs.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Creates an uninitialized context of `class` owned by this client.
    pub fn new_context(&self, class: AlgClass) -> CryptoContext {
        CryptoContext::new(self.inner.id, class)
    }

    /// Registers a buffer range for device access.
    ///
    /// # Arguments
    /// * `range` - Buffer range
    /// * `dir` - Access the device is granted
    ///
    /// # Returns
    /// * `MemRefId` - Handle holding one reference
    ///
    /// # Error
    /// * `HostError::NoResource` - The registry is full
    /// * `HostError::BadPointer` - The range lies outside the buffer
    /// * `HostError::InvalidArgument` - Empty range
    #[instrument(skip_all, fields(client = self.inner.id, len = range.len))]
    pub fn register_memref(&self, range: BufRange<'_>, dir: DmaDirection) -> SepResult<MemRefId> {
        let _res = self.inner.begin_op()?;
        Ok(self
            .inner
            .registry
            .register(dir, range.buf, range.offset, range.len)?)
    }

    /// Takes an additional reference on a memory reference.
    pub fn memref_acquire(&self, id: MemRefId) -> SepResult<()> {
        self.inner.registry.acquire(id)?;
        Ok(())
    }

    /// Drops a reference taken with [`Client::memref_acquire`].
    pub fn memref_release(&self, id: MemRefId) {
        self.inner.registry.release(id);
    }

    /// Unregisters a memory reference.
    ///
    /// # Error
    /// * `HostError::Busy` - References beyond the creator's are outstanding
    /// * `HostError::BadPointer` - Stale handle
    #[instrument(skip(self), fields(client = self.inner.id))]
    pub fn free_memref(&self, id: MemRefId) -> SepResult<()> {
        Ok(self.inner.registry.free(id)?)
    }

    /// Returns the number of registered memory references.
    pub fn memrefs_in_use(&self) -> usize {
        self.inner.registry.in_use()
    }

    /// Ends the session.
    ///
    /// Waits for the client's outstanding operations, closes its applet
    /// sessions on the device, frees its memory references and evicts its
    /// contexts from the cache. Later operations fail with
    /// `HostError::BadPointer`. Must not be called from a completion callback.
    #[instrument(skip(self), fields(client = self.inner.id))]
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.inflight.wait_zero();

        for (session, handle) in inner.sessions.take_all() {
            let res = OpResources::new(inner.inflight.enter());
            let result = inner.execute(res, Plan::Raw(Descriptor::AppletClose { handle }), |_, _| Ok(()));
            if let Err(err) = result {
                tracing::error!(error = ?err, %session, "Failed to close applet session");
            }
        }

        let freed = inner.registry.free_all();
        let evicted = inner.device.cache.invalidate(Invalidate::Owner(inner.id));
        tracing::debug!(freed, evicted, "Client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
