// Copyright (C) Microsoft Corporation. All rights reserved.

//! Per-operation resources and the coupled allocate-and-submit transaction.

use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use sep_interface::*;

use crate::cache::CacheTable;
use crate::cache::Invalidate;
use crate::context::MappedContext;
use crate::dma_registry::DmaObject;
use crate::dma_registry::MemRefHold;
use crate::mlli::MlliTable;
use crate::queue::DescQueue;
use crate::queue::Keepalive;
use crate::queue::Waiter;

/// Count of a client's operations that still hold resources.
#[derive(Debug, Default)]
pub(crate) struct Inflight {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Inflight {
    pub(crate) fn enter(self: &Arc<Self>) -> InflightGuard {
        *self.count.lock() += 1;
        InflightGuard(self.clone())
    }

    /// Blocks until every guard was dropped.
    pub(crate) fn wait_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

#[derive(Debug)]
pub(crate) struct InflightGuard(Arc<Inflight>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.cond.notify_all();
        }
    }
}

/// Everything the device may touch while an operation is outstanding.
///
/// Fields drop in declaration order: contexts are unmapped before tables and
/// the buffers behind them, and the in-flight count is released last.
#[derive(Default)]
pub(crate) struct OpResources {
    pub(crate) ctxs: Vec<MappedContext>,
    pub(crate) tables: Vec<Arc<MlliTable>>,
    pub(crate) objects: Vec<DmaObject>,
    pub(crate) memrefs: Vec<MemRefHold>,
    /// Held only to release the client's in-flight count on drop
    _inflight: Option<InflightGuard>,
}

impl OpResources {
    pub(crate) fn new(inflight: InflightGuard) -> Self {
        Self {
            _inflight: Some(inflight),
            ..Default::default()
        }
    }

    /// Returns the (UID, blob address) pairs of the mapped contexts.
    pub(crate) fn bindings(&self) -> Result<Vec<(ContextUid, DmaAddr)>, HostError> {
        self.ctxs
            .iter()
            .map(|ctx| ctx.binding().ok_or(HostError::InvalidArgument))
            .collect()
    }

    /// Keeps `table` alive for the operation and returns its device reference.
    pub(crate) fn hold_table(&mut self, table: Arc<MlliTable>) -> DataRef {
        let data_ref = table.data_ref();
        self.tables.push(table);
        data_ref
    }
}

/// What to submit once the contexts are bound to cache slots.
#[derive(Debug, Clone)]
pub(crate) enum Plan {
    /// One crypto descriptor against the first context
    Crypto {
        op: CryptoOp,
        din: DataRef,
        dout: DataRef,
    },

    /// A combined chain over every context
    Combined {
        scheme: CombinedScheme,
        din: DataRef,
        dout: DataRef,
        finalize: bool,
    },

    /// A descriptor that uses no context
    Raw(Descriptor),
}

impl Plan {
    /// Produces the descriptors for the bound contexts, in submission order.
    ///
    /// A combined chain with a context to load gets an explicit load
    /// descriptor first; the chain itself then runs on resident contexts.
    pub(crate) fn descriptors(self, refs: &[CtxRef]) -> Result<Vec<Descriptor>, HostError> {
        match self {
            Plan::Crypto { op, din, dout } => {
                let ctx = *refs.first().ok_or(HostError::InvalidArgument)?;
                Ok(vec![Descriptor::Crypto { op, ctx, din, dout }])
            }
            Plan::Combined {
                scheme,
                din,
                dout,
                finalize,
            } => {
                let combined = |ctxs: Vec<CtxRef>| Descriptor::Combined {
                    scheme,
                    ctxs,
                    din,
                    dout,
                    finalize,
                };
                if refs.iter().any(|r| r.load) {
                    let resident: Vec<CtxRef> = refs.iter().map(|r| CtxRef { load: false, ..*r }).collect();
                    Ok(vec![
                        Descriptor::Load {
                            ctxs: refs.to_vec(),
                        },
                        combined(resident),
                    ])
                } else {
                    Ok(vec![combined(refs.to_vec())])
                }
            }
            Plan::Raw(desc) => Ok(vec![desc]),
        }
    }
}

/// Slot allocation and descriptor submission under the cache lock.
///
/// Every slot handed out by [`SubmitTxn::bind`] stays pinned until the
/// transaction ends, so the descriptors of one operation never evict each
/// other's contexts. [`SubmitTxn::rollback`] is the only undo path: it
/// invalidates what was accepted and clears the bound slots.
pub(crate) struct SubmitTxn<'a> {
    cache: MutexGuard<'a, CacheTable>,
    queue: &'a DescQueue,
    pinned: Vec<u16>,
    uids: Vec<ContextUid>,
    accepted: Vec<Cookie>,
}

impl<'a> SubmitTxn<'a> {
    pub(crate) fn begin(cache: MutexGuard<'a, CacheTable>, queue: &'a DescQueue) -> Self {
        Self {
            cache,
            queue,
            pinned: Vec::new(),
            uids: Vec::new(),
            accepted: Vec::new(),
        }
    }

    /// Places a context in a cache slot.
    pub(crate) fn bind(&mut self, (uid, addr): (ContextUid, DmaAddr)) -> Result<CtxRef, HostError> {
        let (slot, load) = self.cache.allocate(uid, &self.pinned)?;
        self.pinned.push(slot);
        self.uids.push(uid);
        Ok(CtxRef {
            slot,
            addr,
            uid,
            load,
        })
    }

    pub(crate) fn submit(
        &mut self,
        desc: Descriptor,
        waiter: Waiter,
        allow_backlog: bool,
    ) -> Result<(), HostError> {
        let cookie = self.queue.enqueue(desc, Some(waiter), allow_backlog)?;
        self.accepted.push(cookie);
        Ok(())
    }

    /// Undoes a partially submitted operation.
    ///
    /// Accepted descriptors are invalidated; the last one keeps `keepalive`
    /// until the device is done with it. Every bound context is evicted.
    pub(crate) fn rollback(mut self, keepalive: Keepalive) {
        for uid in &self.uids {
            self.cache.invalidate(Invalidate::Uid(*uid));
        }

        let mut keepalive = Some(keepalive);
        while let Some(cookie) = self.accepted.pop() {
            tracing::warn!(%cookie, "Rolling back accepted descriptor");
            match keepalive.take() {
                Some(keepalive) => self.queue.invalidate(cookie, keepalive),
                None => self.queue.invalidate(cookie, Box::new(())),
            }
        }
    }

    pub(crate) fn commit(self) {}
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    fn ctx_ref(seq: u64, load: bool) -> CtxRef {
        CtxRef {
            slot: seq as u16,
            addr: DmaAddr(0x1000 * seq),
            uid: ContextUid { owner: 1, seq },
            load,
        }
    }

    fn scheme() -> CombinedScheme {
        CombinedScheme::encode(&[
            ChainNode {
                engine: EngineType::Aes,
                source: EngineSource::Din,
            },
            ChainNode {
                engine: EngineType::Hash,
                source: EngineSource::PrevOutput,
            },
        ])
        .unwrap()
    }

    fn combined() -> Plan {
        Plan::Combined {
            scheme: scheme(),
            din: DataRef::Null,
            dout: DataRef::Null,
            finalize: false,
        }
    }

    #[test]
    fn test_resident_chain_is_one_descriptor() {
        let descs = combined()
            .descriptors(&[ctx_ref(1, false), ctx_ref(2, false)])
            .unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].name(), "combined");
    }

    #[test]
    fn test_chain_with_load_is_two_descriptors() {
        let refs = [ctx_ref(1, false), ctx_ref(2, true)];
        let descs = combined().descriptors(&refs).unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0], Descriptor::Load { ctxs: refs.to_vec() });
        match &descs[1] {
            Descriptor::Combined { ctxs, .. } => assert!(ctxs.iter().all(|c| !c.load)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_crypto_needs_a_context() {
        let plan = Plan::Crypto {
            op: CryptoOp::Init,
            din: DataRef::Null,
            dout: DataRef::Null,
        };
        assert_eq!(plan.descriptors(&[]), Err(HostError::InvalidArgument));
    }

    #[test]
    fn test_inflight_guard_counts() {
        let inflight = Arc::new(Inflight::default());
        let a = inflight.enter();
        let b = inflight.enter();
        assert_eq!(*inflight.count.lock(), 2);
        drop(a);
        drop(b);
        inflight.wait_zero();
    }
}
