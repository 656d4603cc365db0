// Copyright (C) Microsoft Corporation. All rights reserved.

//! Generic remote procedure call.

use sep_interface::*;
use tracing::instrument;

use super::*;
use crate::client::Client;
use crate::dma_registry::MemRefHold;
use crate::dma_registry::MemRefId;
use crate::mlli::Source;

impl Client {
    /// Calls function `func` of device agent `agent`.
    ///
    /// The parameter blob travels to the device and is copied back with the
    /// agent's updates. Each memory reference is passed with the direction it
    /// was registered with and stays acquired for the duration of the call.
    ///
    /// # Arguments
    /// * `agent` - Agent identifier
    /// * `func` - Function identifier
    /// * `params` - Opaque parameter blob, updated in place on success
    /// * `memrefs` - Registered memory references
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - Too many memory references or an
    ///   oversized parameter blob
    /// * `HostError::BadPointer` - A stale memory reference
    /// * `DeviceStatus::Unsup` - No such agent
    #[instrument(skip_all, fields(client = self.inner.id, agent, func, memrefs = memrefs.len()))]
    pub fn rpc(&self, agent: u16, func: u16, params: &mut [u8], memrefs: &[MemRefId]) -> SepResult<()> {
        let inner = &self.inner;
        let config = &inner.device.config;
        if memrefs.len() > config.max_rpc_memrefs || params.len() > config.max_rpc_params {
            tracing::error!(
                memrefs = memrefs.len(),
                params = params.len(),
                "RPC request exceeds the configured limits"
            );
            Err(HostError::InvalidArgument)?
        }

        let mut res = inner.begin_op()?;
        let mut descs = Vec::with_capacity(memrefs.len());
        for id in memrefs {
            let hold = MemRefHold::acquire(&inner.registry, *id)?;
            let table = inner.device.mlli.create_simple(Source::whole(hold.object()))?;
            descs.push(MemRefDesc {
                dir: hold.object().dir(),
                data: res.hold_table(table),
            });
            res.memrefs.push(hold);
        }

        let blob = HostBuffer::from_slice(params);
        let data = inner.map_simple(&mut res, &BufRange::from(&blob), DmaDirection::Bidirectional)?;
        let plan = Plan::Raw(Descriptor::Rpc {
            agent,
            func,
            params: data,
            memrefs: descs,
        });
        inner.execute(res, plan, |_, _| Ok(()))?;

        params.copy_from_slice(&blob.to_vec());
        Ok(())
    }
}
