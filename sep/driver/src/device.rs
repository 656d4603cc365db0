// Copyright (C) Microsoft Corporation. All rights reserved.

//! Device Context: the single owned state of one attached SeP.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use sep_interface::*;
use tracing::instrument;

use crate::cache::ContextCache;
use crate::client::Client;
use crate::config::DriverConfig;
use crate::mlli::MlliBuilder;
use crate::queue::DescQueue;

/// Host bytes a context needs besides its device blob: the input held back
/// for the next processing block.
fn host_overhead(class: AlgClass) -> usize {
    match class {
        AlgClass::SymCipher | AlgClass::AuthEnc => AES_BLOCK_SIZE,
        AlgClass::Mac | AlgClass::Hash => HashMode::Sha512.block_size(),
    }
}

pub(crate) struct DeviceInner {
    pub(crate) hw: Arc<dyn SepHw>,
    pub(crate) space: Arc<DmaSpace>,
    pub(crate) cache: ContextCache,
    pub(crate) queue: Arc<DescQueue>,
    pub(crate) mlli: MlliBuilder,
    pub(crate) config: DriverConfig,
    next_client: AtomicU32,
    next_seq: AtomicU64,
}

impl DeviceInner {
    /// Draws a UID that was never handed out before.
    pub(crate) fn next_uid(&self, owner: u32) -> ContextUid {
        ContextUid {
            owner,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.hw.detach_irq();
        tracing::debug!("SeP detached");
    }
}

/// An attached secure coprocessor.
///
/// Created once per device by [`SepDevice::attach`]. Work is issued through
/// the [`Client`] sessions it opens; clients keep the device state alive.
pub struct SepDevice {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for SepDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SepDevice")
            .field("info", &self.inner.hw.info())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl SepDevice {
    /// Attaches to a SeP.
    ///
    /// # Arguments
    /// * `hw` - The hardware
    /// * `config` - Host table sizes
    ///
    /// # Returns
    /// * `SepDevice` - The Device Context
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - The configuration or the reported hardware sizes are invalid
    /// * `HostError::Io` - The deferred-work thread could not be started
    #[instrument(name = "SepDevice::attach", skip(hw))]
    pub fn attach(hw: Arc<dyn SepHw>, config: DriverConfig) -> Result<Self, HostError> {
        config.validate()?;

        let info = hw.info();
        if info.ring_depth == 0 || info.cache_slots == 0 || info.cache_slots > u16::MAX as usize {
            tracing::error!(?info, "Unusable hardware properties");
            Err(HostError::InvalidArgument)?
        }

        let queue = Arc::new(DescQueue::new(hw.clone())?);
        let irq: Weak<dyn IrqHandler> = Arc::downgrade(&queue) as Weak<dyn IrqHandler>;
        hw.attach_irq(irq);

        let space = hw.dma().clone();
        tracing::debug!(?info, "SeP attached");

        Ok(Self {
            inner: Arc::new(DeviceInner {
                mlli: MlliBuilder::new(space.clone()),
                cache: ContextCache::new(info.cache_slots),
                hw,
                space,
                queue,
                config,
                next_client: AtomicU32::new(1),
                next_seq: AtomicU64::new(1),
            }),
        })
    }

    /// Opens a client session.
    pub fn open_client(&self) -> Client {
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        Client::new(self.inner.clone(), id)
    }

    /// Waits until every accepted descriptor completed and every completion callback ran.
    pub fn drain(&self) {
        self.inner.queue.drain();
    }

    /// Returns the context storage size for an algorithm class.
    ///
    /// # Arguments
    /// * `class_id` - Raw [`AlgClass`] value
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - Unknown class
    pub fn context_size(&self, class_id: u32) -> Result<usize, HostError> {
        let class = AlgClass::try_from(class_id).map_err(|err| {
            tracing::error!(class_id, "Context size query for an unknown class");
            err
        })?;
        Ok(ctx_blob_size(class) + host_overhead(class))
    }

    /// Returns the contexts the host believes resident, by slot.
    pub fn cache_residents(&self) -> Vec<(u16, ContextUid)> {
        self.inner.cache.residents()
    }

    /// Returns the hardware properties.
    pub fn info(&self) -> HwInfo {
        self.inner.hw.info()
    }

    /// Returns the number of live DMA mappings.
    pub fn dma_mappings(&self) -> usize {
        self.inner.space.mapping_count()
    }
}
