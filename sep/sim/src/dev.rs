// Copyright (C) Microsoft Corporation. All rights reserved.

//! Simulated SeP device.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::thread::JoinHandle;

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::RwLock;
use sep_interface::*;
use tracing::instrument;
use uuid::Uuid;

use crate::applet::Applet;
use crate::applet::RpcAgent;
use crate::engine::Engine;
use crate::SimConfig;

#[derive(Default)]
struct Ring {
    entries: VecDeque<(Cookie, Descriptor)>,
    paused: bool,
    busy: bool,
    shutdown: bool,
}

struct SimInner {
    config: SimConfig,
    dma: Arc<DmaSpace>,
    ring: Mutex<Ring>,
    ring_cond: Condvar,
    completions: Mutex<VecDeque<CompletionRecord>>,
    irq: RwLock<Option<Weak<dyn IrqHandler>>>,
    engine: Mutex<Engine>,
}

impl SimInner {
    fn run(&self) {
        loop {
            let (cookie, desc) = {
                let mut ring = self.ring.lock();
                loop {
                    if ring.shutdown {
                        return;
                    }
                    if !ring.paused {
                        if let Some(entry) = ring.entries.pop_front() {
                            ring.busy = true;
                            break entry;
                        }
                    }
                    self.ring_cond.wait(&mut ring);
                }
            };

            let status = self.engine.lock().execute(&desc);
            tracing::trace!(%cookie, desc = desc.name(), %status, "Descriptor executed");
            self.completions
                .lock()
                .push_back(CompletionRecord { cookie, status });

            {
                let mut ring = self.ring.lock();
                ring.busy = false;
                self.ring_cond.notify_all();
            }

            let handler = self.irq.read().as_ref().and_then(Weak::upgrade);
            if let Some(handler) = handler {
                handler.interrupt();
            }
        }
    }
}

/// Software SeP executing descriptors on a worker thread.
pub struct SimDevice {
    inner: Arc<SimInner>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDevice")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl SimDevice {
    /// Creates a device and starts its worker thread.
    ///
    /// # Arguments
    /// * `config` - Ring depth and cache size
    ///
    /// # Returns
    /// * `SimDevice` - The device
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - A configured size is zero or the slot count does not fit a slot index
    /// * `HostError::Io` - The worker thread could not be spawned
    #[instrument(name = "SimDevice::new")]
    pub fn new(config: SimConfig) -> Result<Self, HostError> {
        config.validate()?;

        let dma = Arc::new(DmaSpace::new());
        let inner = Arc::new(SimInner {
            config,
            dma: dma.clone(),
            ring: Mutex::new(Ring::default()),
            ring_cond: Condvar::new(),
            completions: Mutex::new(VecDeque::new()),
            irq: RwLock::new(None),
            engine: Mutex::new(Engine::new(dma, config.cache_slots)),
        });

        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("sep-sim".into())
            .spawn(move || worker_inner.run())
            .map_err(|err| {
                tracing::error!(error = ?err, "Failed to spawn SeP worker");
                HostError::Io
            })?;

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// Registers an applet under `id`.
    pub fn register_applet(&self, id: Uuid, applet: Arc<dyn Applet>) {
        self.inner.engine.lock().register_applet(id, applet);
    }

    /// Registers an RPC agent under `id`.
    pub fn register_agent(&self, id: u16, agent: Arc<dyn RpcAgent>) {
        self.inner.engine.lock().register_agent(id, agent);
    }

    /// Stops fetching descriptors. A descriptor already executing completes.
    pub fn pause(&self) {
        self.inner.ring.lock().paused = true;
    }

    /// Resumes fetching descriptors.
    pub fn resume(&self) {
        self.inner.ring.lock().paused = false;
        self.inner.ring_cond.notify_all();
    }

    /// Fails the next crypto or combined descriptor with `status`.
    pub fn fail_next(&self, status: DeviceStatus) {
        self.inner.engine.lock().fail_next(status);
    }

    /// Waits until the ring is empty and nothing is executing.
    pub fn wait_idle(&self) {
        let mut ring = self.inner.ring.lock();
        while !ring.shutdown && (ring.busy || (!ring.paused && !ring.entries.is_empty())) {
            self.inner.ring_cond.wait(&mut ring);
        }
    }

    /// Returns the number of descriptors queued in the ring.
    pub fn ring_len(&self) -> usize {
        self.inner.ring.lock().entries.len()
    }

    /// Returns the number of descriptors executed so far.
    pub fn executed(&self) -> u64 {
        self.inner.engine.lock().executed()
    }

    /// Returns the UID resident in a cache slot.
    pub fn slot_uid(&self, slot: usize) -> Option<ContextUid> {
        self.inner.engine.lock().slot_uid(slot)
    }

    /// Returns the number of open applet sessions.
    pub fn open_sessions(&self) -> usize {
        self.inner.engine.lock().open_sessions()
    }
}

impl SepHw for SimDevice {
    fn info(&self) -> HwInfo {
        HwInfo {
            ring_depth: self.inner.config.ring_depth,
            cache_slots: self.inner.config.cache_slots,
        }
    }

    fn dma(&self) -> &Arc<DmaSpace> {
        &self.inner.dma
    }

    fn attach_irq(&self, handler: Weak<dyn IrqHandler>) {
        *self.inner.irq.write() = Some(handler);
    }

    fn detach_irq(&self) {
        *self.inner.irq.write() = None;
    }

    fn push(&self, cookie: Cookie, desc: &Descriptor) -> Result<(), HostError> {
        let mut ring = self.inner.ring.lock();
        if ring.entries.len() >= self.inner.config.ring_depth {
            tracing::trace!(%cookie, "Ring full");
            Err(HostError::NoResource)?
        }

        tracing::trace!(%cookie, desc = desc.name(), "Descriptor pushed");
        ring.entries.push_back((cookie, desc.clone()));
        self.inner.ring_cond.notify_all();
        Ok(())
    }

    fn pop_completion(&self) -> Option<CompletionRecord> {
        self.inner.completions.lock().pop_front()
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.inner.ring.lock().shutdown = true;
        self.inner.ring_cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
