// Copyright (C) Microsoft Corporation. All rights reserved.

//! Applet sessions.
//!
//! Sessions live in a fixed per-client table addressed by [`SessionId`]. An
//! open session holds one reference of its own; every command in flight takes
//! another, and close is refused while any command holds one.

use std::fmt;

use parking_lot::Mutex;
use sep_interface::*;
use tracing::instrument;
use uuid::Uuid;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::client::BufRange;
use crate::client::Client;
use crate::client::ClientInner;
use crate::dma_registry::MemRefHold;
use crate::dma_registry::MemRefId;
use crate::mlli::Source;
use crate::op::OpResources;
use crate::op::Plan;

/// Handle to an applet session of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Opening,
    Open { handle: u32, refcount: usize },
    Closing { handle: u32 },
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    app: Uuid,
    state: SlotState,
}

/// Per-client applet session table.
#[derive(Debug)]
pub(crate) struct SessionTable {
    slots: Mutex<Vec<Slot>>,
}

impl SessionTable {
    /// Create a table with `size` slots.
    pub(crate) fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|_| Slot {
                generation: 0,
                app: Uuid::nil(),
                state: SlotState::Free,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Reserve a slot for a session being opened.
    ///
    /// # Arguments
    ///
    /// * `app` - Applet the session is opened with
    ///
    /// # Returns
    ///
    /// * `SessionId` - Id of the reserved slot
    ///
    /// # Error
    ///
    /// * `HostError::NoResource` - Every slot is taken
    pub(crate) fn reserve(&self, app: Uuid) -> Result<SessionId, HostError> {
        let mut slots = self.slots.lock();
        let Some((index, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.state == SlotState::Free)
        else {
            tracing::error!(%app, "Applet session table full");
            return Err(HostError::NoResource);
        };

        slot.generation = slot.generation.wrapping_add(1);
        slot.app = app;
        slot.state = SlotState::Opening;
        Ok(SessionId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    fn with_slot<R>(&self, id: SessionId, f: impl FnOnce(&mut Slot) -> Result<R, HostError>) -> Result<R, HostError> {
        let mut slots = self.slots.lock();
        match slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.state != SlotState::Free => f(slot),
            _ => {
                tracing::error!(session = %id, "Stale applet session");
                Err(HostError::BadPointer)
            }
        }
    }

    /// Mark a reserved session open with its device handle.
    ///
    /// # Error
    /// * `HostError::BadPointer` - The reservation was reclaimed meanwhile
    pub(crate) fn activate(&self, id: SessionId, handle: u32) -> Result<(), HostError> {
        self.with_slot(id, |slot| {
            if slot.state != SlotState::Opening {
                tracing::error!(session = %id, "Session is not being opened");
                Err(HostError::BadPointer)?
            }
            slot.state = SlotState::Open { handle, refcount: 1 };
            Ok(())
        })
    }

    /// Return a reserved slot whose open did not succeed.
    pub(crate) fn abandon(&self, id: SessionId) {
        let _ = self.with_slot(id, |slot| {
            slot.state = SlotState::Free;
            Ok(())
        });
    }

    /// Take a reference for a command.
    ///
    /// # Returns
    ///
    /// * `u32` - Device session handle
    ///
    /// # Error
    ///
    /// * `HostError::BadPointer` - Stale id, or the session is not open
    pub(crate) fn acquire(&self, id: SessionId) -> Result<u32, HostError> {
        self.with_slot(id, |slot| match &mut slot.state {
            SlotState::Open { handle, refcount } => {
                *refcount += 1;
                Ok(*handle)
            }
            state => {
                tracing::error!(session = %id, ?state, "Applet session not open");
                Err(HostError::BadPointer)
            }
        })
    }

    /// Drop a reference taken by [`SessionTable::acquire`].
    pub(crate) fn release(&self, id: SessionId) {
        let _ = self.with_slot(id, |slot| {
            if let SlotState::Open { refcount, .. } = &mut slot.state {
                *refcount = refcount.saturating_sub(1).max(1);
            }
            Ok(())
        });
    }

    /// Move an idle open session to closing.
    ///
    /// # Returns
    ///
    /// * `u32` - Device session handle
    ///
    /// # Error
    ///
    /// * `HostError::Busy` - A command holds a reference
    /// * `HostError::BadPointer` - Stale id, or the session is not open
    pub(crate) fn begin_close(&self, id: SessionId) -> Result<u32, HostError> {
        self.with_slot(id, |slot| match slot.state {
            SlotState::Open { handle, refcount: 1 } => {
                slot.state = SlotState::Closing { handle };
                Ok(handle)
            }
            SlotState::Open { refcount, .. } => {
                tracing::debug!(session = %id, refcount, "Applet session busy");
                Err(HostError::Busy)
            }
            state => {
                tracing::error!(session = %id, ?state, "Applet session not open");
                Err(HostError::BadPointer)
            }
        })
    }

    /// Free the slot of a closed session.
    pub(crate) fn finish_close(&self, id: SessionId) {
        self.abandon(id);
    }

    /// Clear the table.
    ///
    /// # Returns
    ///
    /// * `Vec<(SessionId, u32)>` - Sessions that still need closing on the device
    pub(crate) fn take_all(&self) -> Vec<(SessionId, u32)> {
        let mut slots = self.slots.lock();
        let mut open = Vec::new();
        for (index, slot) in slots.iter_mut().enumerate() {
            let id = SessionId {
                index: index as u32,
                generation: slot.generation,
            };
            match slot.state {
                SlotState::Open { handle, .. } | SlotState::Closing { handle } => {
                    tracing::debug!(session = %id, app = %slot.app, handle, "Reclaiming applet session");
                    open.push((id, handle));
                }
                SlotState::Opening | SlotState::Free => (),
            }
            slot.state = SlotState::Free;
        }
        open
    }

    /// Number of open sessions.
    pub(crate) fn open_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Open { .. }))
            .count()
    }
}

/// A command reference on a session, dropped when the command is done.
struct SessionRef<'a> {
    table: &'a SessionTable,
    id: SessionId,
}

impl Drop for SessionRef<'_> {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

/// One applet call parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppletParam {
    /// Unused
    None,

    /// A pair of values
    Value {
        /// Direction
        dir: ParamDir,

        /// First value
        a: u32,

        /// Second value
        b: u32,
    },

    /// A window of a registered memory reference
    MemRef {
        /// Direction
        dir: ParamDir,

        /// Memory reference
        memref: MemRefId,

        /// Start of the window in the memory reference
        offset: usize,

        /// Window size; output parameters get the size the applet produced,
        /// which may exceed the window
        size: usize,
    },
}

/// Layer that produced an applet return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOrigin {
    /// The device refused the call before it reached the applet
    Device,

    /// The applet
    Applet,
}

/// Outcome of an applet call that reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppletReturn {
    /// Return code, 0 on success
    pub code: u32,

    /// Who produced `code`
    pub origin: ReturnOrigin,
}

impl AppletReturn {
    /// Returns true for a zero code.
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

impl ClientInner {
    /// Encodes `params` into a mapped parameter block.
    fn param_block(
        &self,
        res: &mut OpResources,
        session: u32,
        params: &[AppletParam],
    ) -> SepResult<(HostBuffer, DataRef)> {
        if params.len() > MAX_APPLET_PARAMS {
            tracing::error!(count = params.len(), "Too many applet parameters");
            Err(HostError::InvalidArgument)?
        }

        let mut block = WireParamBlock {
            session,
            count: params.len() as u32,
            ..Default::default()
        };
        let mut wire = block.params;
        for (slot, param) in wire.iter_mut().zip(params) {
            match *param {
                AppletParam::None => slot.kind = PARAM_KIND_NONE,
                AppletParam::Value { dir, a, b } => {
                    slot.kind = PARAM_KIND_VALUE;
                    slot.dir = dir.to_raw();
                    slot.a = a;
                    slot.b = b;
                }
                AppletParam::MemRef {
                    dir,
                    memref,
                    offset,
                    size,
                } => {
                    let hold = MemRefHold::acquire(&self.registry, memref)?;
                    let object = hold.object();
                    let allowed = object.dir();
                    if (dir.is_input() && !allowed.device_reads()) || (dir.is_output() && !allowed.device_writes()) {
                        tracing::error!(%memref, ?dir, ?allowed, "Memory reference direction not allowed");
                        Err(HostError::InvalidArgument)?
                    }
                    if offset.checked_add(size).map_or(true, |end| end > object.len()) {
                        tracing::error!(%memref, offset, size, len = object.len(), "Window outside the memory reference");
                        Err(HostError::InvalidArgument)?
                    }

                    let table = self.device.mlli.create_simple(Source {
                        object,
                        offset,
                        len: size,
                    })?;
                    slot.kind = PARAM_KIND_MEMREF;
                    slot.dir = dir.to_raw();
                    slot.size = size as u32;
                    slot.set_data(res.hold_table(table));
                    res.memrefs.push(hold);
                }
            }
        }
        block.params = wire;

        let buf = HostBuffer::from_slice(block.as_bytes());
        let data = self.map_simple(res, &BufRange::from(&buf), DmaDirection::Bidirectional)?;
        Ok((buf, data))
    }

    /// Runs one applet descriptor and decodes the answer into `params`.
    fn applet_call(
        &self,
        mut res: OpResources,
        session: u32,
        params: &mut [AppletParam],
        desc: impl FnOnce(DataRef) -> Descriptor,
    ) -> SepResult<(WireParamBlock, AppletReturn)> {
        let (buf, data) = self.param_block(&mut res, session, params)?;
        self.execute(res, Plan::Raw(desc(data)), |_, _| Ok(()))?;
        read_block(&buf, params)
    }
}

/// Reads the device's answer and copies the outputs into `params`.
fn read_block(buf: &HostBuffer, params: &mut [AppletParam]) -> SepResult<(WireParamBlock, AppletReturn)> {
    let block = WireParamBlock::read_from_bytes(&buf.to_vec()).map_err(|_| HostError::Io)?;
    let origin = block.ret_origin;
    let origin = match origin {
        RET_ORIGIN_DEVICE => ReturnOrigin::Device,
        _ => ReturnOrigin::Applet,
    };

    let wire = block.params;
    for (param, slot) in params.iter_mut().zip(wire.iter()) {
        match param {
            AppletParam::Value { dir, a, b } if dir.is_output() => {
                *a = slot.a;
                *b = slot.b;
            }
            AppletParam::MemRef { dir, size, .. } if dir.is_output() => *size = slot.size as usize,
            _ => (),
        }
    }

    let ret = AppletReturn {
        code: block.ret_code,
        origin,
    };
    Ok((block, ret))
}

impl Client {
    /// Opens a session with applet `app`.
    ///
    /// # Returns
    /// * `Ok(SessionId)` - The session is open
    /// * `Err(AppletReturn)` - The device or the applet refused; no session
    ///
    /// # Error
    /// * `HostError::NoResource` - The session table is full
    #[instrument(skip(self, params), fields(client = self.inner.id))]
    pub fn applet_open(&self, app: Uuid, params: &mut [AppletParam]) -> SepResult<Result<SessionId, AppletReturn>> {
        let inner = &self.inner;
        // Client teardown must not reclaim the reservation before it is activated.
        let _pin = inner.inflight.enter();
        let res = inner.begin_op()?;
        let id = inner.sessions.reserve(app)?;

        let submitted = inner.applet_call(res, 0, params, |data| Descriptor::AppletOpen { app, params: data });
        let (block, ret) = match submitted {
            Ok(answer) => answer,
            Err(err) => {
                inner.sessions.abandon(id);
                Err(err)?
            }
        };

        if !ret.is_success() {
            inner.sessions.abandon(id);
            tracing::warn!(%app, code = ret.code, origin = ?ret.origin, "Applet session refused");
            return Ok(Err(ret));
        }

        let handle = block.session;
        if let Err(err) = inner.sessions.activate(id, handle) {
            let res = OpResources::new(inner.inflight.enter());
            if let Err(close) = inner.execute(res, Plan::Raw(Descriptor::AppletClose { handle }), |_, _| Ok(())) {
                tracing::error!(error = ?close, handle, "Failed to close orphaned applet session");
            }
            Err(err)?
        }
        tracing::debug!(%app, session = %id, handle, "Applet session open");
        Ok(Ok(id))
    }

    /// Invokes command `cmd` on an open session.
    ///
    /// The session cannot be closed while the command runs.
    ///
    /// # Returns
    /// * `AppletReturn` - Return code and its origin; output parameters of
    ///   `params` are updated
    ///
    /// # Error
    /// * `HostError::BadPointer` - Unknown, closed or closing session
    #[instrument(skip(self, params), fields(client = self.inner.id))]
    pub fn applet_invoke(&self, session: SessionId, cmd: u32, params: &mut [AppletParam]) -> SepResult<AppletReturn> {
        let inner = &self.inner;
        let res = inner.begin_op()?;
        let handle = inner.sessions.acquire(session)?;
        let _hold = SessionRef {
            table: &inner.sessions,
            id: session,
        };

        let (_, ret) = inner.applet_call(res, handle, params, |data| Descriptor::AppletInvoke {
            handle,
            cmd,
            params: data,
        })?;
        Ok(ret)
    }

    /// Closes a session.
    ///
    /// # Error
    /// * `HostError::Busy` - A command on the session is in flight
    /// * `HostError::BadPointer` - Unknown or already closed session
    #[instrument(skip(self), fields(client = self.inner.id))]
    pub fn applet_close(&self, session: SessionId) -> SepResult<()> {
        let inner = &self.inner;
        let res = inner.begin_op()?;
        let handle = inner.sessions.begin_close(session)?;

        let result = inner.execute(res, Plan::Raw(Descriptor::AppletClose { handle }), |_, _| Ok(()));
        inner.sessions.finish_close(session);
        if let Err(err) = &result {
            tracing::error!(error = ?err, %session, "Device failed to close applet session");
        }
        result
    }

    /// Number of open applet sessions.
    pub fn applet_sessions(&self) -> usize {
        self.inner.sessions.open_count()
    }
}
