// Copyright (C) Microsoft Corporation. All rights reserved.

//! Descriptor queue.
//!
//! One ordered channel to the hardware ring. Descriptors that do not fit in
//! the ring may wait in a FIFO backlog. Completions are matched to their
//! submission by cookie, strictly in submission order, on the interrupt path.
//! Continuations of asynchronous operations and the release of resources run
//! on a deferred-work thread instead.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::Sender;
use parking_lot::Condvar;
use parking_lot::Mutex;
use sep_interface::Cookie;
use sep_interface::Descriptor;
use sep_interface::DeviceStatus;
use sep_interface::HostError;
use sep_interface::IrqHandler;
use sep_interface::SepHw;

use crate::op::OpResources;

type Job = Box<dyn FnOnce() + Send>;

/// Anything that must stay alive until a descriptor completed.
pub(crate) type Keepalive = Box<dyn Any + Send>;

/// Runs an asynchronous operation's cleanup and callback.
pub(crate) type Continuation = Box<dyn FnOnce(DeviceStatus, OpResources) + Send>;

/// Single deferred-work thread.
pub(crate) struct WorkQueue {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl WorkQueue {
    fn new() -> Result<Self, HostError> {
        let (sender, receiver) = crossbeam::channel::unbounded::<Job>();
        let worker = std::thread::Builder::new()
            .name("sep-deferred".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .map_err(|err| {
                tracing::error!(error = ?err, "Failed to spawn deferred-work thread");
                HostError::Io
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn on_worker(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.thread().id() == std::thread::current().id())
    }

    pub(crate) fn schedule(&self, job: Job) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(job).is_err() {
            tracing::error!("Deferred-work thread is gone, job dropped");
        }
    }

    /// Waits until every job scheduled so far ran.
    ///
    /// Returns immediately on the deferred-work thread itself.
    pub(crate) fn flush(&self) {
        if self.on_worker() {
            return;
        }
        let (done, wait) = crossbeam::channel::bounded(1);
        self.schedule(Box::new(move || {
            let _ = done.send(());
        }));
        let _ = wait.recv();
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[derive(Default)]
struct TrackerState {
    first_error: DeviceStatus,
    done: Option<DeviceStatus>,
    resources: Option<OpResources>,
    continuation: Option<Continuation>,
}

/// Completion primitive of one operation.
///
/// Owns the operation's resources until the final descriptor completed, then
/// either wakes the blocked caller or schedules the continuation.
pub(crate) struct OpTracker {
    state: Mutex<TrackerState>,
    cond: Condvar,
}

impl OpTracker {
    pub(crate) fn new(resources: OpResources) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                resources: Some(resources),
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn with_continuation(resources: OpResources, continuation: Continuation) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                resources: Some(resources),
                continuation: Some(continuation),
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }

    /// Records the status of a descriptor that is not the last of the operation.
    fn note(&self, status: DeviceStatus) {
        let mut state = self.state.lock();
        if state.done.is_some() {
            tracing::error!(%status, "Intermediate completion for a finished operation");
            return;
        }
        if state.first_error.is_none() {
            state.first_error = status;
        }
    }

    /// Records the final status. The first failing descriptor decides the outcome.
    fn complete(&self, status: DeviceStatus, work: &WorkQueue) {
        let mut state = self.state.lock();
        if state.done.is_some() {
            tracing::error!(%status, "Completion for an operation that is not waiting");
            return;
        }

        let status = if state.first_error.is_none() {
            status
        } else {
            state.first_error
        };
        state.done = Some(status);

        match state.continuation.take() {
            Some(continuation) => {
                let resources = state.resources.take().unwrap_or_default();
                drop(state);
                work.schedule(Box::new(move || continuation(status, resources)));
            }
            None => {
                self.cond.notify_all();
            }
        }
    }

    /// Blocks until the operation completed.
    pub(crate) fn wait(&self) -> (DeviceStatus, OpResources) {
        let mut state = self.state.lock();
        loop {
            if let Some(status) = state.done {
                return (status, state.resources.take().unwrap_or_default());
            }
            self.cond.wait(&mut state);
        }
    }
}

/// How a queue entry reports its completion.
pub(crate) enum Waiter {
    /// A descriptor followed by more of the same operation
    Step(Arc<OpTracker>),

    /// The final descriptor of an operation
    Last(Arc<OpTracker>),
}

struct Pending {
    cookie: Cookie,
    name: &'static str,
    waiter: Option<Waiter>,
    keepalive: Option<Keepalive>,
}

struct QueueState {
    depth: usize,
    inflight: VecDeque<Pending>,
    backlog: VecDeque<(Pending, Descriptor)>,
    delivering: usize,
    next_cookie: u64,
    stopped: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.inflight.is_empty() && self.backlog.is_empty() && self.delivering == 0
    }
}

/// The device's descriptor queue.
pub(crate) struct DescQueue {
    hw: Arc<dyn SepHw>,
    state: Mutex<QueueState>,
    idle: Condvar,
    work: WorkQueue,
}

impl DescQueue {
    pub(crate) fn new(hw: Arc<dyn SepHw>) -> Result<Self, HostError> {
        let depth = hw.info().ring_depth;
        Ok(Self {
            hw,
            state: Mutex::new(QueueState {
                depth,
                inflight: VecDeque::new(),
                backlog: VecDeque::new(),
                delivering: 0,
                next_cookie: 1,
                stopped: false,
            }),
            idle: Condvar::new(),
            work: WorkQueue::new()?,
        })
    }

    /// Moves backlogged descriptors into the ring while it has room.
    fn refill(&self, state: &mut QueueState) {
        while state.inflight.len() < state.depth {
            let Some((pending, desc)) = state.backlog.pop_front() else {
                break;
            };
            match self.hw.push(pending.cookie, &desc) {
                Ok(()) => {
                    tracing::trace!(cookie = %pending.cookie, "Backlogged descriptor pushed");
                    state.inflight.push_back(pending);
                }
                Err(err) => {
                    tracing::trace!(?err, cookie = %pending.cookie, "Ring still full");
                    state.backlog.push_front((pending, desc));
                    break;
                }
            }
        }
    }

    /// Submits one descriptor.
    ///
    /// # Arguments
    /// * `desc` - Descriptor
    /// * `waiter` - Completion routing; `None` for fire-and-forget
    /// * `allow_backlog` - Queue in the backlog instead of failing when the ring is full
    ///
    /// # Returns
    /// The cookie the descriptor was accepted under.
    ///
    /// # Error
    /// * `HostError::NoResource` - The ring is full and the backlog was not allowed
    /// * `HostError::Io` - The queue was stopped
    pub(crate) fn enqueue(
        &self,
        desc: Descriptor,
        waiter: Option<Waiter>,
        allow_backlog: bool,
    ) -> Result<Cookie, HostError> {
        let mut state = self.state.lock();
        if state.stopped {
            tracing::error!(desc = desc.name(), "Descriptor queue is stopped");
            Err(HostError::Io)?
        }
        self.refill(&mut state);

        let cookie = Cookie(state.next_cookie);
        let pending = Pending {
            cookie,
            name: desc.name(),
            waiter,
            keepalive: None,
        };

        let ring_full = !state.backlog.is_empty() || state.inflight.len() >= state.depth;
        let pushed = if ring_full {
            Err(HostError::NoResource)
        } else {
            self.hw.push(cookie, &desc)
        };

        match pushed {
            Ok(()) => {
                tracing::debug!(%cookie, desc = desc.name(), "Descriptor submitted");
                state.inflight.push_back(pending);
            }
            Err(HostError::NoResource) if allow_backlog => {
                tracing::trace!(%cookie, desc = desc.name(), "Descriptor backlogged");
                state.backlog.push_back((pending, desc));
            }
            Err(err) => {
                tracing::debug!(?err, desc = desc.name(), "Descriptor refused");
                Err(err)?
            }
        }

        state.next_cookie += 1;
        Ok(cookie)
    }

    /// Detaches an accepted descriptor from its operation.
    ///
    /// A backlogged descriptor is withdrawn. One already in the ring cannot be
    /// recalled: its completion is ignored and `keepalive` is held until then.
    pub(crate) fn invalidate(&self, cookie: Cookie, keepalive: Keepalive) {
        let withdrawn = {
            let mut state = self.state.lock();
            if let Some(entry) = state.inflight.iter_mut().find(|p| p.cookie == cookie) {
                tracing::debug!(%cookie, "In-flight descriptor invalidated");
                entry.waiter = None;
                entry.keepalive = Some(keepalive);
                return;
            }

            let pos = state.backlog.iter().position(|(p, _)| p.cookie == cookie);
            let withdrawn = pos.and_then(|pos| state.backlog.remove(pos));
            if withdrawn.is_some() {
                tracing::debug!(%cookie, "Backlogged descriptor withdrawn");
            }
            if state.is_idle() {
                self.idle.notify_all();
            }
            withdrawn
        };

        drop(withdrawn);
        drop(keepalive);
    }

    fn finish(&self, entry: Pending, status: DeviceStatus) {
        tracing::debug!(cookie = %entry.cookie, desc = entry.name, %status, "Descriptor completed");
        match entry.waiter {
            Some(Waiter::Step(tracker)) => tracker.note(status),
            Some(Waiter::Last(tracker)) => tracker.complete(status, &self.work),
            None => tracing::debug!(cookie = %entry.cookie, "Completion of an invalidated descriptor ignored"),
        }
        if let Some(keepalive) = entry.keepalive {
            self.work.schedule(Box::new(move || drop(keepalive)));
        }
    }

    /// Dequeues and dispatches every posted completion record.
    fn deliver(&self) {
        while let Some(record) = self.hw.pop_completion() {
            let done: Vec<(Pending, DeviceStatus)> = {
                let mut state = self.state.lock();
                let in_order = state
                    .inflight
                    .front()
                    .is_some_and(|front| front.cookie == record.cookie);

                let done = if in_order {
                    let entry = state.inflight.pop_front();
                    self.refill(&mut state);
                    entry.map(|e| (e, record.status)).into_iter().collect()
                } else {
                    // Queue state is no longer trustworthy.
                    tracing::error!(
                        cookie = %record.cookie,
                        expected = ?state.inflight.front().map(|p| p.cookie),
                        "Completion out of submission order, stopping the queue"
                    );
                    state.stopped = true;
                    let mut done: Vec<_> = state
                        .inflight
                        .drain(..)
                        .map(|p| (p, DeviceStatus::Fatal))
                        .collect();
                    done.extend(state.backlog.drain(..).map(|(p, _)| (p, DeviceStatus::Fatal)));
                    done
                };
                state.delivering += done.len();
                done
            };

            let count = done.len();
            for (entry, status) in done {
                self.finish(entry, status);
            }

            let mut state = self.state.lock();
            state.delivering -= count;
            if state.is_idle() {
                self.idle.notify_all();
            }
        }
    }

    /// Blocks until nothing is in flight or backlogged.
    pub(crate) fn wait_idle(&self) {
        let mut state = self.state.lock();
        while !state.is_idle() {
            self.idle.wait(&mut state);
        }
    }

    /// Waits for every accepted descriptor and every deferred job it scheduled.
    pub(crate) fn drain(&self) {
        self.wait_idle();
        self.work.flush();
    }

    pub(crate) fn work(&self) -> &WorkQueue {
        &self.work
    }

    /// Returns the number of backlogged descriptors.
    #[cfg(test)]
    pub(crate) fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }
}

impl IrqHandler for DescQueue {
    fn interrupt(&self) {
        self.deliver();
    }
}
