// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Secure coprocessor (SeP) interface library
//!
//! Types shared between the host driver and a SeP implementation: the status
//! taxonomies, the algorithm catalogue, device-format context blobs,
//! descriptors and the DMA address space both sides see.

mod alg;
mod ctx;
mod desc;
mod dma;
mod error;
mod param;
mod status;

use std::sync::Weak;

pub use alg::*;
pub use ctx::*;
pub use desc::*;
pub use dma::*;
pub use error::*;
pub use param::*;
pub use status::DeviceStatus;

/// Static properties reported by a SeP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwInfo {
    /// Number of descriptors the hardware ring holds.
    pub ring_depth: usize,

    /// Number of context cache slots on the device.
    pub cache_slots: usize,
}

/// Completion interrupt sink registered by the host.
pub trait IrqHandler: Send + Sync {
    /// Called by the device after it appended one or more records to its
    /// completion FIFO. Must not block.
    fn interrupt(&self);
}

/// Hardware trait implemented by a SeP (real or simulated).
pub trait SepHw: Send + Sync {
    /// Returns the device properties.
    fn info(&self) -> HwInfo;

    /// Returns the DMA address space the device reads and writes through.
    fn dma(&self) -> &std::sync::Arc<DmaSpace>;

    /// Registers the completion interrupt handler.
    ///
    /// # Arguments
    /// * `handler` - Handler invoked after completions are posted
    fn attach_irq(&self, handler: Weak<dyn IrqHandler>);

    /// Unregisters the completion interrupt handler.
    fn detach_irq(&self);

    /// Writes one descriptor into the hardware ring.
    ///
    /// # Arguments
    /// * `cookie` - Opaque value echoed back in the completion record
    /// * `desc` - Descriptor to execute
    ///
    /// # Error
    /// * `HostError::NoResource` - The ring is full
    fn push(&self, cookie: Cookie, desc: &Descriptor) -> Result<(), HostError>;

    /// Dequeues the oldest completion record, if any.
    fn pop_completion(&self) -> Option<CompletionRecord>;
}
