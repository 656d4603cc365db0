// Copyright (C) Microsoft Corporation. All rights reserved.

#![warn(missing_docs)]

//! Simulated secure coprocessor
//!
//! Implements [`sep_interface::SepHw`] in software: a fixed-depth descriptor
//! ring drained in order by one worker thread, device context cache slots,
//! crypto engines, RPC agents and applets.

pub mod applet;
pub mod crypto;
mod data;
mod dev;
mod engine;

pub use dev::SimDevice;
use sep_interface::HostError;

/// Simulated device properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Descriptor ring depth
    pub ring_depth: usize,

    /// Number of context cache slots
    pub cache_slots: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ring_depth: 16,
            cache_slots: 8,
        }
    }
}

impl SimConfig {
    /// Checks the sizes.
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - A size is zero or the slot count exceeds the slot index range
    pub fn validate(&self) -> Result<(), HostError> {
        if self.ring_depth == 0 || self.cache_slots == 0 || self.cache_slots > u16::MAX as usize {
            tracing::error!(?self, "Invalid simulator configuration");
            Err(HostError::InvalidArgument)?
        }
        Ok(())
    }
}
