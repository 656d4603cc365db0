// Copyright (C) Microsoft Corporation. All rights reserved.

//! Driver configuration.

use sep_interface::HostError;

/// Host side sizes of the per-client tables and request limits.
///
/// Ring depth and cache slot count are read from the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Memory reference registry entries per client
    pub memref_slots: usize,

    /// Applet sessions per client
    pub session_slots: usize,

    /// Memory references per RPC call
    pub max_rpc_memrefs: usize,

    /// RPC parameter blob size in bytes
    pub max_rpc_params: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            memref_slots: 32,
            session_slots: 8,
            max_rpc_memrefs: 8,
            max_rpc_params: 1024,
        }
    }
}

impl DriverConfig {
    /// Checks the configuration.
    ///
    /// # Error
    /// * `HostError::InvalidArgument` - A size is zero
    pub fn validate(&self) -> Result<(), HostError> {
        if self.memref_slots == 0
            || self.session_slots == 0
            || self.max_rpc_memrefs == 0
            || self.max_rpc_params == 0
        {
            tracing::error!(config = ?self, "Invalid driver configuration");
            Err(HostError::InvalidArgument)?
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(DriverConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_zero_size_rejected() {
        let config = DriverConfig {
            session_slots: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(HostError::InvalidArgument));
    }
}
