// Copyright (C) Microsoft Corporation. All rights reserved.

//! Secure applications and RPC agents hosted by the simulated SeP.

use sep_interface::DeviceStatus;
use sep_interface::ParamDir;

/// A parameter as an applet sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppletParam {
    /// Unused slot
    None,

    /// Value pair
    Value {
        /// Direction
        dir: ParamDir,

        /// First word
        a: u32,

        /// Second word
        b: u32,
    },

    /// Memory buffer
    MemRef {
        /// Direction
        dir: ParamDir,

        /// Contents; zero filled for output-only buffers
        data: Vec<u8>,

        /// Size reported back to the caller
        size: usize,
    },
}

/// A secure application addressed by UUID.
pub trait Applet: Send + Sync {
    /// Opens a session.
    ///
    /// # Returns
    /// * Applet private session value on success
    /// * Applet return code on failure
    fn open_session(&self, params: &mut [AppletParam]) -> Result<u64, u32>;

    /// Handles one command. Returns the applet return code, 0 on success.
    fn invoke(&self, session: u64, cmd: u32, params: &mut [AppletParam]) -> u32;

    /// Closes a session.
    fn close_session(&self, session: u64);
}

/// A device-side RPC service addressed by agent id.
pub trait RpcAgent: Send + Sync {
    /// Executes `func`.
    ///
    /// # Arguments
    /// * `func` - Function identifier
    /// * `params` - Parameter blob, updated in place; its length is fixed
    /// * `memrefs` - Contents of the memory references, written back where the host allowed it
    fn call(&self, func: u16, params: &mut [u8], memrefs: &mut [Vec<u8>]) -> DeviceStatus;
}
