// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Secure coprocessor (SeP) host driver
//!
//! Turns client requests (cipher, MAC, hash, authenticated encryption,
//! combined chains, RPC and applet calls) into descriptors for one in-order
//! hardware ring. Buffers are described to the device through MLLI tables,
//! contexts are kept in a bounded device cache, and every operation cleans up
//! after itself whatever its outcome.

mod applet;
mod cache;
mod client;
mod config;
mod context;
mod device;
mod dma_registry;
mod mlli;
mod op;
mod orchestrator;
mod queue;

pub use applet::AppletParam;
pub use applet::AppletReturn;
pub use applet::ReturnOrigin;
pub use applet::SessionId;
pub use client::BufRange;
pub use client::Callback;
pub use client::Client;
pub use config::DriverConfig;
pub use context::CryptoContext;
pub use context::CtxState;
pub use device::SepDevice;
pub use dma_registry::MemRefId;
pub use orchestrator::CombinedContext;
pub use sep_interface::*;
pub use uuid::Uuid;
