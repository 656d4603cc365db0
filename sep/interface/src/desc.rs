// Copyright (C) Microsoft Corporation. All rights reserved.

//! Descriptors and completion records exchanged through the hardware ring.

use std::fmt;
use std::mem::size_of;

use uuid::Uuid;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::ContextUid;
use crate::DeviceStatus;
use crate::DmaAddr;
use crate::DmaDirection;

/// Maximum number of contexts in one combined chain.
pub const MAX_COMBINED_NODES: usize = 4;

/// Opaque value that pairs a completion record with its submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(pub u64);

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One scatter/gather record of an MLLI table as the device reads it.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MlliEntry {
    /// Device address of the segment
    pub addr: u64,

    /// Segment length in bytes
    pub len: u32,

    /// Reserved
    pub rsvd: u32,
}

/// Size of one [`MlliEntry`] in bytes.
pub const MLLI_ENTRY_SIZE: usize = size_of::<MlliEntry>();

/// Location of a data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataRef {
    /// No data
    #[default]
    Null,

    /// One contiguous segment
    Dlli {
        /// Segment address
        addr: DmaAddr,

        /// Segment length
        len: u32,
    },

    /// A table of [`MlliEntry`] records
    Mlli {
        /// Table address
        table: DmaAddr,

        /// Number of records
        entries: u32,
    },
}

impl DataRef {
    /// Returns true for [`DataRef::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, DataRef::Null)
    }
}

/// A memory reference handed to an RPC agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRefDesc {
    /// Access the agent is granted
    pub dir: DmaDirection,

    /// Where the data lives
    pub data: DataRef,
}

/// Reference to a context blob and the cache slot it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxRef {
    /// Device cache slot
    pub slot: u16,

    /// Host blob address, written back after every descriptor
    pub addr: DmaAddr,

    /// Expected UID of the slot contents
    pub uid: ContextUid,

    /// Load the blob into the slot before use
    pub load: bool,
}

/// Crypto verb carried by [`Descriptor::Crypto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoOp {
    /// Initialize the context from its blob, consuming optional setup data
    Init,

    /// Process whole blocks
    Process,

    /// Process the trailing data and produce the final result
    Finalize,

    /// Init, process and finalize in one pass
    Integrated,
}

/// Engine a combined chain node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineType {
    /// Unused node
    Null = 0,

    /// Symmetric cipher
    Aes = 1,

    /// Hash
    Hash = 2,

    /// MAC
    Mac = 3,
}

/// Where a combined chain node takes its input from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineSource {
    /// The descriptor input stream
    Din = 1,

    /// The output of the previous node
    PrevOutput = 2,
}

/// One node of a combined chain topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainNode {
    /// Engine
    pub engine: EngineType,

    /// Input selector
    pub source: EngineSource,
}

/// Combined chain topology packed into one word.
///
/// Node `i` occupies bits `8i..8i+8`: engine in the low nibble, source in the
/// high nibble. A zero byte ends the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CombinedScheme(pub u32);

impl CombinedScheme {
    /// Encodes a topology.
    ///
    /// # Returns
    /// `None` if the chain is empty, too long, contains a null engine or the
    /// first node reads the output of a predecessor it does not have.
    pub fn encode(nodes: &[ChainNode]) -> Option<Self> {
        if nodes.is_empty() || nodes.len() > MAX_COMBINED_NODES {
            return None;
        }

        let mut raw = 0u32;
        for (i, node) in nodes.iter().enumerate() {
            if node.engine == EngineType::Null {
                return None;
            }
            if i == 0 && node.source == EngineSource::PrevOutput {
                return None;
            }

            let byte = (node.engine as u32) | ((node.source as u32) << 4);
            raw |= byte << (8 * i);
        }

        Some(Self(raw))
    }

    /// Decodes the topology.
    ///
    /// # Returns
    /// `None` if the word contains an unknown engine or source.
    pub fn decode(&self) -> Option<Vec<ChainNode>> {
        let mut nodes = Vec::new();
        for i in 0..MAX_COMBINED_NODES {
            let byte = (self.0 >> (8 * i)) & 0xff;
            if byte == 0 {
                break;
            }

            let engine = match byte & 0xf {
                1 => EngineType::Aes,
                2 => EngineType::Hash,
                3 => EngineType::Mac,
                _ => return None,
            };
            let source = match byte >> 4 {
                1 => EngineSource::Din,
                2 => EngineSource::PrevOutput,
                _ => return None,
            };
            nodes.push(ChainNode { engine, source });
        }

        Some(nodes)
    }
}

/// One hardware command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    /// Single-context crypto operation
    Crypto {
        /// Verb
        op: CryptoOp,

        /// Context
        ctx: CtxRef,

        /// Input
        din: DataRef,

        /// Output
        dout: DataRef,
    },

    /// Load contexts into their cache slots without processing
    Load {
        /// Contexts to load
        ctxs: Vec<CtxRef>,
    },

    /// Combined chain pass
    Combined {
        /// Topology
        scheme: CombinedScheme,

        /// One context per node
        ctxs: Vec<CtxRef>,

        /// Input
        din: DataRef,

        /// Output of the last cipher node
        dout: DataRef,

        /// Finalize every node after processing
        finalize: bool,
    },

    /// Generic remote procedure call
    Rpc {
        /// Agent identifier
        agent: u16,

        /// Function identifier
        func: u16,

        /// Parameter blob, read and written by the agent
        params: DataRef,

        /// Memory references passed to the agent
        memrefs: Vec<MemRefDesc>,
    },

    /// Open an applet session
    AppletOpen {
        /// Applet identity
        app: Uuid,

        /// Parameter block
        params: DataRef,
    },

    /// Invoke an applet command
    AppletInvoke {
        /// Device session handle
        handle: u32,

        /// Command identifier
        cmd: u32,

        /// Parameter block
        params: DataRef,
    },

    /// Close an applet session
    AppletClose {
        /// Device session handle
        handle: u32,
    },
}

impl Descriptor {
    /// Returns a short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Descriptor::Crypto { op, .. } => match op {
                CryptoOp::Init => "crypto-init",
                CryptoOp::Process => "crypto-process",
                CryptoOp::Finalize => "crypto-finalize",
                CryptoOp::Integrated => "crypto-integrated",
            },
            Descriptor::Load { .. } => "load",
            Descriptor::Combined { .. } => "combined",
            Descriptor::Rpc { .. } => "rpc",
            Descriptor::AppletOpen { .. } => "applet-open",
            Descriptor::AppletInvoke { .. } => "applet-invoke",
            Descriptor::AppletClose { .. } => "applet-close",
        }
    }
}

/// Record posted by the device for every executed descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Cookie the descriptor was pushed with
    pub cookie: Cookie,

    /// Outcome
    pub status: DeviceStatus,
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    fn node(engine: EngineType, source: EngineSource) -> ChainNode {
        ChainNode { engine, source }
    }

    #[test]
    fn test_scheme_layout() {
        let nodes = [
            node(EngineType::Aes, EngineSource::Din),
            node(EngineType::Hash, EngineSource::PrevOutput),
        ];
        let scheme = CombinedScheme::encode(&nodes).unwrap();
        assert_eq!(scheme.0, 0x2211);
        assert_eq!(scheme.decode().unwrap(), nodes);
    }

    #[test]
    fn test_scheme_rejects_bad_topology() {
        assert!(CombinedScheme::encode(&[]).is_none());
        assert!(CombinedScheme::encode(&[node(EngineType::Hash, EngineSource::PrevOutput)]).is_none());
        assert!(CombinedScheme::encode(&[node(EngineType::Null, EngineSource::Din)]).is_none());
        assert!(CombinedScheme::encode(&[node(EngineType::Aes, EngineSource::Din); 5]).is_none());
        assert!(CombinedScheme(0x0f).decode().is_none());
        assert!(CombinedScheme(0x31).decode().is_none());
    }

    #[test]
    fn test_mlli_entry_size() {
        assert_eq!(MLLI_ENTRY_SIZE, 16);
    }
}
