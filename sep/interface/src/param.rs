// Copyright (C) Microsoft Corporation. All rights reserved.

//! Applet parameter block as it travels to the device.

use std::mem::size_of;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::DataRef;
use crate::DmaAddr;
use crate::DmaDirection;

/// Maximum number of parameters per applet call.
pub const MAX_APPLET_PARAMS: usize = 4;

/// `WireParam::kind`: unused
pub const PARAM_KIND_NONE: u32 = 0;

/// `WireParam::kind`: value pair
pub const PARAM_KIND_VALUE: u32 = 1;

/// `WireParam::kind`: memory reference
pub const PARAM_KIND_MEMREF: u32 = 2;

/// `WireParam::dir`: read by the applet
pub const PARAM_DIR_IN: u32 = 1;

/// `WireParam::dir`: written by the applet
pub const PARAM_DIR_OUT: u32 = 2;

/// `WireParam::dir`: read and written by the applet
pub const PARAM_DIR_INOUT: u32 = 3;

/// Direction of an applet parameter, as seen by the applet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDir {
    /// Read by the applet
    In,

    /// Written by the applet
    Out,

    /// Read and written by the applet
    InOut,
}

impl ParamDir {
    /// Returns the `PARAM_DIR_*` value.
    pub fn to_raw(self) -> u32 {
        match self {
            ParamDir::In => PARAM_DIR_IN,
            ParamDir::Out => PARAM_DIR_OUT,
            ParamDir::InOut => PARAM_DIR_INOUT,
        }
    }

    /// Parses a `PARAM_DIR_*` value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            PARAM_DIR_IN => Some(ParamDir::In),
            PARAM_DIR_OUT => Some(ParamDir::Out),
            PARAM_DIR_INOUT => Some(ParamDir::InOut),
            _ => None,
        }
    }

    /// Returns true when the applet reads the parameter.
    pub fn is_input(self) -> bool {
        matches!(self, ParamDir::In | ParamDir::InOut)
    }

    /// Returns true when the applet writes the parameter.
    pub fn is_output(self) -> bool {
        matches!(self, ParamDir::Out | ParamDir::InOut)
    }

    /// Returns the DMA direction a memory reference of this kind needs.
    pub fn dma_direction(self) -> DmaDirection {
        match self {
            ParamDir::In => DmaDirection::ToDevice,
            ParamDir::Out => DmaDirection::FromDevice,
            ParamDir::InOut => DmaDirection::Bidirectional,
        }
    }
}

const DATA_KIND_NULL: u32 = 0;
const DATA_KIND_DLLI: u32 = 1;
const DATA_KIND_MLLI: u32 = 2;

/// One applet parameter.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireParam {
    /// `PARAM_KIND_*`
    pub kind: u32,

    /// `PARAM_DIR_*`
    pub dir: u32,

    /// First value word
    pub a: u32,

    /// Second value word
    pub b: u32,

    /// Memory reference location encoding
    pub data_kind: u32,

    /// Memory reference segment length or table entry count
    pub data_len: u32,

    /// Memory reference segment or table address
    pub data_addr: u64,

    /// Memory reference size; the applet writes back the produced size
    pub size: u32,

    /// Reserved
    pub rsvd: u32,
}

impl WireParam {
    /// Encodes the location of a memory reference parameter.
    pub fn set_data(&mut self, data: DataRef) {
        let (kind, len, addr) = match data {
            DataRef::Null => (DATA_KIND_NULL, 0, 0),
            DataRef::Dlli { addr, len } => (DATA_KIND_DLLI, len, addr.0),
            DataRef::Mlli { table, entries } => (DATA_KIND_MLLI, entries, table.0),
        };
        self.data_kind = kind;
        self.data_len = len;
        self.data_addr = addr;
    }

    /// Decodes the location of a memory reference parameter.
    pub fn data(&self) -> Option<DataRef> {
        match self.data_kind {
            DATA_KIND_NULL => Some(DataRef::Null),
            DATA_KIND_DLLI => Some(DataRef::Dlli {
                addr: DmaAddr(self.data_addr),
                len: self.data_len,
            }),
            DATA_KIND_MLLI => Some(DataRef::Mlli {
                table: DmaAddr(self.data_addr),
                entries: self.data_len,
            }),
            _ => None,
        }
    }
}

/// Parameter block shared by applet open and invoke.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireParamBlock {
    /// Device session handle, written by the device on open
    pub session: u32,

    /// Applet return code, written by the device
    pub ret_code: u32,

    /// Layer that produced `ret_code`, written by the device
    pub ret_origin: u32,

    /// Number of used entries in `params`
    pub count: u32,

    /// Parameters
    pub params: [WireParam; MAX_APPLET_PARAMS],
}

/// Size of [`WireParamBlock`] in bytes.
pub const WIRE_PARAM_BLOCK_SIZE: usize = size_of::<WireParamBlock>();

/// `WireParamBlock::ret_origin`: the device rejected the call
pub const RET_ORIGIN_DEVICE: u32 = 1;

/// `WireParamBlock::ret_origin`: the applet produced the code
pub const RET_ORIGIN_APPLET: u32 = 2;

/// `WireParamBlock::ret_code`: no applet with the requested identity
pub const RET_CODE_ITEM_NOT_FOUND: u32 = 0xffff_0008;

/// `WireParamBlock::ret_code`: the session handle is not open
pub const RET_CODE_BAD_STATE: u32 = 0xffff_0007;

/// `WireParamBlock::ret_code`: the parameter block is malformed
pub const RET_CODE_BAD_PARAMETERS: u32 = 0xffff_0006;
