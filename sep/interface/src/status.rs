// Copyright (C) Microsoft Corporation. All rights reserved.

//! Device-level status codes.

use std::fmt;

/// Outcome of a request once the SeP processed it.
///
/// `None` is reported both for success and when the request never reached the
/// device; the host status tells the two apart.
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    /// No device-level error.
    #[default]
    None = 0,

    /// Context state does not allow the requested operation.
    BadCtx = 1,

    /// Data size is invalid for the algorithm or the operation.
    InvalDataSize = 2,

    /// Input data pointer could not be accessed.
    InvalDinPtr = 3,

    /// Output data pointer could not be accessed.
    InvalDoutPtr = 4,

    /// Input and output buffers partially overlap.
    DinDoutOverlap = 5,

    /// Device ran out of an internal resource.
    NoResource = 6,

    /// Algorithm or mode is not supported.
    Unsup = 7,

    /// Unrecoverable device failure.
    Fatal = 8,

    /// Authentication tag verification failed.
    AuthFailed = 9,
}

impl DeviceStatus {
    /// Returns true for `DeviceStatus::None`.
    pub fn is_none(self) -> bool {
        self == DeviceStatus::None
    }

    /// Decodes a raw status word. Unknown values are treated as fatal.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => DeviceStatus::None,
            1 => DeviceStatus::BadCtx,
            2 => DeviceStatus::InvalDataSize,
            3 => DeviceStatus::InvalDinPtr,
            4 => DeviceStatus::InvalDoutPtr,
            5 => DeviceStatus::DinDoutOverlap,
            6 => DeviceStatus::NoResource,
            7 => DeviceStatus::Unsup,
            9 => DeviceStatus::AuthFailed,
            _ => DeviceStatus::Fatal,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::None => "NONE",
            DeviceStatus::BadCtx => "BAD_CTX",
            DeviceStatus::InvalDataSize => "INVAL_DATA_SIZE",
            DeviceStatus::InvalDinPtr => "INVAL_DIN_PTR",
            DeviceStatus::InvalDoutPtr => "INVAL_DOUT_PTR",
            DeviceStatus::DinDoutOverlap => "DIN_DOUT_OVERLAP",
            DeviceStatus::NoResource => "NO_RESOURCE",
            DeviceStatus::Unsup => "UNSUP",
            DeviceStatus::Fatal => "FATAL",
            DeviceStatus::AuthFailed => "AUTH_FAILED",
        };
        f.write_str(s)
    }
}
