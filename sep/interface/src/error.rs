// Copyright (C) Microsoft Corporation. All rights reserved.

//! SeP interface library - Error module

use thiserror::Error;

use crate::DeviceStatus;

/// Host-level failure: the request could not be dispatched to the device.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// Invalid parameter
    #[error("invalid argument")]
    InvalidArgument,

    /// Stale or unknown handle, or memory that cannot be mapped
    #[error("bad pointer")]
    BadPointer,

    /// A fixed-size table or the descriptor ring is exhausted
    #[error("resource exhausted")]
    NoResource,

    /// The resource is still held elsewhere
    #[error("resource busy")]
    Busy,

    /// The descriptor queue is no longer usable
    #[error("internal I/O failure")]
    Io,
}

/// Error returned by every pipeline verb.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SepError {
    /// The request never reached the device.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// The device (or the context protocol on its behalf) rejected the request.
    #[error("device status {0}")]
    Device(DeviceStatus),
}

/// Result of a pipeline verb.
pub type SepResult<T> = Result<T, SepError>;

impl SepError {
    /// Returns the device-level status carried by this error, if any.
    pub fn device_status(&self) -> DeviceStatus {
        match self {
            SepError::Host(_) => DeviceStatus::None,
            SepError::Device(status) => *status,
        }
    }
}

impl DeviceStatus {
    /// Converts a completion status into a result.
    pub fn into_result(self) -> SepResult<()> {
        match self {
            DeviceStatus::None => Ok(()),
            status => Err(SepError::Device(status)),
        }
    }
}

/// The (host-status, device-status) pair reported to the control layer.
///
/// `device` is always populated; a `host` error means the request never
/// reached the device and `device` is `DeviceStatus::None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStatus {
    /// Host-level failure, `None` on success.
    pub host: Option<HostError>,

    /// Device-level outcome.
    pub device: DeviceStatus,
}

impl OpStatus {
    /// Returns true when the request was dispatched to the device.
    pub fn reached_device(&self) -> bool {
        self.host.is_none()
    }

    /// Returns true when neither level reports an error.
    pub fn is_success(&self) -> bool {
        self.host.is_none() && self.device.is_none()
    }
}

impl<T> From<&SepResult<T>> for OpStatus {
    fn from(result: &SepResult<T>) -> Self {
        match result {
            Ok(_) => OpStatus::default(),
            Err(SepError::Host(err)) => OpStatus {
                host: Some(*err),
                device: DeviceStatus::None,
            },
            Err(SepError::Device(status)) => OpStatus {
                host: None,
                device: *status,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use test_with_tracing::test;

    use super::*;

    #[test]
    fn test_status_pair_for_host_failure() {
        let result: SepResult<()> = Err(HostError::NoResource.into());
        let status = OpStatus::from(&result);
        assert_eq!(status.host, Some(HostError::NoResource));
        assert_eq!(status.device, DeviceStatus::None);
        assert!(!status.reached_device());
    }

    #[test]
    fn test_status_pair_for_device_rejection() {
        let result: SepResult<()> = DeviceStatus::InvalDataSize.into_result();
        let status = OpStatus::from(&result);
        assert!(status.reached_device());
        assert_eq!(status.device, DeviceStatus::InvalDataSize);
        assert!(!status.is_success());
    }

    #[test]
    fn test_status_pair_for_success() {
        let result: SepResult<u32> = Ok(5);
        assert!(OpStatus::from(&result).is_success());
    }
}
