//! Core library for the BLE Wi-Fi provisioner.
//! This crate defines the collaborator traits (readiness gate, BLE scanner,
//! device transport, secure channel), the orchestration engine that drives a
//! device from discovery to provisioned, and a thin HTTP command surface.
//! Backends are selected by feature flags.

pub mod traits;
pub mod backends;
pub mod config;
pub mod registry;
pub mod session;
pub mod provisioner;
pub mod web_server;

mod router;

// Define a shared Error and Result type for the entire crate.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use traits::{ChannelError, ProvisionFailureReason, TransportKind};

pub use provisioner::{DeviceHandle, Notification, Provisioner};

/// Which part of the readiness gate rejected an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotReadyReason {
    Unsupported,
    PermissionDenied,
    PoweredOff,
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            NotReadyReason::Unsupported => "Bluetooth is required",
            NotReadyReason::PermissionDenied => {
                "Bluetooth (Nearby Devices) and Location permissions are required"
            }
            NotReadyReason::PoweredOff => "Bluetooth must be enabled",
        };
        f.write_str(message)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    BluetoothNotReady(NotReadyReason),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Couldn't start scan")]
    ScanStartFailed,

    #[error("{}", scan_stream_message(.permissions_issue, .cause))]
    ScanStreamFailed {
        permissions_issue: bool,
        #[source]
        cause: ChannelError,
    },

    #[error("Connection timed out: {device_name}")]
    ConnectionTimedOut { device_name: String },

    #[error("Device connection failed: {0}")]
    ConnectionFailed(String),

    #[error("A connection to {0} is already in progress")]
    ConnectInProgress(String),

    #[error("Failed to initialise session with the device. [sessionInitError] {cause}")]
    SessionInitFailed {
        device_name: String,
        #[source]
        cause: ChannelError,
    },

    #[error("WiFi scan failed: {cause}")]
    WifiScanFailed {
        #[source]
        cause: ChannelError,
    },

    #[error("WiFi provisioning failed: {message}")]
    ProvisioningFailed {
        message: String,
        reason: ProvisionFailureReason,
        #[source]
        cause: Option<ChannelError>,
    },

    #[error("Error sending custom data string: {cause}")]
    SendCustomDataFailed {
        #[source]
        cause: ChannelError,
    },

    #[error("{0} transport is not supported")]
    UnsupportedTransport(TransportKind),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn scan_stream_message(permissions_issue: &bool, cause: &ChannelError) -> String {
    if *permissions_issue {
        "Bluetooth (Nearby Devices) and Location permissions are required".to_string()
    } else {
        format!("BLE Scan failed: {cause}")
    }
}

impl Error {
    /// Stable, machine-readable kind used by the command surface.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BluetoothNotReady(_) => "BLUETOOTH_NOT_READY",
            Error::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Error::ScanStartFailed => "SCAN_START_FAILED",
            Error::ScanStreamFailed {
                permissions_issue: true,
                ..
            } => "PERMISSIONS_ISSUE",
            Error::ScanStreamFailed { .. } => "SCAN_FAILED",
            Error::ConnectionTimedOut { .. } => "CONNECTION_TIMED_OUT",
            Error::ConnectionFailed(_) => "CONNECTION_FAILED",
            Error::ConnectInProgress(_) => "CONNECT_IN_PROGRESS",
            Error::SessionInitFailed { .. } => "SESSION_INIT_FAILED",
            Error::WifiScanFailed { .. } => "WIFI_SCAN_FAILED",
            Error::ProvisioningFailed { .. } => "PROVISIONING_FAILED",
            Error::SendCustomDataFailed { .. } => "SEND_CUSTOM_DATA_FAILED",
            Error::UnsupportedTransport(_) => "UNSUPPORTED_TRANSPORT",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_issue_has_its_own_code() {
        let err = Error::ScanStreamFailed {
            permissions_issue: true,
            cause: ChannelError::with_code("scan failed", 2),
        };
        assert_eq!(err.code(), "PERMISSIONS_ISSUE");
        assert_eq!(
            err.to_string(),
            "Bluetooth (Nearby Devices) and Location permissions are required"
        );

        let err = Error::ScanStreamFailed {
            permissions_issue: false,
            cause: ChannelError::new("radio busy"),
        };
        assert_eq!(err.code(), "SCAN_FAILED");
        assert_eq!(err.to_string(), "BLE Scan failed: radio busy");
    }

    #[test]
    fn test_provisioning_failure_keeps_source() {
        use std::error::Error as _;

        let err = Error::ProvisioningFailed {
            message: "Failed to send WiFi config".to_string(),
            reason: ProvisionFailureReason::Unknown,
            cause: Some(ChannelError::new("write timed out")),
        };
        assert_eq!(err.to_string(), "WiFi provisioning failed: Failed to send WiFi config");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("write timed out"));
    }
}
