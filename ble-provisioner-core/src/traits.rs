use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

// 在这里定义编排引擎与外部协作者（BLE 协议栈、安全会话）之间的数据结构和 trait。

/// A provisioning device seen during a BLE scan.
/// BLE 扫描时发现的单个设备。名称即唯一键。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub name: String,
    pub service_uuid: Option<String>,
    pub rssi: i16,
}

/// Security mode reported for a Wi-Fi network seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WifiSecurity {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa2Enterprise,
    Wpa3Psk,
    Wpa2Wpa3Psk,
    Unknown,
}

/// A single Wi-Fi network found by the device's own scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessPoint {
    pub ssid: String,
    pub rssi: i16,
    pub security: WifiSecurity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ble,
    SoftAp,
}

impl TransportKind {
    /// Only BLE is wired up; SoftAP is rejected before any device I/O happens.
    pub fn ensure_supported(self) -> Result<Self> {
        match self {
            TransportKind::Ble => Ok(self),
            TransportKind::SoftAp => Err(Error::UnsupportedTransport(self)),
        }
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ble" => Ok(TransportKind::Ble),
            "softap" => Ok(TransportKind::SoftAp),
            other => Err(Error::Config(format!("Unknown transport type: {other}"))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Ble => "ble",
            TransportKind::SoftAp => "softap",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityKind {
    Unsecure,
    Secure,
}

impl FromStr for SecurityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unsecure" => Ok(SecurityKind::Unsecure),
            "secure" => Ok(SecurityKind::Secure),
            other => Err(Error::Config(format!("Unknown security type: {other}"))),
        }
    }
}

impl fmt::Display for SecurityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityKind::Unsecure => "unsecure",
            SecurityKind::Secure => "secure",
        })
    }
}

/// A failure reported by the BLE stack or the secure channel.
///
/// Vendor SDKs report numeric error codes either as a field or embedded in
/// the message text (`"... errorCode=2"`); [`ChannelError::vendor_code`]
/// looks at both.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ChannelError {
    pub message: String,
    pub code: Option<i32>,
}

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn vendor_code(&self) -> Option<i32> {
        self.code.or_else(|| parse_error_code(&self.message))
    }
}

/// Extracts `n` from an `errorCode=n` token. The digits are parsed as a whole,
/// so `errorCode=27` is 27 and never 2.
fn parse_error_code(message: &str) -> Option<i32> {
    const MARKER: &str = "errorCode=";
    let start = message.find(MARKER)? + MARKER.len();
    let rest = &message[start..];
    let end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map_or(rest.len(), |(i, _)| i);
    rest[..end].parse().ok()
}

/// One item of the scan callback stream.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Observed(DiscoveredDevice),
    StartFailed,
    Completed,
    Failed(ChannelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    ConnectFailed,
}

/// Published on the connection-event bus, scoped to a device name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub device_name: String,
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    pub fn new(device_name: impl Into<String>, kind: ConnectionEventKind) -> Self {
        Self {
            device_name: device_name.into(),
            kind,
        }
    }
}

/// Why the device itself rejected the credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionFailureReason {
    AuthFailed,
    DeviceDisconnected,
    NetworkNotFound,
    Unknown,
}

/// Progress of a credential hand-off, as reported by the secure channel.
#[derive(Debug, Clone)]
pub enum ProvisionEvent {
    SessionCreateFailed(ChannelError),
    ConfigSent,
    ConfigSendFailed(ChannelError),
    ConfigApplied,
    ConfigApplyFailed(ChannelError),
    DeviceReported(ProvisionFailureReason),
    Failed(ChannelError),
    Succeeded,
}

/// Snapshot of the readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessStatus {
    pub supported: bool,
    pub allowed: bool,
    pub powered_on: bool,
}

impl ReadinessStatus {
    /// Checks hardware, then permission, then radio power.
    pub fn check(&self) -> Result<()> {
        use crate::NotReadyReason::*;

        if !self.supported {
            return Err(Error::BluetoothNotReady(Unsupported));
        }
        if !self.allowed {
            return Err(Error::BluetoothNotReady(PermissionDenied));
        }
        if !self.powered_on {
            return Err(Error::BluetoothNotReady(PoweredOff));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// 协作者接口

/// 平台能力检查：硬件、权限、射频开关。
pub trait ReadinessGate: Send + Sync {
    fn is_hardware_present(&self) -> bool;

    fn is_permission_granted(&self) -> bool;

    fn is_radio_powered_on(&self) -> bool;

    /// Fires whenever the adapter state may have changed.
    fn state_changes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

/// BLE 广播扫描原语。
#[async_trait]
pub trait DeviceScanner: Send + Sync {
    /// Starts scanning for devices whose advertised name starts with `prefix`.
    /// The stream ends with `Completed`, `StartFailed` or `Failed`.
    async fn start_scan(&self, prefix: &str) -> mpsc::Receiver<ScanEvent>;
}

/// 设备级连接。连接结果不直接返回，而是通过事件总线发布。
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Subscribes to the connection-event bus.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Opens the link to `device`. The handle is usable once a `Connected`
    /// event for the device has been published.
    async fn connect(
        &self,
        device: &DiscoveredDevice,
        transport: TransportKind,
        security: SecurityKind,
    ) -> Arc<dyn SecureChannel>;

    async fn disconnect(&self, channel: &dyn SecureChannel);
}

/// Encrypted session layered over a connected device.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    fn device_name(&self) -> &str;

    async fn init_session(&self, proof_of_possession: &str) -> std::result::Result<(), ChannelError>;

    async fn scan_networks(&self) -> std::result::Result<Vec<AccessPoint>, ChannelError>;

    /// Sends the credentials; progress arrives on the returned stream.
    async fn send_credentials(&self, ssid: &str, passphrase: &str) -> mpsc::Receiver<ProvisionEvent>;

    async fn send_to_endpoint(
        &self,
        path: &str,
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, ChannelError>;
}

/// Everything the orchestrator needs from a BLE stack.
pub trait BleBackend: ReadinessGate + DeviceScanner + DeviceTransport {}

impl<T> BleBackend for T where T: ReadinessGate + DeviceScanner + DeviceTransport + ?Sized {}

/// 运行时日志级别切换。
pub trait LogControl: Send + Sync {
    fn set_verbose(&self, enabled: bool) -> Result<()>;

    fn is_verbose(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_code_from_message() {
        let err = ChannelError::new("Scan failed with errorCode=2");
        assert_eq!(err.vendor_code(), Some(2));

        let err = ChannelError::new("errorCode=27, no devices");
        assert_eq!(err.vendor_code(), Some(27));

        let err = ChannelError::new("radio busy");
        assert_eq!(err.vendor_code(), None);
    }

    #[test]
    fn test_vendor_code_field_wins() {
        let err = ChannelError::with_code("errorCode=2", 5);
        assert_eq!(err.vendor_code(), Some(5));
    }

    #[test]
    fn test_transport_parsing() {
        assert_eq!("ble".parse::<TransportKind>().unwrap(), TransportKind::Ble);
        assert_eq!("softap".parse::<TransportKind>().unwrap(), TransportKind::SoftAp);
        assert!("usb".parse::<TransportKind>().is_err());
        assert!(TransportKind::SoftAp.ensure_supported().is_err());
        assert_eq!("secure".parse::<SecurityKind>().unwrap(), SecurityKind::Secure);
    }

    #[test]
    fn test_readiness_checks_in_order() {
        let status = ReadinessStatus {
            supported: false,
            allowed: false,
            powered_on: false,
        };
        assert!(matches!(
            status.check(),
            Err(Error::BluetoothNotReady(crate::NotReadyReason::Unsupported))
        ));

        let status = ReadinessStatus {
            supported: true,
            allowed: true,
            powered_on: false,
        };
        assert!(matches!(
            status.check(),
            Err(Error::BluetoothNotReady(crate::NotReadyReason::PoweredOff))
        ));
    }
}
