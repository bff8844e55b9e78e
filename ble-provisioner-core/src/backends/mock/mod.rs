use crate::traits::{
    AccessPoint, ChannelError, ConnectionEvent, ConnectionEventKind, DeviceScanner,
    DeviceTransport, DiscoveredDevice, ProvisionEvent, ProvisionFailureReason, ReadinessGate,
    ScanEvent, SecureChannel, SecurityKind, TransportKind, WifiSecurity,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

/// Proof of possession the simulated devices accept.
pub const DEFAULT_POP: &str = "abcd1234";

const PROV_SERVICE_UUID: &str = "021a9004-0382-4aea-bff4-6b3f1c5adfb4";
const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkBehaviour {
    Accepts,
    Refuses,
    /// Never answers; the connect runs into its timeout.
    Silent,
}

struct MockDevice {
    name: &'static str,
    service_uuid: Option<&'static str>,
    rssi: i16,
    link: LinkBehaviour,
}

const DEVICES: &[MockDevice] = &[
    MockDevice {
        name: "PROV_5C3A91",
        service_uuid: Some(PROV_SERVICE_UUID),
        rssi: -48,
        link: LinkBehaviour::Accepts,
    },
    MockDevice {
        name: "PROV_7E19D2",
        service_uuid: Some(PROV_SERVICE_UUID),
        rssi: -71,
        link: LinkBehaviour::Accepts,
    },
    MockDevice {
        name: "PROV_D00DAD",
        service_uuid: Some(PROV_SERVICE_UUID),
        rssi: -80,
        link: LinkBehaviour::Refuses,
    },
    MockDevice {
        name: "PROV_51L3NT",
        service_uuid: None,
        rssi: -90,
        link: LinkBehaviour::Silent,
    },
    MockDevice {
        name: "Neighbor-Speaker",
        service_uuid: None,
        rssi: -62,
        link: LinkBehaviour::Accepts,
    },
];

/// A simulated BLE stack.
/// It advertises a fixed set of provisioning devices without any real radio.
pub struct MockBackend {
    hardware: AtomicBool,
    permission: AtomicBool,
    powered: AtomicBool,
    state_tx: broadcast::Sender<()>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    scan_interval: Duration,
    connect_delay: Duration,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            hardware: AtomicBool::new(true),
            permission: AtomicBool::new(true),
            powered: AtomicBool::new(true),
            state_tx,
            events_tx,
            scan_interval: Duration::from_millis(200),
            connect_delay: Duration::from_millis(500),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Simulates the user toggling the Bluetooth radio.
    pub fn set_powered(&self, on: bool) {
        self.powered.store(on, Ordering::SeqCst);
        tracing::info!(on, "[MockBackend] radio power changed");
        let _ = self.state_tx.send(());
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
        tracing::info!(granted, "[MockBackend] permission changed");
        let _ = self.state_tx.send(());
    }

    /// Simulates the adapter being unplugged.
    pub fn set_hardware_present(&self, present: bool) {
        self.hardware.store(present, Ordering::SeqCst);
        tracing::info!(present, "[MockBackend] adapter presence changed");
        let _ = self.state_tx.send(());
    }

    /// Simulates the device going out of range.
    pub fn drop_link(&self, device_name: &str) {
        tracing::info!(device = %device_name, "[MockBackend] dropping link (simulated)");
        let _ = self
            .events_tx
            .send(ConnectionEvent::new(device_name, ConnectionEventKind::Disconnected));
    }
}

impl ReadinessGate for MockBackend {
    fn is_hardware_present(&self) -> bool {
        self.hardware.load(Ordering::SeqCst)
    }

    fn is_permission_granted(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    fn is_radio_powered_on(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn state_changes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.state_tx.subscribe())
    }
}

#[async_trait]
impl DeviceScanner for MockBackend {
    async fn start_scan(&self, prefix: &str) -> mpsc::Receiver<ScanEvent> {
        tracing::debug!(prefix, "[MockBackend] scanning for devices...");
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let prefix = prefix.to_string();
        let interval = self.scan_interval;

        tokio::spawn(async move {
            let matching: Vec<_> = DEVICES.iter().filter(|d| d.name.starts_with(&prefix)).collect();
            if matching.is_empty() {
                sleep(interval).await;
                // Same shape as the vendor SDK's "nothing found" report.
                let _ = tx
                    .send(ScanEvent::Failed(ChannelError::new("Scan failed, errorCode=27")))
                    .await;
                return;
            }

            // Real devices advertise repeatedly; so do these.
            for _ in 0..2 {
                for device in &matching {
                    sleep(interval).await;
                    let observed = DiscoveredDevice {
                        name: device.name.to_string(),
                        service_uuid: device.service_uuid.map(str::to_string),
                        rssi: device.rssi,
                    };
                    if tx.send(ScanEvent::Observed(observed)).await.is_err() {
                        return;
                    }
                }
            }
            let _ = tx.send(ScanEvent::Completed).await;
        });
        rx
    }
}

#[async_trait]
impl DeviceTransport for MockBackend {
    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    async fn connect(
        &self,
        device: &DiscoveredDevice,
        transport: TransportKind,
        security: SecurityKind,
    ) -> Arc<dyn SecureChannel> {
        tracing::info!(device = %device.name, %transport, %security, "[MockBackend] opening link");
        let link = DEVICES
            .iter()
            .find(|d| d.name == device.name)
            .map_or(LinkBehaviour::Silent, |d| d.link);

        let kind = match link {
            LinkBehaviour::Accepts => Some(ConnectionEventKind::Connected),
            LinkBehaviour::Refuses => Some(ConnectionEventKind::ConnectFailed),
            LinkBehaviour::Silent => None,
        };
        if let Some(kind) = kind {
            let events_tx = self.events_tx.clone();
            let name = device.name.clone();
            let delay = self.connect_delay;
            tokio::spawn(async move {
                sleep(delay).await;
                let _ = events_tx.send(ConnectionEvent::new(name, kind));
            });
        }

        Arc::new(MockChannel::new(device.name.clone(), security))
    }

    async fn disconnect(&self, channel: &dyn SecureChannel) {
        tracing::info!(device = %channel.device_name(), "[MockBackend] closing link");
        let _ = self.events_tx.send(ConnectionEvent::new(
            channel.device_name(),
            ConnectionEventKind::Disconnected,
        ));
    }
}

/// Secure session with one simulated device.
pub struct MockChannel {
    device_name: String,
    security: SecurityKind,
    established: AtomicBool,
}

impl MockChannel {
    fn new(device_name: String, security: SecurityKind) -> Self {
        Self {
            device_name,
            security,
            established: AtomicBool::new(false),
        }
    }

    fn ensure_established(&self) -> Result<(), ChannelError> {
        if self.established.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::new("Session is not established"))
        }
    }
}

fn mock_networks() -> Vec<AccessPoint> {
    vec![
        AccessPoint {
            ssid: "MyHomeWiFi".to_string(),
            rssi: -38,
            security: WifiSecurity::Wpa3Psk,
        },
        AccessPoint {
            ssid: "CafeGuest".to_string(),
            rssi: -55,
            security: WifiSecurity::Open,
        },
        AccessPoint {
            ssid: "Neighbor's Network".to_string(),
            rssi: -72,
            security: WifiSecurity::Wpa2Psk,
        },
        AccessPoint {
            ssid: "xfinitywifi".to_string(),
            rssi: -61,
            security: WifiSecurity::Wpa2Psk,
        },
        AccessPoint {
            ssid: "HiddenNetwork".to_string(),
            rssi: -84,
            security: WifiSecurity::Wpa2Psk,
        },
    ]
}

/// What the simulated device reports after applying `ssid`.
fn device_verdict(ssid: &str) -> ProvisionEvent {
    match ssid {
        // 模拟密码错误
        "xfinitywifi" => ProvisionEvent::DeviceReported(ProvisionFailureReason::AuthFailed),
        // 模拟设备在加入网络时掉线
        "HiddenNetwork" => ProvisionEvent::DeviceReported(ProvisionFailureReason::DeviceDisconnected),
        known if mock_networks().iter().any(|n| n.ssid == known) => ProvisionEvent::Succeeded,
        _ => ProvisionEvent::DeviceReported(ProvisionFailureReason::NetworkNotFound),
    }
}

#[async_trait]
impl SecureChannel for MockChannel {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    async fn init_session(&self, proof_of_possession: &str) -> Result<(), ChannelError> {
        if self.security == SecurityKind::Secure && proof_of_possession != DEFAULT_POP {
            tracing::debug!(device = %self.device_name, "[MockBackend] rejecting proof of possession");
            return Err(ChannelError::new("Security handshake failed: wrong proof of possession"));
        }
        self.established.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn scan_networks(&self) -> Result<Vec<AccessPoint>, ChannelError> {
        self.ensure_established()?;
        sleep(Duration::from_secs(2)).await;
        Ok(mock_networks())
    }

    async fn send_credentials(&self, ssid: &str, passphrase: &str) -> mpsc::Receiver<ProvisionEvent> {
        tracing::debug!(
            device = %self.device_name,
            ssid,
            passphrase = if passphrase.is_empty() { "(empty)" } else { "********" },
            "[MockBackend] applying WiFi config"
        );
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let established = self.ensure_established();
        let ssid = ssid.to_string();

        tokio::spawn(async move {
            if let Err(e) = established {
                let _ = tx.send(ProvisionEvent::SessionCreateFailed(e)).await;
                return;
            }
            if ssid.is_empty() {
                let _ = tx
                    .send(ProvisionEvent::ConfigSendFailed(ChannelError::new("SSID must not be empty")))
                    .await;
                return;
            }
            let steps = [ProvisionEvent::ConfigSent, ProvisionEvent::ConfigApplied, device_verdict(&ssid)];
            for step in steps {
                sleep(Duration::from_millis(500)).await;
                if tx.send(step).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    async fn send_to_endpoint(&self, path: &str, data: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.ensure_established()?;
        if path.is_empty() {
            return Err(ChannelError::new("Endpoint path must not be empty"));
        }
        Ok(String::from_utf8_lossy(data).to_uppercase().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<ScanEvent>) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_honours_prefix_and_repeats_advertisements() {
        let backend = MockBackend::new();
        let events = drain(backend.start_scan("PROV_").await).await;

        let observed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Observed(d) => Some(d.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(observed.len(), 8);
        assert!(observed.iter().all(|n| n.starts_with("PROV_")));
        assert!(matches!(events.last(), Some(ScanEvent::Completed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_without_matches_reports_no_devices_code() {
        let backend = MockBackend::new();
        let events = drain(backend.start_scan("NOPE_").await).await;
        match events.as_slice() {
            [ScanEvent::Failed(e)] => assert_eq!(e.vendor_code(), Some(27)),
            other => panic!("unexpected scan events: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publishes_event_after_delay() {
        let backend = MockBackend::new();
        let mut events = backend.events();
        let device = DiscoveredDevice {
            name: "PROV_D00DAD".to_string(),
            service_uuid: None,
            rssi: -80,
        };

        let channel = backend
            .connect(&device, TransportKind::Ble, SecurityKind::Secure)
            .await;
        assert_eq!(channel.device_name(), "PROV_D00DAD");

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ConnectionEventKind::ConnectFailed);
    }

    #[tokio::test]
    async fn test_channel_requires_pop_for_secure_sessions() {
        let channel = MockChannel::new("PROV_5C3A91".to_string(), SecurityKind::Secure);
        assert!(channel.scan_networks().await.is_err());
        assert!(channel.init_session("wrong").await.is_err());
        channel.init_session(DEFAULT_POP).await.unwrap();
        assert_eq!(channel.send_to_endpoint("/ep", b"hi").await.unwrap(), b"HI");

        let open = MockChannel::new("PROV_5C3A91".to_string(), SecurityKind::Unsecure);
        assert!(open.init_session("").await.is_ok());
    }

    #[test]
    fn test_device_verdicts() {
        assert!(matches!(device_verdict("MyHomeWiFi"), ProvisionEvent::Succeeded));
        assert!(matches!(
            device_verdict("xfinitywifi"),
            ProvisionEvent::DeviceReported(ProvisionFailureReason::AuthFailed)
        ));
        assert!(matches!(
            device_verdict("Elsewhere"),
            ProvisionEvent::DeviceReported(ProvisionFailureReason::NetworkNotFound)
        ));
    }
}
