//! The provisioning orchestrator.
//!
//! [`Provisioner`] sequences scan -> connect -> (wifi scan | custom data |
//! provision) -> disconnect against a [`BleBackend`], and classifies every
//! outcome into a [`crate::Error`] variant. All session state lives behind a
//! single async mutex, so a timeout and a connection event can never both
//! resolve the same connect. The mutex is never held across a transport call;
//! continuations re-check the session id after every await.

use crate::config::ProvisionerConfig;
use crate::registry::{DiscoveryRegistry, ScanParams};
use crate::router::{self, DisconnectMonitor, Resolution};
use crate::session::{ConnectionSession, SessionState};
use crate::traits::{
    AccessPoint, BleBackend, ChannelError, ConnectionEvent, DiscoveredDevice, ProvisionEvent,
    ProvisionFailureReason, ReadinessStatus, ScanEvent, SecureChannel, SecurityKind, TransportKind,
};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const NOTIFICATION_CAPACITY: usize = 32;

/// Out-of-band events, not tied to any particular call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Notification {
    UnexpectedlyDisconnected { device_name: String },
    ReadinessChanged { status: ReadinessStatus },
}

/// Proof that a connect succeeded. Post-connect operations are addressed by
/// device name; the handle itself grants nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    device_name: String,
    session_id: u64,
}

impl DeviceHandle {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }
}

#[derive(Default)]
struct SessionSlot {
    session: Option<ConnectionSession>,
    monitor: Option<DisconnectMonitor>,
}

impl SessionSlot {
    /// Stops monitoring, then marks the session finished. The caller releases
    /// the returned link once the lock is dropped.
    fn detach(&mut self, final_state: SessionState) -> Option<Arc<dyn SecureChannel>> {
        if let Some(monitor) = self.monitor.take() {
            monitor.disarm();
        }
        self.session.as_mut().and_then(|s| s.finish(final_state))
    }
}

struct Inner {
    backend: Arc<dyn BleBackend>,
    config: ProvisionerConfig,
    registry: DiscoveryRegistry,
    slot: Mutex<SessionSlot>,
    // Held for a whole device scan; scans share the registry.
    scan_lock: Mutex<()>,
    notifications: broadcast::Sender<Notification>,
    last_session_id: AtomicU64,
}

/// Cheap to clone; clones share the same registry and session.
#[derive(Clone)]
pub struct Provisioner {
    inner: Arc<Inner>,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn BleBackend>, config: ProvisionerConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                registry: DiscoveryRegistry::new(),
                slot: Mutex::new(SessionSlot::default()),
                scan_lock: Mutex::new(()),
                notifications,
                last_session_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.inner.config
    }

    /// Subscribes to [`Notification`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn status(&self) -> ReadinessStatus {
        self.inner.readiness()
    }

    pub async fn session_state(&self) -> SessionState {
        let slot = self.inner.slot.lock().await;
        slot.session
            .as_ref()
            .map_or(SessionState::Idle, ConnectionSession::state)
    }

    /// Devices from the most recent scan.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.registry.snapshot()
    }

    /// Forwards the gate's change signal as `ReadinessChanged` notifications.
    /// Returns `None` if the gate has no change signal.
    pub fn watch_readiness(&self) -> Option<JoinHandle<()>> {
        let mut changes = self.inner.backend.state_changes()?;
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        let status = inner.readiness();
                        tracing::info!(?status, "Bluetooth state change");
                        let _ = inner
                            .notifications
                            .send(Notification::ReadinessChanged { status });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Scans for devices advertising a name starting with `prefix`.
    ///
    /// The registry is reset before the scan starts, and `transport` and
    /// `security` are remembered for the next [`connect`](Self::connect).
    /// Scans run one at a time: a second caller waits for the first to
    /// finish, then starts its own scan.
    pub async fn scan(
        &self,
        prefix: &str,
        transport: TransportKind,
        security: SecurityKind,
    ) -> Result<Vec<DiscoveredDevice>> {
        self.inner.ensure_ready()?;
        let transport = transport.ensure_supported()?;

        let _scanning = self.inner.scan_lock.lock().await;
        self.inner
            .registry
            .start_scan(ScanParams { transport, security });
        tracing::info!(prefix, %transport, %security, "searching for devices");

        let mut events = self.inner.backend.start_scan(prefix).await;
        while let Some(event) = events.recv().await {
            match event {
                ScanEvent::Observed(device) => {
                    let name = device.name.clone();
                    if self.inner.registry.record_observation(device) {
                        tracing::debug!(device = %name, "device found");
                    }
                }
                ScanEvent::StartFailed => {
                    tracing::error!("couldn't start scan");
                    return Err(Error::ScanStartFailed);
                }
                ScanEvent::Completed => {
                    let devices = self.inner.registry.snapshot();
                    tracing::info!(count = devices.len(), "scan completed");
                    return Ok(devices);
                }
                ScanEvent::Failed(cause) => return self.scan_failed(cause),
            }
        }

        tracing::error!("scan stream ended without completing");
        Err(Error::ScanStreamFailed {
            permissions_issue: false,
            cause: ChannelError::new("scan stream closed before completion"),
        })
    }

    fn scan_failed(&self, cause: ChannelError) -> Result<Vec<DiscoveredDevice>> {
        let config = &self.inner.config;
        match cause.vendor_code() {
            // Permission revoked behind the OS API's back.
            Some(code) if code == config.permission_error_code => {
                tracing::warn!(code, %cause, "scan failed: nearby devices permission missing");
                Err(Error::ScanStreamFailed {
                    permissions_issue: true,
                    cause,
                })
            }
            Some(code) if Some(code) == config.no_devices_error_code => {
                tracing::info!(code, "scan completed without finding devices");
                Ok(self.inner.registry.snapshot())
            }
            _ => {
                tracing::error!(%cause, "BLE scan failed");
                Err(Error::ScanStreamFailed {
                    permissions_issue: false,
                    cause,
                })
            }
        }
    }

    /// Connects to a device from the last scan and initialises the secure
    /// session with `proof_of_possession`.
    pub async fn connect(&self, device_name: &str, proof_of_possession: &str) -> Result<DeviceHandle> {
        self.inner.ensure_ready()?;

        let Some((device, params)) = self.inner.registry.resolve(device_name) else {
            tracing::warn!(device = %device_name, "connect requested for unknown device");
            return Err(Error::DeviceNotFound(device_name.to_string()));
        };

        let (session_id, deadline, cancelled, replaced) = {
            let mut slot = self.inner.slot.lock().await;
            let mut replaced = None;
            if let Some(current) = slot.session.as_ref() {
                if current.state().is_pending() {
                    return Err(Error::ConnectInProgress(current.target().to_string()));
                }
                if current.state().is_live() {
                    tracing::info!(
                        previous = %current.target(),
                        next = %device_name,
                        "replacing established session"
                    );
                    replaced = slot.detach(SessionState::Disconnected);
                }
            }

            let session_id = self.inner.last_session_id.fetch_add(1, Ordering::Relaxed) + 1;
            let (cancel, cancelled) = oneshot::channel();
            let session = ConnectionSession::new(
                session_id,
                device.name.clone(),
                Instant::now() + self.inner.config.connect_timeout,
                cancel,
            );
            let deadline = session.deadline();
            slot.session = Some(session);
            (session_id, deadline, cancelled, replaced)
        };
        self.inner.release(replaced).await;

        // Subscribe before opening the link so an early event can't be missed.
        let mut events = self.inner.backend.events();
        tracing::info!(
            device = %device.name,
            service = ?device.service_uuid,
            transport = %params.transport,
            security = %params.security,
            "connecting"
        );
        let channel = self
            .inner
            .backend
            .connect(&device, params.transport, params.security)
            .await;

        let attached = {
            let mut slot = self.inner.slot.lock().await;
            match slot
                .session
                .as_mut()
                .filter(|s| s.id() == session_id && s.state() == SessionState::Connecting)
            {
                Some(session) => {
                    session.attach(Arc::clone(&channel));
                    true
                }
                None => false,
            }
        };
        if !attached {
            tracing::info!(device = %device_name, "session ended while the link was opening");
            self.inner.backend.disconnect(channel.as_ref()).await;
            return Err(Error::ConnectionFailed(device_name.to_string()));
        }

        match router::race(&mut events, device_name, deadline, cancelled).await {
            Resolution::Connected => {
                self.establish(session_id, device_name, proof_of_possession, events)
                    .await
            }
            Resolution::TimedOut => {
                tracing::error!(
                    device = %device_name,
                    timeout = ?self.inner.config.connect_timeout,
                    "timed out while trying to connect to device"
                );
                if self.inner.finish_pending(session_id, SessionState::TimedOut).await {
                    Err(Error::ConnectionTimedOut {
                        device_name: device_name.to_string(),
                    })
                } else {
                    Err(Error::ConnectionFailed(device_name.to_string()))
                }
            }
            Resolution::Failed(kind) => {
                tracing::error!(device = %device_name, ?kind, "device connection failed");
                self.inner.finish_pending(session_id, SessionState::Failed).await;
                Err(Error::ConnectionFailed(device_name.to_string()))
            }
            Resolution::Cancelled => {
                tracing::info!(device = %device_name, "connect cancelled by disconnect");
                Err(Error::ConnectionFailed(device_name.to_string()))
            }
        }
    }

    /// Link is up: start watching for drops, then bring up the secure session
    /// so a bad proof of possession fails here and not in a later call.
    ///
    /// `events` is the receiver that saw `Connected`; the monitor keeps
    /// reading from it.
    async fn establish(
        &self,
        session_id: u64,
        device_name: &str,
        proof_of_possession: &str,
        events: broadcast::Receiver<ConnectionEvent>,
    ) -> Result<DeviceHandle> {
        let channel = {
            let mut slot = self.inner.slot.lock().await;
            let Some((session, channel)) = slot
                .session
                .as_mut()
                .filter(|s| s.id() == session_id && s.state() == SessionState::Connecting)
                .and_then(|s| s.channel().cloned().map(|c| (s, c)))
            else {
                tracing::warn!(device = %device_name, "session ended before connect completed");
                return Err(Error::ConnectionFailed(device_name.to_string()));
            };
            session.transition(SessionState::Connected);

            slot.monitor = Some(self.inner.arm_monitor(session_id, device_name, events));
            channel
        };

        let init = channel.init_session(proof_of_possession).await;

        let mut slot = self.inner.slot.lock().await;
        let current = slot
            .session
            .as_ref()
            .is_some_and(|s| s.id() == session_id && s.state() == SessionState::Connected);

        match init {
            Ok(()) if current => {
                if let Some(session) = slot.session.as_mut() {
                    session.transition(SessionState::SessionEstablished);
                }
                tracing::info!(device = %device_name, session_id, "connected to device");
                Ok(DeviceHandle {
                    device_name: device_name.to_string(),
                    session_id,
                })
            }
            Ok(()) => {
                tracing::warn!(device = %device_name, "device went away during session init");
                Err(Error::ConnectionFailed(device_name.to_string()))
            }
            Err(cause) => {
                tracing::error!(device = %device_name, %cause, "session init failed");
                let link = if current { slot.detach(SessionState::Failed) } else { None };
                drop(slot);
                self.inner.release(link).await;
                Err(Error::SessionInitFailed {
                    device_name: device_name.to_string(),
                    cause,
                })
            }
        }
    }

    /// Asks the connected device for the Wi-Fi networks it can see.
    pub async fn scan_wifi_networks(&self, device_name: &str) -> Result<Vec<AccessPoint>> {
        self.inner.ensure_ready()?;
        let (session_id, channel) = self
            .inner
            .begin_operation(device_name, Some(SessionState::WifiScanning))
            .await?;

        tracing::info!(device = %device_name, "scanning for WiFi from device");
        let result = channel.scan_networks().await;
        self.inner
            .end_operation(session_id, SessionState::WifiScanning)
            .await;

        match result {
            Ok(networks) => {
                tracing::debug!(device = %device_name, count = networks.len(), "got networks");
                Ok(networks)
            }
            Err(cause) => {
                tracing::error!(device = %device_name, %cause, "error scanning wifi");
                Err(Error::WifiScanFailed { cause })
            }
        }
    }

    /// Hands Wi-Fi credentials to the device. Succeeds only if the device
    /// reports that it joined the network.
    pub async fn provision(&self, device_name: &str, ssid: &str, passphrase: &str) -> Result<()> {
        self.inner.ensure_ready()?;
        let (session_id, channel) = self
            .inner
            .begin_operation(device_name, Some(SessionState::Provisioning))
            .await?;

        tracing::info!(device = %device_name, ssid, "provisioning device");
        let mut progress = channel.send_credentials(ssid, passphrase).await;
        let outcome = await_provisioning(&mut progress, ssid).await;
        self.inner
            .end_operation(session_id, SessionState::Provisioning)
            .await;

        if outcome.is_ok() {
            tracing::info!(device = %device_name, ssid, "provisioned device");
        }
        outcome
    }

    /// Sends a UTF-8 string to a custom endpoint and returns the decoded reply.
    pub async fn send_custom_data(&self, device_name: &str, path: &str, payload: &str) -> Result<String> {
        self.inner.ensure_ready()?;
        let (_, channel) = self.inner.begin_operation(device_name, None).await?;

        tracing::debug!(device = %device_name, path, payload, "sending custom data");
        let reply = channel
            .send_to_endpoint(path, payload.as_bytes())
            .await
            .map_err(|cause| {
                tracing::error!(device = %device_name, path, %cause, "error sending custom data");
                Error::SendCustomDataFailed { cause }
            })?;

        let reply = String::from_utf8(reply).map_err(|e| Error::SendCustomDataFailed {
            cause: ChannelError::new(format!("response is not valid UTF-8: {e}")),
        })?;
        tracing::debug!(device = %device_name, path, reply = %reply, "sent custom data");
        Ok(reply)
    }

    /// Drops the connection to `device_name`, if there is one. Safe to call
    /// at any time; the discovery registry is kept for retries.
    pub async fn disconnect(&self, device_name: &str) {
        let mut slot = self.inner.slot.lock().await;
        let applies = slot
            .session
            .as_ref()
            .is_some_and(|s| s.is_disconnectable(device_name));
        if !applies {
            tracing::debug!(device = %device_name, "disconnect: no matching session");
            return;
        }
        let link = slot.detach(SessionState::Disconnected);
        drop(slot);
        self.inner.release(link).await;
        tracing::info!(device = %device_name, "disconnected");
    }
}

impl Inner {
    fn readiness(&self) -> ReadinessStatus {
        ReadinessStatus {
            supported: self.backend.is_hardware_present(),
            allowed: self.backend.is_permission_granted(),
            powered_on: self.backend.is_radio_powered_on(),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        self.readiness().check().inspect_err(|e| {
            tracing::warn!(error = %e, "Bluetooth not ready");
        })
    }

    fn arm_monitor(
        self: &Arc<Self>,
        session_id: u64,
        device_name: &str,
        events: broadcast::Receiver<ConnectionEvent>,
    ) -> DisconnectMonitor {
        let inner = Arc::clone(self);
        let name = device_name.to_string();
        DisconnectMonitor::arm(session_id, device_name.to_string(), events, async move {
            inner.unexpected_disconnect(session_id, name).await;
        })
    }

    /// Runs inside the monitor task: same teardown as an explicit disconnect,
    /// then the out-of-band notification.
    async fn unexpected_disconnect(&self, session_id: u64, device_name: String) {
        let mut slot = self.slot.lock().await;
        match slot.monitor.take() {
            // Dropping our own handle detaches it; aborting would cancel us.
            Some(monitor) if monitor.session_id() == session_id => drop(monitor),
            other => {
                slot.monitor = other;
                tracing::debug!(device = %device_name, "disconnect already handled");
                return;
            }
        }
        let link = slot.detach(SessionState::Disconnected);
        drop(slot);
        self.release(link).await;

        let _ = self
            .notifications
            .send(Notification::UnexpectedlyDisconnected { device_name });
    }

    /// Must be called without the slot lock.
    async fn release(&self, link: Option<Arc<dyn SecureChannel>>) {
        if let Some(link) = link {
            self.backend.disconnect(link.as_ref()).await;
        }
    }

    /// Settles a connect that never reached `Connected`. Returns `false` if
    /// the session had already been replaced or torn down.
    async fn finish_pending(&self, session_id: u64, final_state: SessionState) -> bool {
        let link = {
            let mut slot = self.slot.lock().await;
            let Some(session) = slot
                .session
                .as_mut()
                .filter(|s| s.id() == session_id && s.state().is_pending())
            else {
                return false;
            };
            session.finish(final_state)
        };
        self.release(link).await;
        true
    }

    async fn begin_operation(
        &self,
        device_name: &str,
        state: Option<SessionState>,
    ) -> Result<(u64, Arc<dyn SecureChannel>)> {
        let mut slot = self.slot.lock().await;
        let Some(session) = slot.session.as_mut() else {
            return Err(Error::DeviceNotFound(device_name.to_string()));
        };
        let Some(channel) = session.live_channel(device_name) else {
            return Err(Error::DeviceNotFound(device_name.to_string()));
        };
        if let Some(state) = state {
            session.transition(state);
        }
        Ok((session.id(), channel))
    }

    async fn end_operation(&self, session_id: u64, state: SessionState) {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot
            .session
            .as_mut()
            .filter(|s| s.id() == session_id && s.state() == state)
        {
            session.transition(SessionState::SessionEstablished);
        }
    }
}

/// Folds the secure channel's progress stream into one outcome.
async fn await_provisioning(progress: &mut mpsc::Receiver<ProvisionEvent>, ssid: &str) -> Result<()> {
    use ProvisionFailureReason::*;

    while let Some(event) = progress.recv().await {
        let (message, reason, cause) = match event {
            ProvisionEvent::ConfigSent => {
                tracing::debug!("WiFi config sent");
                continue;
            }
            ProvisionEvent::ConfigApplied => {
                tracing::debug!("WiFi config applied");
                continue;
            }
            ProvisionEvent::Succeeded => return Ok(()),
            ProvisionEvent::SessionCreateFailed(e) => {
                ("Couldn't create a secure session".to_string(), Unknown, Some(e))
            }
            ProvisionEvent::ConfigSendFailed(e) => {
                ("Failed to send WiFi config".to_string(), Unknown, Some(e))
            }
            ProvisionEvent::ConfigApplyFailed(e) => {
                ("Failed to apply WiFi config".to_string(), Unknown, Some(e))
            }
            ProvisionEvent::DeviceReported(reason) => (device_failure_message(reason, ssid), reason, None),
            ProvisionEvent::Failed(e) => (format!("Provisioning failed: {e}"), Unknown, Some(e)),
        };
        tracing::error!(%message, ?reason, cause = ?cause, "provisioning failed");
        return Err(Error::ProvisioningFailed {
            message,
            reason,
            cause,
        });
    }

    tracing::error!("provisioning stream ended without a result");
    Err(Error::ProvisioningFailed {
        message: "Provisioning ended without a result".to_string(),
        reason: Unknown,
        cause: None,
    })
}

fn device_failure_message(reason: ProvisionFailureReason, ssid: &str) -> String {
    match reason {
        ProvisionFailureReason::AuthFailed => {
            "WiFi credential error. Please check your SSID and password and try again".to_string()
        }
        ProvisionFailureReason::DeviceDisconnected => "Device disconnected unexpectedly".to_string(),
        ProvisionFailureReason::NetworkNotFound => format!("WiFi network not found: {ssid}"),
        ProvisionFailureReason::Unknown => "Unknown error".to_string(),
    }
}
