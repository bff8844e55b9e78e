#![cfg(feature = "backend_mock")]

use ble_provisioner_core::backends::mock::{DEFAULT_POP, MockBackend};
use ble_provisioner_core::config::ProvisionerConfig;
use ble_provisioner_core::session::SessionState;
use ble_provisioner_core::traits::{DiscoveredDevice, ReadinessStatus, SecurityKind, TransportKind};
use ble_provisioner_core::{Error, NotReadyReason, Notification, Provisioner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn provisioner(backend: &Arc<MockBackend>) -> Provisioner {
    Provisioner::new(backend.clone(), ProvisionerConfig::default())
}

async fn next_note(notes: &mut broadcast::Receiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), notes.recv())
        .await
        .expect("no notification arrived")
        .unwrap()
}

fn names(devices: Vec<DiscoveredDevice>) -> Vec<String> {
    devices.into_iter().map(|d| d.name).collect()
}

fn readiness(note: Notification) -> ReadinessStatus {
    match note {
        Notification::ReadinessChanged { status } => status,
        other => panic!("expected ReadinessChanged, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_radio_toggles_are_forwarded_and_gate_calls() {
    let backend = Arc::new(MockBackend::new());
    let p = provisioner(&backend);
    let mut notes = p.subscribe();
    let _watch = p.watch_readiness().unwrap();

    backend.set_powered(false);
    let status = readiness(next_note(&mut notes).await);
    assert!(status.supported);
    assert!(!status.powered_on);
    let err = p
        .scan("PROV_", TransportKind::Ble, SecurityKind::Secure)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BluetoothNotReady(NotReadyReason::PoweredOff)));

    backend.set_powered(true);
    assert!(readiness(next_note(&mut notes).await).powered_on);

    backend.set_permission(false);
    let status = readiness(next_note(&mut notes).await);
    assert!(!status.allowed);
    assert!(matches!(
        p.status().check(),
        Err(Error::BluetoothNotReady(NotReadyReason::PermissionDenied))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_missing_adapter_is_unsupported() {
    let backend = Arc::new(MockBackend::new());
    let p = provisioner(&backend);
    let mut notes = p.subscribe();
    let _watch = p.watch_readiness().unwrap();

    backend.set_hardware_present(false);
    assert!(!readiness(next_note(&mut notes).await).supported);
    let err = p.connect("PROV_5C3A91", DEFAULT_POP).await.unwrap_err();
    assert!(matches!(err, Error::BluetoothNotReady(NotReadyReason::Unsupported)));
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_after_connect_is_reported() {
    let backend = Arc::new(MockBackend::new().with_connect_delay(Duration::from_millis(10)));
    let p = provisioner(&backend);
    p.scan("PROV_5C3A91", TransportKind::Ble, SecurityKind::Secure)
        .await
        .unwrap();

    let handle = p.connect("PROV_5C3A91", DEFAULT_POP).await.unwrap();
    assert_eq!(handle.device_name(), "PROV_5C3A91");
    let mut notes = p.subscribe();

    backend.drop_link("PROV_5C3A91");
    assert_eq!(
        next_note(&mut notes).await,
        Notification::UnexpectedlyDisconnected {
            device_name: "PROV_5C3A91".to_string()
        }
    );
    assert_eq!(p.session_state().await, SessionState::Disconnected);
    assert!(matches!(
        p.scan_wifi_networks("PROV_5C3A91").await,
        Err(Error::DeviceNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_scans_keep_their_own_results() {
    let backend = Arc::new(MockBackend::new());
    let p = provisioner(&backend);

    let (first, second) = tokio::join!(
        p.scan("PROV_5", TransportKind::Ble, SecurityKind::Secure),
        p.scan("PROV_7", TransportKind::Ble, SecurityKind::Secure),
    );
    assert_eq!(names(first.unwrap()), ["PROV_5C3A91"]);
    assert_eq!(names(second.unwrap()), ["PROV_7E19D2"]);
    // the later scan owns the registry
    assert_eq!(names(p.discovered_devices()), ["PROV_7E19D2"]);
}
