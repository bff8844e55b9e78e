//! Devices found by the most recent scan, keyed by advertised name.
//!
//! The registry is replaced wholesale when a scan starts and is otherwise
//! append-only. Disconnect never touches it: a failed connect (wrong proof of
//! possession, say) can be retried without rescanning.

use crate::traits::{DiscoveredDevice, SecurityKind, TransportKind};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Transport and security chosen at scan time and reused when connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub transport: TransportKind,
    pub security: SecurityKind,
}

#[derive(Debug, Default)]
struct Catalog {
    devices: HashMap<String, DiscoveredDevice>,
    params: Option<ScanParams>,
}

#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    catalog: RwLock<Catalog>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in an empty catalog. Names from earlier scans stop resolving.
    pub fn start_scan(&self, params: ScanParams) {
        let fresh = Catalog {
            devices: HashMap::new(),
            params: Some(params),
        };
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// First sighting wins; repeated advertisements are ignored.
    /// Returns `true` if the device was new.
    pub fn record_observation(&self, device: DiscoveredDevice) -> bool {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        if catalog.devices.contains_key(&device.name) {
            return false;
        }
        catalog.devices.insert(device.name.clone(), device);
        true
    }

    /// Current devices, sorted by name.
    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let mut devices: Vec<_> = catalog.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn lookup(&self, name: &str) -> Option<DiscoveredDevice> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog.devices.get(name).cloned()
    }

    /// Device and scan parameters read under one lock, so a concurrent
    /// rescan can't pair a device with another scan's parameters.
    pub(crate) fn resolve(&self, name: &str) -> Option<(DiscoveredDevice, ScanParams)> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let device = catalog.devices.get(name)?.clone();
        Some((device, catalog.params?))
    }

    pub fn len(&self) -> usize {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner).devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, rssi: i16) -> DiscoveredDevice {
        DiscoveredDevice {
            name: name.to_string(),
            service_uuid: None,
            rssi,
        }
    }

    fn params() -> ScanParams {
        ScanParams {
            transport: TransportKind::Ble,
            security: SecurityKind::Secure,
        }
    }

    #[test]
    fn test_first_seen_wins() {
        let registry = DiscoveryRegistry::new();
        registry.start_scan(params());

        assert!(registry.record_observation(device("A", -40)));
        assert!(!registry.record_observation(device("A", -90)));
        assert!(registry.record_observation(device("B", -60)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("A").unwrap().rssi, -40);
    }

    #[test]
    fn test_snapshot_is_sorted_and_restartable() {
        let registry = DiscoveryRegistry::new();
        registry.start_scan(params());
        for name in ["C", "A", "B"] {
            registry.record_observation(device(name, -50));
        }

        let names: Vec<_> = registry.snapshot().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["A", "B", "C"]);
        assert_eq!(registry.snapshot(), registry.snapshot());
    }

    #[test]
    fn test_start_scan_clears_previous_devices() {
        let registry = DiscoveryRegistry::new();
        registry.start_scan(params());
        registry.record_observation(device("A", -50));

        registry.start_scan(params());
        assert!(registry.is_empty());
        assert!(registry.lookup("A").is_none());
        assert!(registry.resolve("A").is_none());
    }

    #[test]
    fn test_resolve_pairs_device_with_scan_params() {
        let registry = DiscoveryRegistry::new();
        assert!(registry.resolve("A").is_none());

        registry.start_scan(params());
        registry.record_observation(device("A", -50));
        let (found, scan_params) = registry.resolve("A").unwrap();
        assert_eq!(found.name, "A");
        assert_eq!(scan_params, params());
    }
}
