use ble_provisioner_core::config::DaemonConfig;
use ble_provisioner_core::traits::{BleBackend, LogControl};
use ble_provisioner_core::{Provisioner, web_server};
use std::sync::Arc;

// 基于特性，在编译时决定实例化哪个后端
#[cfg(feature = "backend_mock")]
fn get_backend() -> Arc<dyn BleBackend> {
    use ble_provisioner_core::backends::mock::MockBackend;
    tracing::info!("🚀 Using Mock Backend");
    Arc::new(MockBackend::new())
}

/// Wires the backend into a [`Provisioner`] and serves the command surface
/// until the server stops.
pub async fn run(config: DaemonConfig, log_control: Arc<dyn LogControl>) -> anyhow::Result<()> {
    let backend = get_backend();
    tracing::info!(
        connect_timeout = ?config.provisioner.connect_timeout,
        prefix = %config.search.device_prefix,
        "📡 Runner: starting provisioner"
    );

    let provisioner = Provisioner::new(backend, config.provisioner);
    let _readiness = provisioner.watch_readiness();

    web_server::start_web_server(provisioner, log_control, config.search, config.bind_addr).await??;
    Ok(())
}
