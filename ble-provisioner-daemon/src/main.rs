mod logging;
mod runner;

use anyhow::{Context, Result};
use ble_provisioner_core::config::{DaemonConfig, load_config_from_toml_str};
use std::sync::Arc;

// 如果没有选择任何后端，编译失败
#[cfg(not(feature = "backend_mock"))]
compile_error!(
    "No backend feature selected. Please choose one, e.g., --features ble-provisioner-daemon/backend_mock"
);

const DEFAULT_CONFIG: &str = include_str!("../../configs/daemon.toml");
const CONFIG_ENV: &str = "BLE_PROVISIONER_CONFIG";

fn load_config() -> Result<DaemonConfig> {
    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {path}"))?;
            load_config_from_toml_str(&text).with_context(|| format!("Invalid config file {path}"))?
        }
        Err(_) => load_config_from_toml_str(DEFAULT_CONFIG).context("Invalid built-in config")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置（日志过滤级别也来自配置）
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e:#}");
            std::process::exit(1);
        }
    };

    // 2. 初始化日志（这是入口点的职责）
    let log_control = Arc::new(logging::init(&config.log_filter));

    // 3. 调用核心逻辑
    if let Err(e) = runner::run(config, log_control).await {
        // 4. 处理顶层错误
        tracing::error!("❌ Provisioner failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
