use crate::traits::{SecurityKind, TransportKind};
use crate::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Time allowed between opening the link and the first connection event.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Vendor scan error meaning the nearby-devices permission was revoked.
pub const PERMISSION_ERROR_CODE: i32 = 2;
/// Vendor scan error meaning the scan simply found nothing.
pub const NO_DEVICES_ERROR_CODE: i32 = 27;

/// Orchestrator policy knobs.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub connect_timeout: Duration,
    pub permission_error_code: i32,
    pub no_devices_error_code: Option<i32>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            permission_error_code: PERMISSION_ERROR_CODE,
            no_devices_error_code: Some(NO_DEVICES_ERROR_CODE),
        }
    }
}

/// 顶层守护进程配置
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub search: SearchDefaults,
    pub provisioner: ProvisionerConfig,
}

/// Values used when a search request leaves them out.
#[derive(Debug, Clone)]
pub struct SearchDefaults {
    pub device_prefix: String,
    pub transport: TransportKind,
    pub security: SecurityKind,
}

/// 用于解析 TOML 的临时结构
#[derive(Deserialize)]
struct DaemonConfigFile {
    /// [server] 表
    server: ServerToml,

    /// [provisioner] 表（可选）
    #[serde(default)]
    provisioner: ProvisionerToml,
}

#[derive(Deserialize)]
struct ServerToml {
    bind_addr: String,
    #[serde(default = "default_log_filter")]
    log_filter: String,
    device_prefix: String,
    transport: String,
    security: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Deserialize)]
#[serde(default)]
struct ProvisionerToml {
    connect_timeout_ms: u64,
    permission_error_code: i32,
    no_devices_error_code: Option<i32>,
}

impl Default for ProvisionerToml {
    fn default() -> Self {
        let defaults = ProvisionerConfig::default();
        Self {
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            permission_error_code: defaults.permission_error_code,
            no_devices_error_code: defaults.no_devices_error_code,
        }
    }
}

impl TryFrom<ProvisionerToml> for ProvisionerConfig {
    type Error = Error;

    fn try_from(t: ProvisionerToml) -> Result<Self> {
        if t.connect_timeout_ms == 0 {
            return Err(Error::Config("connect_timeout_ms must be greater than zero".into()));
        }
        Ok(ProvisionerConfig {
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            permission_error_code: t.permission_error_code,
            no_devices_error_code: t.no_devices_error_code,
        })
    }
}

impl TryFrom<DaemonConfigFile> for DaemonConfig {
    type Error = Error;

    fn try_from(t: DaemonConfigFile) -> Result<Self> {
        let bind_addr = SocketAddr::from_str(&t.server.bind_addr)
            .map_err(|e| Error::Config(format!("Invalid bind_addr '{}': {}", t.server.bind_addr, e)))?;
        // 不支持的传输方式在配置阶段就直接失败
        let transport = TransportKind::from_str(&t.server.transport)?.ensure_supported()?;
        let security = SecurityKind::from_str(&t.server.security)?;

        Ok(DaemonConfig {
            bind_addr,
            log_filter: t.server.log_filter,
            search: SearchDefaults {
                device_prefix: t.server.device_prefix,
                transport,
                security,
            },
            provisioner: ProvisionerConfig::try_from(t.provisioner)?,
        })
    }
}

/// 从 TOML 字符串加载守护进程配置
pub fn load_config_from_toml_str(s: &str) -> Result<DaemonConfig> {
    let parsed: DaemonConfigFile =
        toml::from_str(s).map_err(|e| Error::Config(format!("Failed to parse config TOML: {e}")))?;
    DaemonConfig::try_from(parsed)
}
