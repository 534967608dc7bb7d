//! 网关运行配置加载。
//!
//! 进程启动时读取一次，之后不可变，显式传入各组件构造函数。

use domain::ModuleIdentity;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 网关运行配置。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub module_id: String,
    pub device_id: String,
    pub generation_id: String,
    pub iothub_hostname: String,
    pub health_check_retries: u32,
    pub health_check_interval_seconds: u64,
    pub connect_attempts: u32,
    pub connect_retry_seconds: u64,
    pub module_settle_seconds: u64,
    pub restart_grace_seconds: u64,
    pub ready_timeout_seconds: u64,
    pub adapter_module_id: String,
    pub dps_id_scope: String,
    pub storage_root: PathBuf,
    pub redis_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub http_addr: String,
    pub chunk_poll_interval_ms: u64,
    pub chunk_max_poll_seconds: Option<u64>,
}

impl GatewayConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let module_id = read_required("IOTEDGE_MODULEID")?;
        let device_id = read_required("IOTEDGE_DEVICEID")?;
        let generation_id = env::var("IOTEDGE_MODULEGENERATIONID").unwrap_or_default();
        let iothub_hostname = env::var("IOTEDGE_IOTHUBHOSTNAME").unwrap_or_default();
        // 兼容旧部署清单里的驼峰变量名。
        let health_check_retries =
            read_u32_with_default(&["GW_HEALTH_CHECK_RETRIES", "healthCheckRetries"], 3)?;
        let health_check_interval_seconds =
            read_u64_with_default("GW_HEALTH_CHECK_INTERVAL_SECONDS", 15)?;
        let connect_attempts = read_u32_with_default(&["GW_CONNECT_ATTEMPTS"], 3)?.max(1);
        let connect_retry_seconds = read_u64_with_default("GW_CONNECT_RETRY_SECONDS", 5)?;
        let module_settle_seconds = read_u64_with_default("GW_MODULE_SETTLE_SECONDS", 15)?;
        let restart_grace_seconds = read_u64_with_default("GW_RESTART_GRACE_SECONDS", 5)?;
        let ready_timeout_seconds = read_u64_with_default("GW_READY_TIMEOUT_SECONDS", 300)?;
        let adapter_module_id = read_first(&["GW_ADAPTER_MODULE_ID", "opcPublisherAdapterModuleId"])
            .unwrap_or_else(|| "opcpublisher".to_string());
        let dps_id_scope = env::var("GW_DPS_ID_SCOPE").unwrap_or_default();
        let storage_root = PathBuf::from(
            env::var("GW_STORAGE_ROOT").unwrap_or_else(|_| "/data/storage".to_string()),
        );
        let redis_url =
            env::var("GW_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let mqtt_host = env::var("GW_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = read_u16_with_default("GW_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("GW_MQTT_USERNAME");
        let mqtt_password = read_optional("GW_MQTT_PASSWORD");
        let http_addr = env::var("GW_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:9070".to_string());
        let chunk_poll_interval_ms = read_u64_with_default("GW_CHUNK_POLL_INTERVAL_MS", 1000)?;
        let chunk_max_poll_seconds =
            read_optional_u64("GW_CHUNK_MAX_POLL_SECONDS")?.filter(|value| *value > 0);

        Ok(Self {
            module_id,
            device_id,
            generation_id,
            iothub_hostname,
            health_check_retries,
            health_check_interval_seconds,
            connect_attempts,
            connect_retry_seconds,
            module_settle_seconds,
            restart_grace_seconds,
            ready_timeout_seconds,
            adapter_module_id,
            dps_id_scope,
            storage_root,
            redis_url,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            http_addr,
            chunk_poll_interval_ms,
            chunk_max_poll_seconds,
        })
    }

    pub fn identity(&self) -> ModuleIdentity {
        ModuleIdentity::new(&self.module_id, &self.device_id, &self.generation_id)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_seconds)
    }

    pub fn module_settle_delay(&self) -> Duration {
        Duration::from_secs(self.module_settle_seconds)
    }

    /// 等待第一份期望属性的时限；0 表示一直等待。
    pub fn ready_timeout(&self) -> Option<Duration> {
        Some(self.ready_timeout_seconds)
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }

    pub fn chunk_poll_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_poll_interval_ms.max(1))
    }

    pub fn chunk_max_poll_duration(&self) -> Option<Duration> {
        self.chunk_max_poll_seconds.map(Duration::from_secs)
    }
}

fn read_required(key: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key.to_string())),
    }
}

/// 按顺序读取第一个非空的变量。
fn read_first(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| read_optional(key))
}

fn read_u32_with_default(keys: &[&str], default: u32) -> Result<u32, ConfigError> {
    for key in keys {
        if let Some(value) = read_optional(key) {
            return value
                .parse::<u32>()
                .map_err(|_| ConfigError::Invalid(key.to_string(), value));
        }
    }
    Ok(default)
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_optional_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        Err(_) => Ok(None),
    }
}
