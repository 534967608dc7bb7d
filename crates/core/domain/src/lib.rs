pub mod device;

pub use device::{
    ConnectionDescriptor, DeviceCacheEntry, DeviceProvisionInfo, OpcEndpoint, OpcEndpointCredentials,
    PublishedNode, PublishNodesRequest,
};

use serde::{Deserialize, Serialize};

/// 模块身份：进程生命周期内不可变，由运行环境提供。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleIdentity {
    pub module_id: String,
    /// 网关自身的设备 ID。
    pub device_id: String,
    pub generation_id: String,
}

impl ModuleIdentity {
    pub fn new(
        module_id: impl Into<String>,
        device_id: impl Into<String>,
        generation_id: impl Into<String>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            device_id: device_id.into(),
            generation_id: generation_id.into(),
        }
    }
}

/// 健康状态：数值越小越差（Critical < Warning < Good）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Critical = 0,
    Warning = 1,
    Good = 2,
}

impl HealthState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Critical => "Critical",
            HealthState::Warning => "Warning",
            HealthState::Good => "Good",
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::Good
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输会话连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}
