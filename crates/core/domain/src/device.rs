//! 设备接入模型：连接描述、开通信息与持久化缓存条目。

use serde::{Deserialize, Serialize};

/// 云端连接描述（等价于 `HostName=..;DeviceId=..;SharedAccessKey=..` 连接串）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub host_name: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_access_key: Option<String>,
}

impl ConnectionDescriptor {
    pub fn for_device(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        shared_access_key: Option<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            module_id: None,
            shared_access_key,
        }
    }

    pub fn for_module(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        module_id: impl Into<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            module_id: Some(module_id.into()),
            shared_access_key: None,
        }
    }

    /// MQTT client id：模块为 `{device}/{module}`，设备为 `{device}`。
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }

    /// 解析连接串，未知字段忽略。
    pub fn parse(connection_string: &str) -> Option<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut module_id = None;
        let mut shared_access_key = None;
        for part in connection_string.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "ModuleId" => module_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                _ => {}
            }
        }
        Some(Self {
            host_name: host_name.filter(|value| !value.is_empty())?,
            device_id: device_id.filter(|value| !value.is_empty())?,
            module_id,
            shared_access_key,
        })
    }
}

impl std::fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostName={};DeviceId={}", self.host_name, self.device_id)?;
        if let Some(module_id) = &self.module_id {
            write!(f, ";ModuleId={}", module_id)?;
        }
        if let Some(key) = &self.shared_access_key {
            write!(f, ";SharedAccessKey={}", key)?;
        }
        Ok(())
    }
}

/// OPC 端点凭据。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpcEndpointCredentials {
    #[serde(default)]
    pub credential_type: u8,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// OPC 端点。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpcEndpoint {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub security_mode: u8,
    #[serde(default)]
    pub credentials: OpcEndpointCredentials,
}

/// 下游适配器发布的节点。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublishedNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opc_publishing_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opc_sampling_interval: Option<u64>,
}

/// 下游端点描述：适配器据此向设备转发数据。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublishNodesRequest {
    pub endpoint_url: String,
    #[serde(default)]
    pub use_security: bool,
    #[serde(default)]
    pub opc_nodes: Vec<PublishedNode>,
}

/// 设备开通信息：开通后不可变，重建设备会话所需的全部输入。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProvisionInfo {
    pub device_id: String,
    pub model_id: String,
    /// 设备对称密钥（不透明）。
    pub device_key: String,
    pub opc_publisher_nodes_request: PublishNodesRequest,
}

/// 持久化缓存条目，按 device_id 索引。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCacheEntry {
    pub device_provision_info: DeviceProvisionInfo,
    pub connection_descriptor: ConnectionDescriptor,
}

impl DeviceCacheEntry {
    pub fn device_id(&self) -> &str {
        &self.device_provision_info.device_id
    }
}
