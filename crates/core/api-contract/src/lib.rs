//! 稳定的线上报文契约：命令信封、属性确认、分块调用与分页拉取。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 远程命令统一响应信封。
///
/// 传输层始终以 200 应答，业务结果由 `status` 承载。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub status: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl CommandEnvelope {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            payload: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(200, message)
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, message)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 期望属性确认条目（`ac`/`ad`/`av` 为云端约定字段名）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyAck {
    pub value: Value,
    #[serde(rename = "ac")]
    pub accepted_code: u16,
    #[serde(rename = "ad")]
    pub accepted_description: String,
    #[serde(rename = "av")]
    pub accepted_version: Value,
}

impl PropertyAck {
    pub fn completed(value: Value, version: Value) -> Self {
        Self {
            value,
            accepted_code: 200,
            accepted_description: "completed".to_string(),
            accepted_version: version,
        }
    }
}

/// 分块调用提交请求：`Payload = base64(gzip(json(body)))`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkedSubmitRequest {
    pub content_length: usize,
    pub payload: String,
}

/// 分块调用受理应答（外层状态 202）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkedAccepted {
    pub request_id: String,
}

/// 分块调用状态轮询请求。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkedPollRequest {
    pub request_id: String,
}

/// 分块调用终态内层报文。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkedResult {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub payload: Option<String>,
}

/// 适配器错误体：`{ "error": { "code": "..." } }`。
pub fn adapter_error_code(payload: &Value) -> Option<String> {
    match payload.get("error")?.get("code")? {
        Value::String(code) => Some(code.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// 浏览任务启动请求。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowseNodesRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opc_endpoint: Option<domain::OpcEndpoint>,
    pub start_node: String,
    pub depth: u32,
    #[serde(default)]
    pub requested_node_classes: Vec<i64>,
    #[serde(default)]
    pub requested_attributes: Vec<i64>,
}

/// 浏览任务受理结果。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BrowseJobAccepted {
    pub job_id: String,
}

/// 分页拉取请求；首页令牌为字面量 `"1"`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FetchPageRequest {
    pub job_id: String,
    pub continuation_token: String,
}

pub const FIRST_PAGE_TOKEN: &str = "1";

/// 单页结果。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePage {
    #[serde(default)]
    pub nodes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

/// 设备开通命令请求体。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionDeviceRequest {
    #[serde(flatten)]
    pub info: domain::DeviceProvisionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
}

/// 设备开通结果。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResult {
    pub device_id: String,
    pub dps_provision_status: bool,
    pub dps_provision_message: String,
    pub client_connection_status: bool,
    pub client_connection_message: String,
}

impl ProvisionResult {
    pub fn is_success(&self) -> bool {
        self.dps_provision_status && self.client_connection_status
    }
}

/// 设备注销命令请求体。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionDeviceRequest {
    pub device_id: String,
}

/// 健康检查端点响应。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub health: String,
    pub code: u8,
}

/// 计数指标快照。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshotDto {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub session_invalidations: u64,
    pub events_sent: u64,
    pub properties_reported: u64,
    pub methods_received: u64,
    pub method_failures: u64,
    pub invoke_calls: u64,
    pub chunked_calls: u64,
    pub chunked_polls: u64,
    pub chunked_failures: u64,
    pub pages_fetched: u64,
    pub health_degraded: u64,
    pub restarts_requested: u64,
    pub devices_provisioned: u64,
    pub devices_deprovisioned: u64,
    pub cache_write_failures: u64,
}
