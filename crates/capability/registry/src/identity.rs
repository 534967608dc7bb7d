use crate::RegistryError;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

/// 身份注册请求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub id_scope: String,
    pub device_id: String,
    pub device_key: String,
    pub model_id: String,
    pub gateway_device_id: String,
    pub gateway_module_id: String,
}

impl RegistrationRequest {
    /// 注册时携带的自定义载荷：模型 ID 与所属网关身份。
    pub fn provisioning_payload(&self) -> Value {
        json!({
            "modelId": self.model_id,
            "iotcModelId": self.model_id,
            "iotcGateway": {
                "iotcGatewayId": self.gateway_device_id,
                "iotcModuleId": self.gateway_module_id,
            }
        })
    }
}

/// 注册结果：分配的 hub 与设备 ID。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub assigned_hub: String,
    pub device_id: String,
}

/// 设备身份注册。
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn register(&self, request: &RegistrationRequest) -> Result<Registration, RegistryError>;
}

/// 本地注册：直接分配配置中的 hub 主机。
pub struct LocalIdentityProvider {
    hub_host: String,
}

impl LocalIdentityProvider {
    pub fn new(hub_host: impl Into<String>) -> Self {
        Self {
            hub_host: hub_host.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn register(&self, request: &RegistrationRequest) -> Result<Registration, RegistryError> {
        if self.hub_host.is_empty() {
            return Err(RegistryError::Identity("assigned hub is not configured".to_string()));
        }
        if request.device_key.is_empty() {
            return Err(RegistryError::Identity(format!(
                "missing device key for {}",
                request.device_id
            )));
        }
        info!(
            target: "gw.registry",
            device_id = %request.device_id,
            id_scope = %request.id_scope,
            payload = %request.provisioning_payload(),
            "device_identity_registered"
        );
        Ok(Registration {
            assigned_hub: self.hub_host.clone(),
            device_id: request.device_id.clone(),
        })
    }
}
