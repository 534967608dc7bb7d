use crate::{DeviceSession, IdentityProvider, RegistrationRequest, RegistryError};
use api_contract::ProvisionResult;
use domain::{ConnectionDescriptor, DeviceProvisionInfo, HealthState, ModuleIdentity};
use gw_chunked::ChunkedCallClient;
use gw_storage::{DEVICE_CACHE_KEY, ProvisionCacheStore, remove_entry, upsert_entry};
use gw_telemetry::{
    record_cache_write_failure, record_device_deprovisioned, record_device_provisioned,
};
use gw_transport::{CLOUD_OUTPUT, CloudConnector, ConnectPolicy, EventSender};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// 通知适配器停止向设备转发数据。
pub const UNPUBLISH_NODES_METHOD: &str = "UnpublishNodes_v1";

const CREATE_DEVICE_EVENT: &str = "evCreateDevice";
const DELETE_DEVICE_EVENT: &str = "evDeleteDevice";

/// 注册表参数。
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub gateway: ModuleIdentity,
    pub id_scope: String,
    pub device_policy: ConnectPolicy,
    /// 设备会话等待第一份期望属性的时限。
    pub ready_timeout: Option<Duration>,
}

/// 注销结果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeprovisionOutcome {
    pub session_closed: bool,
    pub cache_entry_removed: bool,
    /// 适配器调用失败时的错误信息。
    pub adapter_error: Option<String>,
}

/// 启动重建结果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub recovered: Vec<String>,
    pub failed: Vec<String>,
}

/// 设备注册表：内存会话表 + 持久化开通缓存。
///
/// 两者只由本结构修改；缓存的读改写在 `cache_lock` 内完成。
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<DeviceSession>>>,
    cache: Arc<dyn ProvisionCacheStore>,
    cache_lock: Mutex<()>,
    identity: Arc<dyn IdentityProvider>,
    connector: Arc<dyn CloudConnector>,
    adapter: ChunkedCallClient,
    events: Arc<dyn EventSender>,
    options: RegistryOptions,
}

impl DeviceRegistry {
    pub fn new(
        cache: Arc<dyn ProvisionCacheStore>,
        identity: Arc<dyn IdentityProvider>,
        connector: Arc<dyn CloudConnector>,
        adapter: ChunkedCallClient,
        events: Arc<dyn EventSender>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            cache,
            cache_lock: Mutex::new(()),
            identity,
            connector,
            adapter,
            events,
            options,
        }
    }

    /// 开通设备。
    ///
    /// 给出缓存的连接描述时跳过身份注册；注册与连接均成功才进入内存表并写缓存。
    pub async fn provision(
        &self,
        info: DeviceProvisionInfo,
        cached: Option<ConnectionDescriptor>,
    ) -> ProvisionResult {
        let device_id = info.device_id.clone();
        let mut result = ProvisionResult {
            device_id: device_id.clone(),
            ..ProvisionResult::default()
        };

        let descriptor = match cached {
            Some(descriptor) => {
                result.dps_provision_status = true;
                result.dps_provision_message =
                    format!("Using cached connection descriptor for device: {}", device_id);
                descriptor
            }
            None => match self.register(&info).await {
                Ok(descriptor) => {
                    result.dps_provision_status = true;
                    result.dps_provision_message =
                        format!("Device provisioning succeeded for device: {}", device_id);
                    descriptor
                }
                Err(err) => {
                    result.dps_provision_message = err.to_string();
                    warn!(
                        target: "gw.registry",
                        device_id = %device_id,
                        error = %err,
                        "device_registration_failed"
                    );
                    return result;
                }
            },
        };

        let session = Arc::new(DeviceSession::new(
            info.clone(),
            descriptor.clone(),
            self.connector.clone(),
            self.options.device_policy,
            self.adapter.clone(),
        )
        .with_ready_timeout(self.options.ready_timeout));
        match session.connect().await {
            Ok(()) => {
                result.client_connection_status = true;
                result.client_connection_message =
                    format!("Successfully connected to IoT Central - device: {}", device_id);
            }
            Err(err) => {
                result.client_connection_message = err.to_string();
                session.close().await;
                warn!(
                    target: "gw.registry",
                    device_id = %device_id,
                    error = %err,
                    "device_connect_failed"
                );
                return result;
            }
        }

        // 新会话连上后才替换旧会话；失败时旧会话保持在线
        let previous = self.devices.lock().await.insert(device_id.clone(), session);
        if let Some(previous) = previous {
            previous.close().await;
        }
        record_device_provisioned();
        info!(target: "gw.registry", device_id = %device_id, "device_provisioned");

        if let Err(err) = self
            .events
            .send_event(&json!({ CREATE_DEVICE_EVENT: device_id }), Some(CLOUD_OUTPUT))
            .await
        {
            warn!(
                target: "gw.registry",
                device_id = %device_id,
                error = %err,
                "device_event_send_failed"
            );
        }

        let entry = domain::DeviceCacheEntry {
            device_provision_info: info,
            connection_descriptor: descriptor,
        };
        if let Err(err) = self.update_cache(|entries| upsert_entry(entries, entry)).await {
            record_cache_write_failure();
            error!(
                target: "gw.registry",
                device_id = %device_id,
                error = %err,
                "device_cache_write_failed"
            );
        }
        result
    }

    async fn register(&self, info: &DeviceProvisionInfo) -> Result<ConnectionDescriptor, RegistryError> {
        let request = RegistrationRequest {
            id_scope: self.options.id_scope.clone(),
            device_id: info.device_id.clone(),
            device_key: info.device_key.clone(),
            model_id: info.model_id.clone(),
            gateway_device_id: self.options.gateway.device_id.clone(),
            gateway_module_id: self.options.gateway.module_id.clone(),
        };
        let registration = self.identity.register(&request).await?;
        Ok(ConnectionDescriptor::for_device(
            registration.assigned_hub,
            registration.device_id,
            Some(info.device_key.clone()),
        ))
    }

    /// 注销设备（可重复调用）。缓存条目无论适配器调用成败都会删除。
    pub async fn deprovision(&self, device_id: &str) -> DeprovisionOutcome {
        let mut outcome = DeprovisionOutcome::default();

        let session = self.devices.lock().await.remove(device_id);
        let cached_info = match self.cache.get(DEVICE_CACHE_KEY).await {
            Ok(entries) => entries
                .into_iter()
                .find(|entry| entry.device_id() == device_id)
                .map(|entry| entry.device_provision_info),
            Err(err) => {
                warn!(
                    target: "gw.registry",
                    device_id = %device_id,
                    error = %err,
                    "device_cache_read_failed"
                );
                None
            }
        };
        let info = session
            .as_ref()
            .map(|session| session.info().clone())
            .or(cached_info);

        if let Some(session) = &session {
            session.close().await;
            outcome.session_closed = true;
        }

        if let Some(info) = info {
            let request = serde_json::to_value(&info.opc_publisher_nodes_request).unwrap_or(Value::Null);
            if let Err(err) = self.adapter.call(UNPUBLISH_NODES_METHOD, &request).await {
                warn!(
                    target: "gw.registry",
                    device_id = %device_id,
                    error = %err,
                    "device_unpublish_failed"
                );
                outcome.adapter_error = Some(err.to_string());
            }
        }

        match self.update_cache(|entries| remove_entry(entries, device_id)).await {
            Ok(removed) => outcome.cache_entry_removed = removed,
            Err(err) => {
                record_cache_write_failure();
                error!(
                    target: "gw.registry",
                    device_id = %device_id,
                    error = %err,
                    "device_cache_write_failed"
                );
            }
        }

        if outcome.session_closed || outcome.cache_entry_removed {
            record_device_deprovisioned();
            if let Err(err) = self
                .events
                .send_event(&json!({ DELETE_DEVICE_EVENT: device_id }), Some(CLOUD_OUTPUT))
                .await
            {
                warn!(
                    target: "gw.registry",
                    device_id = %device_id,
                    error = %err,
                    "device_event_send_failed"
                );
            }
        }
        info!(
            target: "gw.registry",
            device_id = %device_id,
            session_closed = outcome.session_closed,
            cache_entry_removed = outcome.cache_entry_removed,
            "device_deprovisioned"
        );
        outcome
    }

    async fn update_cache<F, T>(&self, apply: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Vec<domain::DeviceCacheEntry>) -> T,
    {
        let _guard = self.cache_lock.lock().await;
        let mut entries = self.cache.get(DEVICE_CACHE_KEY).await?;
        let output = apply(&mut entries);
        self.cache.set(DEVICE_CACHE_KEY, &entries).await?;
        Ok(output)
    }

    /// 启动时从缓存重建设备会话。
    ///
    /// 先复用缓存的连接描述，失败后不带描述再试一次；单个设备失败不影响其他设备。
    pub async fn recreate_from_cache(&self) -> RecoverySummary {
        let mut summary = RecoverySummary::default();
        let entries = match self.cache.get(DEVICE_CACHE_KEY).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(target: "gw.registry", error = %err, "device_cache_load_failed");
                return summary;
            }
        };
        info!(target: "gw.registry", count = entries.len(), "device_cache_loaded");

        for entry in entries {
            let device_id = entry.device_id().to_string();
            let info = entry.device_provision_info;
            let mut result = self
                .provision(info.clone(), Some(entry.connection_descriptor))
                .await;
            if !result.is_success() {
                warn!(
                    target: "gw.registry",
                    device_id = %device_id,
                    message = %result.client_connection_message,
                    "device_recreate_retry_without_descriptor"
                );
                result = self.provision(info, None).await;
            }
            if result.is_success() {
                summary.recovered.push(device_id);
            } else {
                error!(
                    target: "gw.registry",
                    device_id = %device_id,
                    dps_message = %result.dps_provision_message,
                    client_message = %result.client_connection_message,
                    "device_recreate_failed"
                );
                summary.failed.push(device_id);
            }
        }
        summary
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.devices.lock().await.get(device_id).cloned()
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 所有设备中最差的健康状态；没有设备时为 Good。
    pub async fn worst_health(&self) -> HealthState {
        self.devices
            .lock()
            .await
            .values()
            .map(|session| session.health())
            .min()
            .unwrap_or(HealthState::Good)
    }

    /// 下游数据路由：`{deviceId, data}` 转发到对应设备会话。
    pub async fn route_data(&self, message: &Value) -> bool {
        let Some(device_id) = message.get("deviceId").and_then(Value::as_str) else {
            warn!(target: "gw.registry", "device_data_missing_device_id");
            return false;
        };
        let Some(session) = self.get(device_id).await else {
            warn!(target: "gw.registry", device_id = %device_id, "device_data_unknown_device");
            return false;
        };
        let data = message.get("data").unwrap_or(&Value::Null);
        if data.is_null() {
            warn!(target: "gw.registry", device_id = %device_id, "device_data_empty");
            return false;
        }
        match session.send_data(data).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target: "gw.registry",
                    device_id = %device_id,
                    error = %err,
                    "device_data_send_failed"
                );
                false
            }
        }
    }

    /// 关闭所有设备会话（进程退出时）。缓存保持不变。
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<DeviceSession>> =
            self.devices.lock().await.drain().map(|(_, session)| session).collect();
        for session in sessions {
            session.close().await;
        }
    }
}
