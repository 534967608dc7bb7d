//! 网关业务服务：适配器命令、节点发现、设备开通命令与下游数据路由。
//!
//! 除 `cmTestConnection` 外，所有适配器命令都走分块调用。

use api_contract::{
    BrowseNodesRequest, CommandEnvelope, DeprovisionDeviceRequest, ProvisionDeviceRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{ConnectionDescriptor, HealthState, OpcEndpoint};
use gw_chunked::{
    ArtifactTransfer, BulkFetch, BulkFetchError, ChunkedCallClient, ChunkedCallError,
    DEFAULT_START_METHOD, JsonArrayWriter, hand_off,
};
use gw_control::{MethodError, MethodHandler, MethodRouter, handler_fn, parse_payload};
use gw_module::{ModuleError, ModuleHooks};
use gw_registry::{DeviceRegistry, WRITE_VALUES_METHOD};
use gw_telemetry::new_correlation_id;
use gw_transport::{CLOUD_OUTPUT, EventSender, InvokeTimeouts, MethodRequest};
use gw_twin::{SettingSpec, SettingsMap};
use serde_json::{Value, json};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::io::BufWriter;
use tracing::{debug, error, info, warn};

pub const OPC_ENDPOINT_SETTING: &str = "wpOpcEndpoint";
pub const DISCOVERY_ROOT_SETTING: &str = "wpServerNodeDiscoveryRoot";

pub const START_NODE_DISCOVERY: &str = "cmStartOpcNodeDiscovery";
pub const TEST_CONNECTION: &str = "cmTestConnection";
pub const FETCH_NODES: &str = "cmFetchNodes";
pub const WRITE_VALUES: &str = "cmWriteValues";
pub const READ_VALUES: &str = "cmReadValues";
pub const ADD_OR_UPDATE_ASSETS: &str = "cmAddOrUpdateAssets";
pub const GET_ALL_ASSETS: &str = "cmGetAllAssets";
pub const REMOVE_ASSETS: &str = "cmRemoveAssets";
pub const PROVISION_DEVICE: &str = "cmProvisionDevice";
pub const DEPROVISION_DEVICE: &str = "cmDeprovisionDevice";

const TEST_CONNECTION_METHOD: &str = "TestConnection_v1";
const READ_VALUES_METHOD: &str = "ReadValues_v1";
const ADD_OR_UPDATE_ASSETS_METHOD: &str = "AddOrUpdateAssets_v1";
const GET_ALL_ASSETS_METHOD: &str = "GetAllAssets_v1";
const REMOVE_ASSETS_METHOD: &str = "RemoveAssets_v1";

const DISCOVERY_STARTED_EVENT: &str = "evFetchedOpcNodesAutoDiscovery";
const FETCH_STARTED_EVENT: &str = "evFetchedOpcNodesStarted";
const FETCH_FINISHED_EVENT: &str = "evFetchedOpcNodesFinished";
const FETCH_ERROR_EVENT: &str = "evFetchedOpcNodesError";

// 自动发现的浏览参数
const DISCOVERY_DEPTH: u32 = 5;
const DISCOVERY_NODE_CLASSES: [i64; 2] = [1, 2];
const DISCOVERY_ATTRIBUTES: [i64; 5] = [2, 3, 4, 5, 14];

/// 批量拉取结果文件名：`fetchNodes-YYYYMMDD-HHMMSS.json`（UTC）。
pub fn artifact_file_name(at: DateTime<Utc>) -> String {
    format!("fetchNodes-{}.json", at.format("%Y%m%d-%H%M%S"))
}

struct GatewayInner {
    adapter: ChunkedCallClient,
    registry: Arc<DeviceRegistry>,
    events: Arc<dyn EventSender>,
    transfer: Arc<dyn ArtifactTransfer>,
    storage_root: PathBuf,
    settings: OnceLock<SettingsMap>,
    health: RwLock<HealthState>,
}

/// 网关服务（可克隆，内部共享）。
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(
        adapter: ChunkedCallClient,
        registry: Arc<DeviceRegistry>,
        events: Arc<dyn EventSender>,
        transfer: Arc<dyn ArtifactTransfer>,
        storage_root: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                adapter,
                registry,
                events,
                transfer,
                storage_root,
                settings: OnceLock::new(),
                health: RwLock::new(HealthState::Critical),
            }),
        }
    }

    fn own_health(&self) -> HealthState {
        self.inner
            .health
            .read()
            .map(|health| *health)
            .unwrap_or(HealthState::Critical)
    }

    fn set_health(&self, health: HealthState) {
        if let Ok(mut slot) = self.inner.health.write() {
            *slot = health;
        }
    }

    /// 网关自身与所有设备会话中最差的健康状态。
    pub async fn health(&self) -> HealthState {
        self.own_health()
            .min(self.inner.registry.worst_health().await)
    }

    async fn send_event(&self, name: &str, message: String) {
        if let Err(err) = self
            .inner
            .events
            .send_event(&json!({ name: message }), Some(CLOUD_OUTPUT))
            .await
        {
            warn!(target: "gw.gateway", event = %name, error = %err, "gateway_event_send_failed");
        }
    }

    /// `cmTestConnection`：普通调用（非分块），连接与响应超时各 10 秒。
    pub async fn test_connection(&self, request: Value) -> CommandEnvelope {
        let uri = request
            .pointer("/opcEndpoint/uri")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        info!(target: "gw.gateway", uri = %uri, "test_connection");
        let call = MethodRequest::new(TEST_CONNECTION_METHOD, request)
            .with_timeouts(InvokeTimeouts::new(10, 10));
        let result = self
            .inner
            .adapter
            .invoker()
            .invoke_method(self.inner.adapter.target(), call)
            .await;
        if result.status == 200 {
            return CommandEnvelope::success(format!("testConnection succeeded for url: {}", uri));
        }
        let message = api_contract::adapter_error_code(&result.payload)
            .unwrap_or_else(|| "An error occurred while testing the opcua url".to_string());
        warn!(
            target: "gw.gateway",
            uri = %uri,
            status = result.status,
            message = %message,
            "test_connection_failed"
        );
        CommandEnvelope::error(result.status, message)
            .with_payload(result.payload.get("error").cloned().unwrap_or_else(|| json!({})))
    }

    /// 以分块调用执行一条适配器命令。
    pub async fn chunked_command(&self, method: &str, body: Value) -> CommandEnvelope {
        match self.inner.adapter.call(method, &body).await {
            Ok(payload) => CommandEnvelope::success(format!("{} succeeded", method)).with_payload(payload),
            Err(err) => chunked_failure(method, err),
        }
    }

    /// `cmFetchNodes`：启动浏览任务并把全部分页写入存储目录下的结果文件。
    pub async fn fetch_nodes(&self, request: BrowseNodesRequest) -> CommandEnvelope {
        let job_id = new_correlation_id();
        info!(
            target: "gw.gateway",
            job_id = %job_id,
            start_node = %request.start_node,
            depth = request.depth,
            "fetch_nodes_started"
        );
        self.send_event(
            FETCH_STARTED_EVENT,
            format!(
                "Starting node: {}, depth: {}, jobId: {}",
                request.start_node, request.depth, job_id
            ),
        )
        .await;

        let envelope = self.run_bulk_fetch(&request).await;

        if envelope.status == 200 {
            self.send_event(
                FETCH_FINISHED_EVENT,
                format!("Status: {}, jobId: {}", envelope.status, job_id),
            )
            .await;
        } else {
            error!(
                target: "gw.gateway",
                job_id = %job_id,
                status = envelope.status,
                message = %envelope.message,
                "fetch_nodes_failed"
            );
            self.send_event(
                FETCH_ERROR_EVENT,
                format!(
                    "Status: {}, jobId: {}, Message: {}",
                    envelope.status, job_id, envelope.message
                ),
            )
            .await;
        }
        envelope
    }

    async fn run_bulk_fetch(&self, request: &BrowseNodesRequest) -> CommandEnvelope {
        let fetch = BulkFetch::new(self.inner.adapter.clone());
        let mut job = match fetch.start(request).await {
            Ok(job) => job,
            Err(err) => return bulk_failure(err),
        };

        if let Err(err) = tokio::fs::create_dir_all(&self.inner.storage_root).await {
            return CommandEnvelope::error(500, format!("fetchNodes failed: {}", err));
        }
        let file_name = artifact_file_name(Utc::now());
        let path = self.inner.storage_root.join(&file_name);
        let file = match tokio::fs::File::create(&path).await {
            Ok(file) => file,
            Err(err) => return CommandEnvelope::error(500, format!("fetchNodes failed: {}", err)),
        };
        let mut writer = JsonArrayWriter::new(BufWriter::new(file));

        match fetch.drain(&mut job, &mut writer).await {
            Ok(summary) => {
                hand_off(self.inner.transfer.clone(), path);
                CommandEnvelope::success(format!(
                    "fetchNodes wrote {} nodes to {}",
                    summary.item_count, file_name
                ))
                .with_payload(json!({
                    "jobId": summary.job_id,
                    "pageCount": summary.page_count,
                    "nodeCount": summary.item_count,
                    "fileName": file_name,
                }))
            }
            Err(err) => CommandEnvelope::error(
                err.status(),
                format!("Error while fetching node chunks: {}", err),
            ),
        }
    }

    /// `cmStartOpcNodeDiscovery`：按模块设置中的端点与发现根节点拉取节点。
    pub async fn start_node_discovery(&self) -> CommandEnvelope {
        let (endpoint, root) = match self.inner.settings.get() {
            Some(settings) => (
                settings
                    .get(OPC_ENDPOINT_SETTING)
                    .and_then(|value| serde_json::from_value::<OpcEndpoint>(value).ok())
                    .unwrap_or_default(),
                settings.get_str(DISCOVERY_ROOT_SETTING),
            ),
            None => (OpcEndpoint::default(), String::new()),
        };
        if root.is_empty() || endpoint.uri.is_empty() {
            let message = "Some of the required settings for fetchNodes are missing";
            warn!(target: "gw.gateway", "node_discovery_skipped");
            return CommandEnvelope::error(500, message);
        }

        self.send_event(
            DISCOVERY_STARTED_EVENT,
            format!("Starting auto-discovery at node: {}", root),
        )
        .await;
        let envelope = self
            .fetch_nodes(BrowseNodesRequest {
                opc_endpoint: Some(endpoint),
                start_node: root.clone(),
                depth: DISCOVERY_DEPTH,
                requested_node_classes: DISCOVERY_NODE_CLASSES.to_vec(),
                requested_attributes: DISCOVERY_ATTRIBUTES.to_vec(),
            })
            .await;
        if envelope.status == 200 {
            CommandEnvelope {
                message: format!("fetchNodes succeeded for root node: {}", root),
                ..envelope
            }
        } else {
            envelope
        }
    }

    /// `cmProvisionDevice`：带连接串时复用其中的连接描述，跳过身份注册。
    pub async fn provision_device(&self, request: ProvisionDeviceRequest) -> CommandEnvelope {
        let cached = request
            .connection_string
            .as_deref()
            .and_then(ConnectionDescriptor::parse);
        let result = self.inner.registry.provision(request.info, cached).await;
        let payload = serde_json::to_value(&result).unwrap_or(Value::Null);
        if result.is_success() {
            return CommandEnvelope::success(result.client_connection_message.clone())
                .with_payload(payload);
        }
        let message = if result.dps_provision_status {
            result.client_connection_message.clone()
        } else {
            result.dps_provision_message.clone()
        };
        CommandEnvelope::error(500, message).with_payload(payload)
    }

    /// `cmDeprovisionDevice`：可重复调用。
    pub async fn deprovision_device(&self, request: DeprovisionDeviceRequest) -> CommandEnvelope {
        let device_id = request.device_id;
        let outcome = self.inner.registry.deprovision(&device_id).await;
        let message = if outcome.session_closed || outcome.cache_entry_removed {
            format!("Device deprovisioned: {}", device_id)
        } else {
            format!("Device {} was not provisioned", device_id)
        };
        CommandEnvelope::success(message).with_payload(json!({
            "deviceId": device_id,
            "sessionClosed": outcome.session_closed,
            "cacheEntryRemoved": outcome.cache_entry_removed,
            "adapterError": outcome.adapter_error,
        }))
    }
}

fn chunked_failure(method: &str, err: ChunkedCallError) -> CommandEnvelope {
    let status = err.status();
    let detail = err.detail().cloned();
    let message = match err {
        ChunkedCallError::Rejected { message, .. } => message,
        other => format!("{} failed: {}", method, other),
    };
    let envelope = CommandEnvelope::error(status, message);
    match detail {
        Some(detail) => envelope.with_payload(detail),
        None => envelope,
    }
}

fn bulk_failure(err: BulkFetchError) -> CommandEnvelope {
    match err {
        BulkFetchError::Chunked(err) => chunked_failure(DEFAULT_START_METHOD, err),
        other => CommandEnvelope::error(other.status(), other.to_string()),
    }
}

/// 注册一个持有网关句柄的命令处理器。
fn command<F, Fut>(gateway: &Gateway, run: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Gateway, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandEnvelope, MethodError>> + Send + 'static,
{
    let gateway = gateway.clone();
    handler_fn(move |payload: Value| run(gateway.clone(), payload))
}

#[async_trait]
impl ModuleHooks for Gateway {
    fn setting_specs(&self) -> Vec<SettingSpec> {
        vec![
            SettingSpec::new(
                OPC_ENDPOINT_SETTING,
                json!({
                    "uri": "",
                    "securityMode": 0,
                    "credentials": {
                        "credentialType": 0,
                        "username": "",
                        "password": ""
                    }
                }),
            ),
            SettingSpec::new(DISCOVERY_ROOT_SETTING, json!("")),
        ]
    }

    fn register_methods(&self, router: &MethodRouter) {
        router.register(
            START_NODE_DISCOVERY,
            command(self, |gateway, _payload| async move {
                Ok::<_, MethodError>(gateway.start_node_discovery().await)
            }),
        );
        router.register(
            TEST_CONNECTION,
            command(self, |gateway, payload| async move {
                Ok::<_, MethodError>(gateway.test_connection(payload).await)
            }),
        );
        router.register(
            FETCH_NODES,
            command(self, |gateway, payload| async move {
                let request: BrowseNodesRequest = parse_payload(payload)?;
                Ok::<_, MethodError>(gateway.fetch_nodes(request).await)
            }),
        );
        router.register(
            WRITE_VALUES,
            command(self, |gateway, payload| async move {
                Ok::<_, MethodError>(gateway.chunked_command(WRITE_VALUES_METHOD, payload).await)
            }),
        );
        router.register(
            READ_VALUES,
            command(self, |gateway, payload| async move {
                Ok::<_, MethodError>(gateway.chunked_command(READ_VALUES_METHOD, payload).await)
            }),
        );
        router.register(
            ADD_OR_UPDATE_ASSETS,
            command(self, |gateway, payload| async move {
                Ok::<_, MethodError>(
                    gateway
                        .chunked_command(ADD_OR_UPDATE_ASSETS_METHOD, payload)
                        .await,
                )
            }),
        );
        router.register(
            GET_ALL_ASSETS,
            command(self, |gateway, _payload| async move {
                Ok::<_, MethodError>(gateway.chunked_command(GET_ALL_ASSETS_METHOD, json!([])).await)
            }),
        );
        router.register(
            REMOVE_ASSETS,
            command(self, |gateway, payload| async move {
                Ok::<_, MethodError>(gateway.chunked_command(REMOVE_ASSETS_METHOD, payload).await)
            }),
        );
        router.register(
            PROVISION_DEVICE,
            command(self, |gateway, payload| async move {
                let request: ProvisionDeviceRequest = parse_payload(payload)?;
                Ok::<_, MethodError>(gateway.provision_device(request).await)
            }),
        );
        router.register(
            DEPROVISION_DEVICE,
            command(self, |gateway, payload| async move {
                let request: DeprovisionDeviceRequest = parse_payload(payload)?;
                Ok::<_, MethodError>(gateway.deprovision_device(request).await)
            }),
        );
    }

    async fn on_ready(&self, settings: &SettingsMap) -> Result<(), ModuleError> {
        if self.inner.settings.set(settings.clone()).is_err() {
            debug!(target: "gw.gateway", "gateway_settings_already_bound");
        }
        self.set_health(HealthState::Good);

        // 端点与根节点已配置时自动开始一次发现
        let gateway = self.clone();
        tokio::spawn(async move {
            let envelope = gateway.start_node_discovery().await;
            info!(
                target: "gw.gateway",
                status = envelope.status,
                message = %envelope.message,
                "node_discovery_finished"
            );
        });
        Ok(())
    }

    async fn on_input(&self, input: &str, payload: &Value) {
        let routed = self.inner.registry.route_data(payload).await;
        debug!(target: "gw.gateway", input = %input, routed = routed, "gateway_input_received");
    }

    async fn on_health(&self) -> HealthState {
        self.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose};
    use chrono::TimeZone;
    use domain::ModuleIdentity;
    use gw_chunked::{NoopTransfer, compress_json};
    use gw_registry::{LocalIdentityProvider, RegistryOptions};
    use gw_storage::InMemoryProvisionCache;
    use gw_transport::{
        CloudClient, CloudConnector, ConnectPolicy, MethodInvoker, MethodResult, TransportError,
        TransportEvent,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct ScriptedInvoker {
        replies: Mutex<VecDeque<MethodResult>>,
        requests: Mutex<Vec<MethodRequest>>,
    }

    impl ScriptedInvoker {
        fn push(&self, reply: MethodResult) {
            self.replies.lock().unwrap().push_back(reply);
        }

        /// 一次完整的分块调用：202 受理后首次轮询即完成。
        fn push_chunked(&self, body: Value) {
            self.push(MethodResult::new(202, json!({ "RequestId": "req-1" })));
            let encoded = general_purpose::STANDARD.encode(compress_json(&body).unwrap());
            self.push(MethodResult::new(200, json!({ "Status": 200, "Payload": encoded })));
        }

        fn methods(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|request| request.method_name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl MethodInvoker for ScriptedInvoker {
        async fn invoke_method(&self, _target: &str, request: MethodRequest) -> MethodResult {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| MethodResult::new(500, json!({ "error": { "code": "NoReply" } })))
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        events: Mutex<Vec<Value>>,
    }

    impl RecordingSender {
        fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| event.as_object()?.keys().next().cloned())
                .collect()
        }
    }

    #[async_trait]
    impl EventSender for RecordingSender {
        async fn send_event(&self, payload: &Value, _output: Option<&str>) -> Result<(), TransportError> {
            self.events.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl CloudConnector for RefusingConnector {
        async fn create(
            &self,
            _descriptor: &ConnectionDescriptor,
        ) -> Result<(Arc<dyn CloudClient>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>
        {
            Err(TransportError::Connect("hub unreachable".to_string()))
        }
    }

    struct Harness {
        gateway: Gateway,
        registry: Arc<DeviceRegistry>,
        invoker: Arc<ScriptedInvoker>,
        sender: Arc<RecordingSender>,
        storage_root: PathBuf,
    }

    fn harness() -> Harness {
        let invoker = Arc::new(ScriptedInvoker::default());
        let sender = Arc::new(RecordingSender::default());
        let adapter = ChunkedCallClient::new(invoker.clone(), "opcpublisher")
            .with_poll_interval(Duration::from_millis(1));
        let events: Arc<dyn EventSender> = sender.clone();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(InMemoryProvisionCache::new()),
            Arc::new(LocalIdentityProvider::new("hub.local")),
            Arc::new(RefusingConnector),
            adapter.clone(),
            events.clone(),
            RegistryOptions {
                gateway: ModuleIdentity::new("gateway", "edge-1", "1"),
                id_scope: "scope".to_string(),
                device_policy: ConnectPolicy {
                    attempts: 1,
                    retry_delay: Duration::ZERO,
                    settle_delay: Duration::ZERO,
                },
                ready_timeout: None,
            },
        ));
        let storage_root =
            std::env::temp_dir().join(format!("gw-edge-{}", uuid::Uuid::new_v4()));
        let gateway = Gateway::new(
            adapter,
            registry.clone(),
            events,
            Arc::new(NoopTransfer),
            storage_root.clone(),
        );
        Harness {
            gateway,
            registry,
            invoker,
            sender,
            storage_root,
        }
    }

    #[test]
    fn artifact_name_uses_utc_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(artifact_file_name(at), "fetchNodes-20240309-070501.json");
    }

    #[tokio::test]
    async fn test_connection_reports_adapter_error_code() {
        let h = harness();
        h.invoker.push(MethodResult::new(200, json!({})));
        h.invoker
            .push(MethodResult::new(500, json!({ "error": { "code": "BadTimeout" } })));
        let request = json!({ "opcEndpoint": { "uri": "opc.tcp://plc:4840" } });

        let ok = h.gateway.test_connection(request.clone()).await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.message, "testConnection succeeded for url: opc.tcp://plc:4840");

        let failed = h.gateway.test_connection(request).await;
        assert_eq!(failed.status, 500);
        assert_eq!(failed.message, "BadTimeout");
        assert_eq!(failed.payload, Some(json!({ "code": "BadTimeout" })));

        let requests = h.invoker.requests.lock().unwrap();
        assert_eq!(requests[0].method_name, "TestConnection_v1");
        assert_eq!(requests[0].timeouts, InvokeTimeouts::new(10, 10));
    }

    #[tokio::test]
    async fn chunked_command_wraps_result_and_rejection() {
        let h = harness();
        h.invoker.push_chunked(json!({ "assets": ["pump-1"] }));
        h.invoker
            .push(MethodResult::new(400, json!({ "error": { "code": "AssetNotFound" } })));

        let ok = h.gateway.chunked_command(GET_ALL_ASSETS_METHOD, json!([])).await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.message, "GetAllAssets_v1 succeeded");
        assert_eq!(ok.payload, Some(json!({ "assets": ["pump-1"] })));

        let rejected = h
            .gateway
            .chunked_command(REMOVE_ASSETS_METHOD, json!(["pump-9"]))
            .await;
        assert_eq!(rejected.status, 400);
        assert_eq!(rejected.message, "AssetNotFound");
        assert_eq!(rejected.payload, Some(json!({ "code": "AssetNotFound" })));
    }

    #[tokio::test]
    async fn fetch_nodes_writes_every_page_to_one_file() {
        let h = harness();
        h.invoker.push_chunked(json!({ "JobId": "job-7" }));
        h.invoker.push_chunked(json!({
            "nodes": [{ "id": "n1" }, { "id": "n2" }],
            "continuationToken": "2"
        }));
        h.invoker.push_chunked(json!({ "nodes": [{ "id": "n3" }] }));

        let envelope = h
            .gateway
            .fetch_nodes(BrowseNodesRequest {
                opc_endpoint: None,
                start_node: "ns=2;s=Line1".to_string(),
                depth: 2,
                requested_node_classes: vec![1],
                requested_attributes: vec![4],
            })
            .await;

        assert_eq!(envelope.status, 200);
        let payload = envelope.payload.unwrap();
        assert_eq!(payload["jobId"], "job-7");
        assert_eq!(payload["pageCount"], 2);
        assert_eq!(payload["nodeCount"], 3);

        let path = h.storage_root.join(payload["fileName"].as_str().unwrap());
        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, json!([{ "id": "n1" }, { "id": "n2" }, { "id": "n3" }]));
        assert_eq!(
            h.invoker.methods(),
            vec![
                "BrowseNodes_v1",
                "BrowseNodes_v1",
                "FetchBrowsedNodes_v1",
                "FetchBrowsedNodes_v1",
                "FetchBrowsedNodes_v1",
                "FetchBrowsedNodes_v1",
            ]
        );
        assert_eq!(
            h.sender.names(),
            vec![FETCH_STARTED_EVENT, FETCH_FINISHED_EVENT]
        );
        let _ = std::fs::remove_dir_all(&h.storage_root);
    }

    #[tokio::test]
    async fn fetch_nodes_failure_sends_error_event() {
        let h = harness();
        h.invoker.push(MethodResult::new(
            500,
            json!({ "error": { "code": "BadNodeIdUnknown" } }),
        ));

        let envelope = h
            .gateway
            .fetch_nodes(BrowseNodesRequest {
                opc_endpoint: None,
                start_node: "ns=2;s=Missing".to_string(),
                depth: 1,
                requested_node_classes: Vec::new(),
                requested_attributes: Vec::new(),
            })
            .await;

        assert_eq!(envelope.status, 500);
        assert_eq!(envelope.message, "BadNodeIdUnknown");
        assert_eq!(h.sender.names(), vec![FETCH_STARTED_EVENT, FETCH_ERROR_EVENT]);
        let events = h.sender.events.lock().unwrap();
        let error = events[1][FETCH_ERROR_EVENT].as_str().unwrap();
        assert!(error.starts_with("Status: 500, jobId: "));
        assert!(error.ends_with("Message: BadNodeIdUnknown"));
        assert!(!h.storage_root.exists());
    }

    #[tokio::test]
    async fn discovery_requires_endpoint_and_root() {
        let h = harness();
        let envelope = h.gateway.start_node_discovery().await;

        assert_eq!(envelope.status, 500);
        assert_eq!(
            envelope.message,
            "Some of the required settings for fetchNodes are missing"
        );
        assert!(h.sender.names().is_empty());
        assert!(h.invoker.methods().is_empty());
    }

    #[tokio::test]
    async fn health_is_critical_until_ready() {
        let h = harness();
        assert_eq!(h.gateway.health().await, HealthState::Critical);

        let settings = SettingsMap::new(h.gateway.setting_specs());
        h.gateway.on_ready(&settings).await.unwrap();

        assert_eq!(h.gateway.health().await, HealthState::Good);
        assert_eq!(h.gateway.on_health().await, HealthState::Good);
    }

    #[tokio::test]
    async fn provision_command_reports_connect_failure() {
        let h = harness();
        let request: ProvisionDeviceRequest = serde_json::from_value(json!({
            "deviceId": "pump-1",
            "modelId": "dtmi:plant:pump;1",
            "deviceKey": "a2V5",
            "opcPublisherNodesRequest": {
                "EndpointUrl": "opc.tcp://plc:4840",
                "OpcNodes": [{ "Id": "ns=2;s=Pump1.Indicator" }]
            }
        }))
        .unwrap();

        let envelope = h.gateway.provision_device(request).await;

        assert_eq!(envelope.status, 500);
        let payload = envelope.payload.unwrap();
        assert_eq!(payload["dpsProvisionStatus"], true);
        assert_eq!(payload["clientConnectionStatus"], false);
        assert!(h.registry.device_ids().await.is_empty());
    }

    #[tokio::test]
    async fn deprovision_unknown_device_twice_is_safe() {
        let h = harness();
        for _ in 0..2 {
            let envelope = h
                .gateway
                .deprovision_device(DeprovisionDeviceRequest {
                    device_id: "ghost".to_string(),
                })
                .await;
            assert_eq!(envelope.status, 200);
            assert_eq!(envelope.message, "Device ghost was not provisioned");
            assert_eq!(envelope.payload.unwrap()["cacheEntryRemoved"], false);
        }
        assert!(h.invoker.methods().is_empty());
        assert!(h.sender.names().is_empty());
    }

    #[tokio::test]
    async fn registered_commands_reject_malformed_payloads() {
        let h = harness();
        let router = MethodRouter::new("gateway");
        h.gateway.register_methods(&router);

        assert!(router.contains(PROVISION_DEVICE));
        assert!(router.contains(GET_ALL_ASSETS));
        let envelope = router.dispatch(FETCH_NODES, json!({ "depth": "deep" })).await;
        assert_eq!(envelope.status, 400);
        assert!(envelope.message.starts_with("An error occurred executing the command cmFetchNodes"));
    }
}
