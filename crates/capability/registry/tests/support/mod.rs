#![allow(dead_code)]

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use domain::{
    ConnectionDescriptor, DeviceProvisionInfo, ModuleIdentity, PublishNodesRequest, PublishedNode,
};
use gw_chunked::{ChunkedCallClient, compress_json};
use gw_registry::{
    DeviceRegistry, IdentityProvider, Registration, RegistrationRequest, RegistryError,
    RegistryOptions,
};
use gw_storage::InMemoryProvisionCache;
use gw_transport::{
    CloudClient, CloudConnector, ConnectPolicy, EventSender, MethodInvoker, MethodRequest,
    MethodResult, TransportError, TransportEvent, TwinHandle,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct FakeTwin {
    events: mpsc::UnboundedSender<TransportEvent>,
    silent: bool,
    pub reported: Mutex<Vec<Value>>,
}

#[async_trait]
impl TwinHandle for FakeTwin {
    async fn subscribe_desired(&self) -> Result<(), TransportError> {
        if self.silent {
            return Ok(());
        }
        let _ = self
            .events
            .send(TransportEvent::DesiredProperties(json!({ "$version": 1 })));
        Ok(())
    }

    async fn update_reported(&self, patch: &Value) -> Result<(), TransportError> {
        self.reported.lock().unwrap().push(patch.clone());
        Ok(())
    }
}

pub struct FakeClient {
    pub descriptor: ConnectionDescriptor,
    fail_open: bool,
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub sent: Mutex<Vec<Value>>,
    pub twin: Arc<FakeTwin>,
}

#[async_trait]
impl CloudClient for FakeClient {
    async fn open(&self) -> Result<(), TransportError> {
        if self.fail_open {
            return Err(TransportError::Connect("unauthorized".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_event(&self, payload: Vec<u8>, _output: Option<&str>) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push(serde_json::from_slice(&payload).unwrap());
        Ok(())
    }

    async fn get_twin(&self) -> Result<Arc<dyn TwinHandle>, TransportError> {
        let twin: Arc<dyn TwinHandle> = self.twin.clone();
        Ok(twin)
    }

    async fn subscribe_inputs(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn register_method(&self, _name: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn invoke_method(
        &self,
        _device_id: &str,
        _module_id: &str,
        _request: &MethodRequest,
    ) -> Result<MethodResult, TransportError> {
        Ok(MethodResult::new(200, json!({})))
    }
}

/// 对指定 hub 主机的连接总是失败；`silent_hosts` 上的孪生从不下发期望属性。
#[derive(Default)]
pub struct FakeConnector {
    pub failing_hosts: Mutex<Vec<String>>,
    pub silent_hosts: Mutex<Vec<String>>,
    pub clients: Mutex<Vec<Arc<FakeClient>>>,
}

impl FakeConnector {
    pub fn failing_for(hosts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing_hosts: Mutex::new(hosts.iter().map(|host| host.to_string()).collect()),
            silent_hosts: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
        })
    }

    /// 指定设备最近一次创建的连接。
    pub fn last_client(&self, device_id: &str) -> Arc<FakeClient> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|client| client.descriptor.device_id == device_id)
            .cloned()
            .unwrap()
    }
}

#[async_trait]
impl CloudConnector for FakeConnector {
    async fn create(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(Arc<dyn CloudClient>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let fail_open = self
            .failing_hosts
            .lock()
            .unwrap()
            .contains(&descriptor.host_name);
        let silent = self
            .silent_hosts
            .lock()
            .unwrap()
            .contains(&descriptor.host_name);
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(FakeClient {
            descriptor: descriptor.clone(),
            fail_open,
            events: tx.clone(),
            sent: Mutex::new(Vec::new()),
            twin: Arc::new(FakeTwin {
                events: tx,
                silent,
                reported: Mutex::new(Vec::new()),
            }),
        });
        self.clients.lock().unwrap().push(client.clone());
        let client: Arc<dyn CloudClient> = client;
        Ok((client, rx))
    }
}

/// 对指定设备注册失败，其余分配 `hub.local`。
#[derive(Default)]
pub struct FakeIdentity {
    pub failing_devices: Vec<String>,
    pub calls: AtomicU32,
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn register(&self, request: &RegistrationRequest) -> Result<Registration, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_devices.contains(&request.device_id) {
            return Err(RegistryError::Identity("enrollment denied".to_string()));
        }
        Ok(Registration {
            assigned_hub: "hub.local".to_string(),
            device_id: request.device_id.clone(),
        })
    }
}

/// 适配器替身：按脚本返回，脚本耗尽后所有调用按分块协议成功返回 `{}`。
#[derive(Default)]
pub struct FakeAdapter {
    replies: Mutex<VecDeque<MethodResult>>,
    pub requests: Mutex<Vec<MethodRequest>>,
}

impl FakeAdapter {
    pub fn scripted(replies: Vec<MethodResult>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push_reply(&self, reply: MethodResult) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.method_name.clone())
            .collect()
    }
}

#[async_trait]
impl MethodInvoker for FakeAdapter {
    async fn invoke_method(&self, _target: &str, request: MethodRequest) -> MethodResult {
        let is_poll = request.payload.get("RequestId").is_some();
        self.requests.lock().unwrap().push(request);
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        if is_poll {
            completed(&json!({}))
        } else {
            MethodResult::new(202, json!({ "RequestId": "auto" }))
        }
    }
}

pub fn completed(body: &Value) -> MethodResult {
    let encoded = general_purpose::STANDARD.encode(compress_json(body).unwrap());
    MethodResult::new(200, json!({ "Status": 200, "Payload": encoded }))
}

#[derive(Default)]
pub struct RecordingSender {
    pub events: Mutex<Vec<(Value, Option<String>)>>,
}

#[async_trait]
impl EventSender for RecordingSender {
    async fn send_event(&self, payload: &Value, output: Option<&str>) -> Result<(), TransportError> {
        self.events
            .lock()
            .unwrap()
            .push((payload.clone(), output.map(str::to_string)));
        Ok(())
    }
}

pub struct Harness {
    pub registry: DeviceRegistry,
    pub connector: Arc<FakeConnector>,
    pub identity: Arc<FakeIdentity>,
    pub adapter: Arc<FakeAdapter>,
    pub cache: Arc<InMemoryProvisionCache>,
    pub events: Arc<RecordingSender>,
}

pub fn harness(
    connector: Arc<FakeConnector>,
    identity: FakeIdentity,
    adapter: Arc<FakeAdapter>,
    cache: InMemoryProvisionCache,
) -> Harness {
    let identity = Arc::new(identity);
    let cache = Arc::new(cache);
    let events = Arc::new(RecordingSender::default());
    let registry = DeviceRegistry::new(
        cache.clone(),
        identity.clone(),
        connector.clone(),
        ChunkedCallClient::new(adapter.clone(), "opcpublisher"),
        events.clone(),
        RegistryOptions {
            gateway: ModuleIdentity::new("gateway", "edge-1", "1"),
            id_scope: "0ne000000".to_string(),
            device_policy: ConnectPolicy {
                attempts: 1,
                retry_delay: Duration::from_secs(5),
                settle_delay: Duration::ZERO,
            },
            ready_timeout: Some(Duration::from_secs(30)),
        },
    );
    Harness {
        registry,
        connector,
        identity,
        adapter,
        cache,
        events,
    }
}

pub fn provision_info(device_id: &str) -> DeviceProvisionInfo {
    DeviceProvisionInfo {
        device_id: device_id.to_string(),
        model_id: "dtmi:com:example:opc;1".to_string(),
        device_key: "c2VjcmV0".to_string(),
        opc_publisher_nodes_request: PublishNodesRequest {
            endpoint_url: "opc.tcp://plc:4840".to_string(),
            use_security: false,
            opc_nodes: vec![PublishedNode {
                id: "ns=2;s=Lamp".to_string(),
                opc_publishing_interval: None,
                opc_sampling_interval: None,
            }],
        },
    }
}
