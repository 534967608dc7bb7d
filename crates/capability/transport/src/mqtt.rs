//! 基于 rumqttc 的云端连接器。
//!
//! 主题布局沿用 hub 风格：
//! - 遥测：`devices/{device}/modules/{module}/messages/events/$.on={output}`
//! - 孪生：`$iothub/twin/GET/?$rid=` / `$iothub/twin/PATCH/properties/reported/?$rid=`
//! - 直接方法：`$iothub/methods/POST/{name}/?$rid=`，响应 `$iothub/methods/res/200/?$rid=`
//! - 模块间调用：`$gateway/methods/POST/{device}/{module}/{name}/?$rid=`
//!
//! TLS 与 SAS 令牌生成不在此处处理。

use crate::{
    CloudClient, CloudConnector, METHOD_RESPONSE_STATUS, MethodCall, MethodRequest, MethodResult,
    TransportError, TransportEvent, TwinHandle,
};
use async_trait::async_trait;
use domain::ConnectionDescriptor;
use gw_telemetry::new_correlation_id;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TWIN_RESPONSE_TOPIC: &str = "$iothub/twin/res/";
const DESIRED_PATCH_TOPIC: &str = "$iothub/twin/PATCH/properties/desired/";
const METHOD_POST_TOPIC: &str = "$iothub/methods/POST/";
const GATEWAY_RESPONSE_TOPIC: &str = "$gateway/methods/res/";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MQTT 连接器配置。
#[derive(Debug, Clone)]
pub struct MqttConnectorConfig {
    pub host: String,
    pub port: u16,
    /// 为空时使用 `{hub}/{client_id}/?api-version=2021-04-12`。
    pub username: Option<String>,
    /// 为空时使用连接描述中的共享访问密钥。
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttConnectorConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// MQTT 连接器。
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttConnectorConfig,
}

impl MqttConnector {
    pub fn new(config: MqttConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CloudConnector for MqttConnector {
    async fn create(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(Arc<dyn CloudClient>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let client_id = descriptor.client_id();
        let mut options = MqttOptions::new(client_id.clone(), self.config.host.clone(), self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        let username = self.config.username.clone().unwrap_or_else(|| {
            format!("{}/{}/?api-version=2021-04-12", descriptor.host_name, client_id)
        });
        let password = self
            .config
            .password
            .clone()
            .or_else(|| descriptor.shared_access_key.clone())
            .unwrap_or_default();
        options.set_credentials(username, password);

        let (client, eventloop) = AsyncClient::new(options, 32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MqttShared {
            client,
            topics: Topics::new(descriptor),
            pending: Mutex::new(HashMap::new()),
            events: events_tx,
        });
        let cloud_client: Arc<dyn CloudClient> = Arc::new(MqttCloudClient {
            shared,
            eventloop: Mutex::new(Some(eventloop)),
            pump: Mutex::new(None),
            methods: Mutex::new(HashSet::new()),
        });
        Ok((cloud_client, events_rx))
    }
}

#[derive(Debug, Clone)]
struct Topics {
    device_id: String,
    module_id: Option<String>,
}

impl Topics {
    fn new(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            device_id: descriptor.device_id.clone(),
            module_id: descriptor.module_id.clone(),
        }
    }

    fn base(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("devices/{}/modules/{}", self.device_id, module_id),
            None => format!("devices/{}", self.device_id),
        }
    }

    fn telemetry(&self, output: Option<&str>) -> String {
        match output {
            Some(output) => format!("{}/messages/events/$.on={}", self.base(), output),
            None => format!("{}/messages/events/", self.base()),
        }
    }

    fn inputs_filter(&self) -> String {
        match &self.module_id {
            Some(_) => format!("{}/inputs/#", self.base()),
            None => format!("{}/messages/devicebound/#", self.base()),
        }
    }

    fn inputs_prefix(&self) -> String {
        format!("{}/inputs/", self.base())
    }

    fn devicebound_prefix(&self) -> String {
        format!("{}/messages/devicebound/", self.base())
    }
}

type RawResponse = (u16, Vec<u8>);

struct MqttShared {
    client: AsyncClient,
    topics: Topics,
    pending: Mutex<HashMap<String, oneshot::Sender<RawResponse>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MqttShared {
    /// 发布带 `$rid` 的请求并等待关联响应。
    async fn request(
        &self,
        topic_base: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let rid = new_correlation_id();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(rid.clone(), tx);
        }
        let topic = format!("{}?$rid={}", topic_base, rid);
        if let Err(err) = self.client.publish(topic, QoS::AtLeastOnce, false, body).await {
            self.forget(&rid);
            return Err(TransportError::Publish(err.to_string()));
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.forget(&rid);
                Err(TransportError::Timeout(topic_base.to_string()))
            }
        }
    }

    fn forget(&self, rid: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(rid);
        }
    }

    fn resolve(&self, rid: &str, status: u16, payload: Vec<u8>) {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(rid));
        match sender {
            Some(sender) => {
                let _ = sender.send((status, payload));
            }
            None => debug!(target: "gw.transport", rid = %rid, "mqtt_response_unmatched"),
        }
    }

    fn route(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        if let Some(rest) = topic
            .strip_prefix(TWIN_RESPONSE_TOPIC)
            .or_else(|| topic.strip_prefix(GATEWAY_RESPONSE_TOPIC))
        {
            if let (Some(status), Some(rid)) = (parse_status(rest), parse_query(topic, "$rid")) {
                self.resolve(rid, status, payload.to_vec());
            }
            return;
        }
        if topic.starts_with(DESIRED_PATCH_TOPIC) {
            let _ = self
                .events
                .send(TransportEvent::DesiredProperties(parse_json(payload)));
            return;
        }
        if let Some(rest) = topic.strip_prefix(METHOD_POST_TOPIC) {
            let Some(rid) = parse_query(topic, "$rid") else {
                warn!(target: "gw.transport", topic = %topic, "mqtt_method_without_rid");
                return;
            };
            let method_name = rest.split('/').next().unwrap_or_default().to_string();
            let (call, response) = MethodCall::new(method_name, parse_json(payload));
            let shared = self.clone();
            let rid = rid.to_string();
            tokio::spawn(async move {
                let body = response.await.unwrap_or_else(|_| json!({}));
                let topic = format!("$iothub/methods/res/{}/?$rid={}", METHOD_RESPONSE_STATUS, rid);
                let bytes = serde_json::to_vec(&body).unwrap_or_default();
                if let Err(err) = shared.client.publish(topic, QoS::AtLeastOnce, false, bytes).await {
                    warn!(target: "gw.transport", error = %err, "mqtt_method_response_failed");
                }
            });
            let _ = self.events.send(TransportEvent::MethodInvoked(call));
            return;
        }
        let input = topic
            .strip_prefix(&self.topics.inputs_prefix())
            .map(|rest| rest.split('/').next().unwrap_or_default().to_string())
            .or_else(|| {
                topic
                    .starts_with(&self.topics.devicebound_prefix())
                    .then(|| "devicebound".to_string())
            });
        match input {
            Some(input) => {
                let _ = self.events.send(TransportEvent::InputMessage {
                    input,
                    payload: parse_json(payload),
                });
            }
            None => debug!(target: "gw.transport", topic = %topic, "mqtt_topic_ignored"),
        }
    }
}

/// 单个 MQTT 连接。
pub struct MqttCloudClient {
    shared: Arc<MqttShared>,
    eventloop: Mutex<Option<EventLoop>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    methods: Mutex<HashSet<String>>,
}

impl MqttCloudClient {
    async fn subscribe(&self, filter: String) -> Result<(), TransportError> {
        self.shared
            .client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|err| TransportError::Publish(err.to_string()))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Connect(format!("{:?}", code))),
                };
            }
            Ok(_) => {}
            Err(err) => return Err(TransportError::Connect(err.to_string())),
        }
    }
}

async fn pump_events(shared: Arc<MqttShared>, mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.route(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(err) => {
                // 连接建立后的错误不在本地重试，交由上层处理
                let _ = shared.events.send(TransportEvent::Error(err.to_string()));
                let _ = shared.events.send(TransportEvent::Disconnected);
                break;
            }
        }
    }
}

#[async_trait]
impl CloudClient for MqttCloudClient {
    async fn open(&self) -> Result<(), TransportError> {
        let eventloop = self.eventloop.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut eventloop) = eventloop else {
            return Err(TransportError::Connect("client already opened".to_string()));
        };
        tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::Timeout("connack".to_string()))??;

        let pump = tokio::spawn(pump_events(self.shared.clone(), eventloop));
        if let Ok(mut slot) = self.pump.lock() {
            *slot = Some(pump);
        }
        self.subscribe(format!("{}#", TWIN_RESPONSE_TOPIC)).await?;
        self.subscribe(format!("{}#", GATEWAY_RESPONSE_TOPIC)).await?;
        let _ = self.shared.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self
            .shared
            .client
            .disconnect()
            .await
            .map_err(|err| TransportError::Publish(err.to_string()));
        let pump = self.pump.lock().ok().and_then(|mut slot| slot.take());
        if let Some(pump) = pump {
            pump.abort();
        }
        result
    }

    async fn send_event(&self, payload: Vec<u8>, output: Option<&str>) -> Result<(), TransportError> {
        self.shared
            .client
            .publish(self.shared.topics.telemetry(output), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| TransportError::Publish(err.to_string()))
    }

    async fn get_twin(&self) -> Result<Arc<dyn TwinHandle>, TransportError> {
        let (status, body) = self
            .shared
            .request("$iothub/twin/GET/", Vec::new(), DEFAULT_REQUEST_TIMEOUT)
            .await?;
        if status != 200 {
            return Err(TransportError::Rejected {
                status,
                message: String::from_utf8_lossy(&body).to_string(),
            });
        }
        let document = parse_json(&body);
        let twin: Arc<dyn TwinHandle> = Arc::new(MqttTwin {
            shared: self.shared.clone(),
            desired: document.get("desired").cloned().unwrap_or_else(|| json!({})),
        });
        Ok(twin)
    }

    async fn subscribe_inputs(&self) -> Result<(), TransportError> {
        self.subscribe(self.shared.topics.inputs_filter()).await
    }

    async fn register_method(&self, name: &str) -> Result<(), TransportError> {
        let first = match self.methods.lock() {
            Ok(mut methods) => {
                let first = methods.is_empty();
                methods.insert(name.to_string());
                first
            }
            Err(_) => false,
        };
        if first {
            self.subscribe(format!("{}#", METHOD_POST_TOPIC)).await?;
        }
        info!(target: "gw.transport", method = %name, "mqtt_method_registered");
        Ok(())
    }

    async fn invoke_method(
        &self,
        device_id: &str,
        module_id: &str,
        request: &MethodRequest,
    ) -> Result<MethodResult, TransportError> {
        let body = json!({
            "payload": request.payload,
            "connectTimeoutInSeconds": request.timeouts.connect_timeout_secs,
            "responseTimeoutInSeconds": request.timeouts.response_timeout_secs,
        });
        let bytes = serde_json::to_vec(&body).map_err(|err| TransportError::Payload(err.to_string()))?;
        let timeout = request
            .timeouts
            .response_timeout_secs
            .map(|secs| Duration::from_secs(secs + request.timeouts.connect_timeout_secs.unwrap_or(0)))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let topic = format!(
            "$gateway/methods/POST/{}/{}/{}/",
            device_id, module_id, request.method_name
        );
        let (status, payload) = self.shared.request(&topic, bytes, timeout).await?;
        Ok(MethodResult::new(status, parse_json(&payload)))
    }
}

struct MqttTwin {
    shared: Arc<MqttShared>,
    desired: Value,
}

#[async_trait]
impl TwinHandle for MqttTwin {
    async fn subscribe_desired(&self) -> Result<(), TransportError> {
        self.shared
            .client
            .subscribe(format!("{}#", DESIRED_PATCH_TOPIC), QoS::AtLeastOnce)
            .await
            .map_err(|err| TransportError::Publish(err.to_string()))?;
        let _ = self
            .shared
            .events
            .send(TransportEvent::DesiredProperties(self.desired.clone()));
        Ok(())
    }

    async fn update_reported(&self, patch: &Value) -> Result<(), TransportError> {
        let body = serde_json::to_vec(patch).map_err(|err| TransportError::Payload(err.to_string()))?;
        let (status, response) = self
            .shared
            .request(
                "$iothub/twin/PATCH/properties/reported/",
                body,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        if !(200..300).contains(&status) {
            return Err(TransportError::Rejected {
                status,
                message: String::from_utf8_lossy(&response).to_string(),
            });
        }
        Ok(())
    }
}

fn parse_json(payload: &[u8]) -> Value {
    if payload.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).to_string()))
}

/// 解析 `{status}/?...` 中的状态码。
fn parse_status(rest: &str) -> Option<u16> {
    rest.split('/').next()?.parse().ok()
}

/// 读取主题中 `?` 之后的查询参数。
fn parse_query<'a>(topic: &'a str, key: &str) -> Option<&'a str> {
    let (_, query) = topic.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_topic_parsing() {
        let topic = "$iothub/twin/res/204/?$rid=abc&$version=7";
        let rest = topic.strip_prefix(TWIN_RESPONSE_TOPIC).expect("prefix");
        assert_eq!(parse_status(rest), Some(204));
        assert_eq!(parse_query(topic, "$rid"), Some("abc"));
        assert_eq!(parse_query(topic, "$version"), Some("7"));
        assert_eq!(parse_query("$iothub/twin/res/200/", "$rid"), None);
    }

    #[test]
    fn module_topics() {
        let descriptor = ConnectionDescriptor::for_module("hub.local", "edge-1", "gateway");
        let topics = Topics::new(&descriptor);
        assert_eq!(
            topics.telemetry(Some("iotc")),
            "devices/edge-1/modules/gateway/messages/events/$.on=iotc"
        );
        assert_eq!(topics.inputs_filter(), "devices/edge-1/modules/gateway/inputs/#");
    }

    #[test]
    fn device_topics() {
        let descriptor = ConnectionDescriptor::for_device("hub.local", "leaf-1", None);
        let topics = Topics::new(&descriptor);
        assert_eq!(topics.telemetry(None), "devices/leaf-1/messages/events/");
        assert_eq!(topics.inputs_filter(), "devices/leaf-1/messages/devicebound/#");
    }

    #[test]
    fn non_json_payload_kept_as_text() {
        assert_eq!(parse_json(b"plain"), Value::String("plain".to_string()));
        assert_eq!(parse_json(b""), Value::Null);
        assert_eq!(parse_json(br#"{"a":1}"#), json!({"a": 1}));
    }
}
