//! 云端传输会话。
//!
//! - `CloudConnector` / `CloudClient` / `TwinHandle`：底层连接抽象（MQTT 或测试替身）
//! - `TransportSession`：连接重试、稳定等待、错误即失效
//! - `EventSender` / `MethodInvoker` / `PropertyReporter`：上层使用的三个原语

mod error;
pub mod mqtt;
mod session;

pub use error::{ConnectError, TransportError};
pub use mqtt::{MqttConnector, MqttConnectorConfig};
pub use session::{ConnectPolicy, TransportSession};

use async_trait::async_trait;
use domain::ConnectionDescriptor;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// 方法响应在传输层固定使用的状态码，业务状态放在 JSON 信封内。
pub const METHOD_RESPONSE_STATUS: u16 = 200;

/// 模块级遥测事件的输出通道。
pub const CLOUD_OUTPUT: &str = "iotc";

/// 传输层事件（按会话串行投递）。
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    /// 期望属性：第一次为完整快照，之后为增量。
    DesiredProperties(Value),
    InputMessage { input: String, payload: Value },
    MethodInvoked(MethodCall),
}

/// 入站远程方法调用。
#[derive(Debug)]
pub struct MethodCall {
    pub method_name: String,
    pub payload: Value,
    responder: oneshot::Sender<Value>,
}

impl MethodCall {
    pub fn new(method_name: impl Into<String>, payload: Value) -> (Self, oneshot::Receiver<Value>) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                method_name: method_name.into(),
                payload,
                responder,
            },
            receiver,
        )
    }

    /// 回复方法调用；调用方已断开时返回 false。
    pub fn respond(self, body: Value) -> bool {
        self.responder.send(body).is_ok()
    }
}

/// 调用超时（秒），未设置时由连接器决定。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeTimeouts {
    pub connect_timeout_secs: Option<u64>,
    pub response_timeout_secs: Option<u64>,
}

impl InvokeTimeouts {
    pub fn new(connect_timeout_secs: u64, response_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs: Some(connect_timeout_secs),
            response_timeout_secs: Some(response_timeout_secs),
        }
    }
}

/// 对其他模块的方法调用请求。
#[derive(Debug, Clone)]
pub struct MethodRequest {
    pub method_name: String,
    pub payload: Value,
    pub timeouts: InvokeTimeouts,
}

impl MethodRequest {
    pub fn new(method_name: impl Into<String>, payload: Value) -> Self {
        Self {
            method_name: method_name.into(),
            payload,
            timeouts: InvokeTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: InvokeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// 方法调用结果：`{status, payload}`。
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResult {
    pub status: u16,
    pub payload: Value,
}

impl MethodResult {
    pub fn new(status: u16, payload: Value) -> Self {
        Self { status, payload }
    }
}

/// 单个连接实例。
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
    async fn send_event(&self, payload: Vec<u8>, output: Option<&str>) -> Result<(), TransportError>;
    async fn get_twin(&self) -> Result<Arc<dyn TwinHandle>, TransportError>;
    async fn subscribe_inputs(&self) -> Result<(), TransportError>;
    /// 开启指定方法名的投递。
    async fn register_method(&self, name: &str) -> Result<(), TransportError>;
    async fn invoke_method(
        &self,
        device_id: &str,
        module_id: &str,
        request: &MethodRequest,
    ) -> Result<MethodResult, TransportError>;
}

/// 孪生文档句柄。
#[async_trait]
pub trait TwinHandle: Send + Sync {
    /// 订阅期望属性；订阅后先投递一次完整期望属性快照。
    async fn subscribe_desired(&self) -> Result<(), TransportError>;
    async fn update_reported(&self, patch: &Value) -> Result<(), TransportError>;
}

/// 连接器：按连接描述创建连接实例与其事件流。
#[async_trait]
pub trait CloudConnector: Send + Sync {
    async fn create(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(Arc<dyn CloudClient>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>;
}

/// 发送遥测事件。
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_event(&self, payload: &Value, output: Option<&str>) -> Result<(), TransportError>;
}

/// 调用目标模块的方法；任何失败都折算为 status 500 的结果。
#[async_trait]
pub trait MethodInvoker: Send + Sync {
    async fn invoke_method(&self, target: &str, request: MethodRequest) -> MethodResult;
}

/// 上报属性补丁。
#[async_trait]
pub trait PropertyReporter: Send + Sync {
    async fn report_properties(&self, patch: &Value) -> Result<(), TransportError>;
}
