//! 远程方法路由。
//!
//! 所有方法结果统一包装为 `{status, message, payload}` 信封；
//! 未知方法与处理器错误均返回 400，不向调用方抛出。

use api_contract::CommandEnvelope;
use async_trait::async_trait;
use gw_telemetry::{record_method_failure, record_method_received};
use gw_transport::MethodCall;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// 方法处理错误。
#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Handler(String),
}

/// 方法处理器抽象。
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<CommandEnvelope, MethodError>;
}

/// 闭包处理器。
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CommandEnvelope, MethodError>> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> Result<CommandEnvelope, MethodError> {
        (self.func)(payload).await
    }
}

pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandEnvelope, MethodError>> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

/// 将方法参数解析为具体请求类型。
pub fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, MethodError> {
    serde_json::from_value(payload).map_err(|err| MethodError::InvalidPayload(err.to_string()))
}

/// 方法路由表（模块级与设备级会话各一个）。
#[derive(Clone)]
pub struct MethodRouter {
    label: String,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn MethodHandler>>>>,
}

impl MethodRouter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 注册处理器，同名覆盖。
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(name.into(), handler);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .map(|handlers| handlers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(name))
            .unwrap_or(false)
    }

    /// 分发一次方法调用。处理器在独立任务中运行，panic 同样折算为 400。
    pub async fn dispatch(&self, name: &str, payload: Value) -> CommandEnvelope {
        record_method_received();
        info!(target: "gw.control", router = %self.label, method = %name, "method_received");
        let handler = self
            .handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(name).cloned());
        let envelope = match handler {
            None => CommandEnvelope::error(400, format!("An unknown method name was found: {}", name)),
            Some(handler) => match tokio::spawn(async move { handler.handle(payload).await }).await {
                Ok(Ok(envelope)) => envelope,
                Ok(Err(err)) => CommandEnvelope::error(
                    400,
                    format!("An error occurred executing the command {}: {}", name, err),
                ),
                Err(err) => CommandEnvelope::error(
                    400,
                    format!("An error occurred executing the command {}: {}", name, err),
                ),
            },
        };
        if envelope.status >= 400 {
            record_method_failure();
            warn!(
                target: "gw.control",
                router = %self.label,
                method = %name,
                status = envelope.status,
                message = %envelope.message,
                "method_failed"
            );
        } else {
            info!(
                target: "gw.control",
                router = %self.label,
                method = %name,
                status = envelope.status,
                "method_completed"
            );
        }
        envelope
    }

    /// 分发并回复入站调用（传输层状态固定为 200）。
    pub async fn serve(&self, call: MethodCall) {
        let envelope = self.dispatch(&call.method_name, call.payload.clone()).await;
        let body = serde_json::to_value(&envelope).unwrap_or(Value::Null);
        if !call.respond(body) {
            warn!(target: "gw.control", router = %self.label, "method_response_dropped");
        }
    }
}
