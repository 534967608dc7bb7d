use crate::{
    CloudClient, CloudConnector, ConnectError, EventSender, MethodInvoker, MethodRequest,
    MethodResult, PropertyReporter, TransportError, TransportEvent, TwinHandle,
};
use async_trait::async_trait;
use domain::{ConnectionDescriptor, ConnectionState};
use gw_telemetry::{
    record_connect_attempt, record_connect_failure, record_event_sent, record_invoke_call,
    record_properties_reported, record_session_invalidated,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// 连接策略。
#[derive(Debug, Clone, Copy)]
pub struct ConnectPolicy {
    pub attempts: u32,
    /// 两次失败之间的等待，最后一次失败后不再等待。
    pub retry_delay: Duration,
    /// 打开连接后、获取孪生前的稳定等待。
    pub settle_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(5),
            settle_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    state: ConnectionState,
    client: Option<Arc<dyn CloudClient>>,
    twin: Option<Arc<dyn TwinHandle>>,
    forwarder: Option<JoinHandle<()>>,
}

struct SessionInner {
    slot: RwLock<SessionSlot>,
    generation: AtomicU64,
}

impl SessionInner {
    /// 传输错误回调：立即清空连接与孪生句柄。
    fn invalidate(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        match self.slot.write() {
            Ok(mut slot) => {
                slot.client = None;
                slot.twin = None;
                slot.state = ConnectionState::Faulted;
                true
            }
            Err(_) => false,
        }
    }
}

/// 一个模块或一个设备到云端的传输会话。
///
/// 重连时整体销毁并重建，不在原连接上修补。
pub struct TransportSession {
    label: String,
    descriptor: ConnectionDescriptor,
    connector: Arc<dyn CloudConnector>,
    policy: ConnectPolicy,
    inner: Arc<SessionInner>,
    debug_telemetry: AtomicBool,
}

impl TransportSession {
    pub fn new(
        label: impl Into<String>,
        descriptor: ConnectionDescriptor,
        connector: Arc<dyn CloudConnector>,
        policy: ConnectPolicy,
    ) -> Self {
        Self {
            label: label.into(),
            descriptor,
            connector,
            policy,
            inner: Arc::new(SessionInner {
                slot: RwLock::new(SessionSlot::default()),
                generation: AtomicU64::new(0),
            }),
            debug_telemetry: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .slot
            .read()
            .map(|slot| slot.state)
            .unwrap_or(ConnectionState::Faulted)
    }

    /// 是否存在可用的连接对象。
    pub fn has_session(&self) -> bool {
        self.inner
            .slot
            .read()
            .map(|slot| slot.client.is_some())
            .unwrap_or(false)
    }

    pub fn set_debug_telemetry(&self, enabled: bool) {
        self.debug_telemetry.store(enabled, Ordering::Relaxed);
    }

    pub fn debug_telemetry(&self) -> bool {
        self.debug_telemetry.load(Ordering::Relaxed)
    }

    /// 建立连接，返回本次会话的事件流。
    ///
    /// 先关闭旧会话；失败重试 `policy.attempts` 次，仅在两次失败之间等待。
    pub async fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, ConnectError> {
        self.teardown().await;
        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            record_connect_attempt();
            info!(
                target: "gw.transport",
                session = %self.label,
                client_id = %self.descriptor.client_id(),
                attempt = attempt,
                "transport_connect_attempt"
            );
            match self.try_connect().await {
                Ok(events) => {
                    info!(
                        target: "gw.transport",
                        session = %self.label,
                        attempt = attempt,
                        "transport_connected"
                    );
                    return Ok(events);
                }
                Err(err) => {
                    record_connect_failure();
                    warn!(
                        target: "gw.transport",
                        session = %self.label,
                        attempt = attempt,
                        error = %err,
                        "transport_connect_failed"
                    );
                    last_error = err.to_string();
                    self.teardown().await;
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        Err(ConnectError::Exhausted {
            attempts,
            last_error,
        })
    }

    async fn try_connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.set_state(ConnectionState::Connecting);
        let (client, raw_events) = self.connector.create(&self.descriptor).await?;
        if let Err(err) = client.open().await {
            let _ = client.close().await;
            return Err(err);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_events(
            self.inner.clone(),
            self.label.clone(),
            generation,
            raw_events,
            events_tx,
        ));
        if let Ok(mut slot) = self.inner.slot.write() {
            slot.client = Some(client.clone());
            slot.forwarder = Some(forwarder);
            slot.state = ConnectionState::Connected;
        }

        if !self.policy.settle_delay.is_zero() {
            tokio::time::sleep(self.policy.settle_delay).await;
        }

        let twin = client.get_twin().await?;
        if let Ok(mut slot) = self.inner.slot.write() {
            slot.twin = Some(twin.clone());
        }
        twin.subscribe_desired().await?;
        client.subscribe_inputs().await?;
        Ok(events_rx)
    }

    /// 关闭会话（可重复调用）。
    pub async fn close(&self) {
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&self) {
        let (client, forwarder) = match self.inner.slot.write() {
            Ok(mut slot) => {
                slot.twin = None;
                (slot.client.take(), slot.forwarder.take())
            }
            Err(_) => (None, None),
        };
        // 使旧会话的错误回调失效
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(client) = client {
            if let Err(err) = client.close().await {
                warn!(
                    target: "gw.transport",
                    session = %self.label,
                    error = %err,
                    "transport_close_failed"
                );
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut slot) = self.inner.slot.write() {
            slot.state = state;
        }
    }

    fn client(&self) -> Result<Arc<dyn CloudClient>, TransportError> {
        self.inner
            .slot
            .read()
            .ok()
            .and_then(|slot| slot.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn twin(&self) -> Result<Arc<dyn TwinHandle>, TransportError> {
        self.inner
            .slot
            .read()
            .ok()
            .and_then(|slot| slot.twin.clone())
            .ok_or(TransportError::NotConnected)
    }

    /// 开启方法投递。
    pub async fn register_method(&self, name: &str) -> Result<(), TransportError> {
        self.client()?.register_method(name).await
    }
}

async fn forward_events(
    inner: Arc<SessionInner>,
    label: String,
    generation: u64,
    mut raw_events: mpsc::UnboundedReceiver<TransportEvent>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(event) = raw_events.recv().await {
        match &event {
            TransportEvent::Error(message) => {
                if inner.invalidate(generation) {
                    record_session_invalidated();
                    warn!(
                        target: "gw.transport",
                        session = %label,
                        error = %message,
                        "transport_session_invalidated"
                    );
                }
            }
            TransportEvent::Disconnected => {
                info!(target: "gw.transport", session = %label, "transport_disconnected");
            }
            _ => {}
        }
        if events_tx.send(event).is_err() {
            break;
        }
    }
}

#[async_trait]
impl EventSender for TransportSession {
    async fn send_event(&self, payload: &Value, output: Option<&str>) -> Result<(), TransportError> {
        let client = self.client()?;
        let body =
            serde_json::to_vec(payload).map_err(|err| TransportError::Payload(err.to_string()))?;
        if self.debug_telemetry() {
            info!(
                target: "gw.transport",
                session = %self.label,
                output = ?output,
                payload = %payload,
                "event_send"
            );
        } else {
            info!(
                target: "gw.transport",
                session = %self.label,
                output = ?output,
                payload_size = body.len(),
                "event_send"
            );
        }
        client.send_event(body, output).await?;
        record_event_sent();
        Ok(())
    }
}

#[async_trait]
impl PropertyReporter for TransportSession {
    async fn report_properties(&self, patch: &Value) -> Result<(), TransportError> {
        let twin = self.twin()?;
        if self.debug_telemetry() {
            info!(
                target: "gw.transport",
                session = %self.label,
                patch = %patch,
                "properties_report"
            );
        }
        twin.update_reported(patch).await?;
        record_properties_reported();
        Ok(())
    }
}

#[async_trait]
impl MethodInvoker for TransportSession {
    async fn invoke_method(&self, target: &str, request: MethodRequest) -> MethodResult {
        record_invoke_call();
        let client = match self.client() {
            Ok(client) => client,
            Err(err) => return failed_invoke(&self.label, target, &request, err),
        };
        if self.debug_telemetry() {
            info!(
                target: "gw.transport",
                session = %self.label,
                target_module = %target,
                method = %request.method_name,
                payload = %request.payload,
                "method_invoke"
            );
        }
        match client
            .invoke_method(&self.descriptor.device_id, target, &request)
            .await
        {
            Ok(result) => {
                info!(
                    target: "gw.transport",
                    session = %self.label,
                    target_module = %target,
                    method = %request.method_name,
                    status = result.status,
                    "method_invoke_returned"
                );
                result
            }
            Err(err) => failed_invoke(&self.label, target, &request, err),
        }
    }
}

fn failed_invoke(
    label: &str,
    target: &str,
    request: &MethodRequest,
    err: TransportError,
) -> MethodResult {
    warn!(
        target: "gw.transport",
        session = %label,
        target_module = %target,
        method = %request.method_name,
        error = %err,
        "method_invoke_failed"
    );
    MethodResult::new(500, json!({ "message": err.to_string() }))
}
