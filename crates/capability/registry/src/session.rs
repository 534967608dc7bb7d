use crate::RegistryError;
use api_contract::CommandEnvelope;
use domain::{ConnectionDescriptor, DeviceProvisionInfo, HealthState};
use gw_chunked::ChunkedCallClient;
use gw_control::{MethodError, MethodRouter, handler_fn};
use gw_transport::{
    CloudConnector, ConnectPolicy, EventSender, PropertyReporter, TransportError, TransportEvent,
    TransportSession,
};
use gw_twin::{ReadyGate, SettingSpec, SettingsMap, TwinSynchronizer};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEVICE_DEBUG_TELEMETRY: &str = "wpDebugTelemetry";
pub const CLIENT_STATE_KEY: &str = "stIoTCentralClientState";
pub const CLIENT_STATE_CONNECTED: &str = "connected";
pub const TURN_ON_INDICATOR: &str = "cmTurnOnIndicator";
pub const TURN_OFF_INDICATOR: &str = "cmTurnOffIndicator";
pub const WRITE_VALUES_METHOD: &str = "WriteValues_v1";

const DEVICE_ID_PROPERTY: &str = "rpDeviceId";
const ENDPOINT_URL_PROPERTY: &str = "rpEndpointUrl";

/// 单个下游设备的云端会话。
pub struct DeviceSession {
    info: DeviceProvisionInfo,
    transport: Arc<TransportSession>,
    synchronizer: Arc<TwinSynchronizer>,
    router: MethodRouter,
    health: Arc<RwLock<HealthState>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    ready_timeout: Option<Duration>,
}

impl DeviceSession {
    pub fn new(
        info: DeviceProvisionInfo,
        descriptor: ConnectionDescriptor,
        connector: Arc<dyn CloudConnector>,
        policy: ConnectPolicy,
        writer: ChunkedCallClient,
    ) -> Self {
        let label = info.device_id.clone();
        let transport = Arc::new(TransportSession::new(
            label.clone(),
            descriptor,
            connector,
            policy,
        ));
        let settings = SettingsMap::new([SettingSpec::new(DEVICE_DEBUG_TELEMETRY, json!(false))]);
        let synchronizer = Arc::new(TwinSynchronizer::new(
            label.clone(),
            settings,
            ReadyGate::new(),
        ));
        let router = MethodRouter::new(label);
        register_indicator(&router, TURN_ON_INDICATOR, true, &info, &writer);
        register_indicator(&router, TURN_OFF_INDICATOR, false, &info, &writer);
        Self {
            info,
            transport,
            synchronizer,
            router,
            health: Arc::new(RwLock::new(HealthState::Good)),
            pump: Mutex::new(None),
            ready_timeout: None,
        }
    }

    /// 等待第一份期望属性的时限；默认一直等待。
    pub fn with_ready_timeout(mut self, ready_timeout: Option<Duration>) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.info.device_id
    }

    pub fn info(&self) -> &DeviceProvisionInfo {
        &self.info
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        self.transport.descriptor()
    }

    pub fn transport(&self) -> &Arc<TransportSession> {
        &self.transport
    }

    pub fn settings(&self) -> &SettingsMap {
        self.synchronizer.settings()
    }

    pub fn router(&self) -> &MethodRouter {
        &self.router
    }

    pub fn health(&self) -> HealthState {
        self.health
            .read()
            .map(|health| *health)
            .unwrap_or(HealthState::Critical)
    }

    /// 连接并等待第一份期望属性，随后上报设备属性与连接状态。
    pub async fn connect(&self) -> Result<(), RegistryError> {
        let events = self.transport.connect().await?;
        self.spawn_pump(events);
        for name in self.router.names() {
            self.transport.register_method(&name).await?;
        }

        if !self.synchronizer.gate().wait_within(self.ready_timeout).await {
            warn!(
                target: "gw.registry",
                device_id = %self.device_id(),
                timeout = ?self.ready_timeout,
                "device_ready_timeout"
            );
            return Err(RegistryError::ReadyTimeout);
        }
        self.transport
            .set_debug_telemetry(self.settings().get_bool(DEVICE_DEBUG_TELEMETRY));
        info!(target: "gw.registry", device_id = %self.device_id(), "device_ready");

        let properties = json!({
            DEVICE_ID_PROPERTY: self.info.device_id,
            ENDPOINT_URL_PROPERTY: self.info.opc_publisher_nodes_request.endpoint_url,
        });
        if let Err(err) = self.transport.report_properties(&properties).await {
            warn!(
                target: "gw.registry",
                device_id = %self.device_id(),
                error = %err,
                "device_properties_report_failed"
            );
        }
        self.transport
            .send_event(&json!({ CLIENT_STATE_KEY: CLIENT_STATE_CONNECTED }), None)
            .await?;
        Ok(())
    }

    fn spawn_pump(&self, events: mpsc::UnboundedReceiver<TransportEvent>) {
        let pump = tokio::spawn(pump_events(
            self.info.device_id.clone(),
            events,
            self.transport.clone(),
            self.synchronizer.clone(),
            self.router.clone(),
            self.health.clone(),
        ));
        if let Ok(mut slot) = self.pump.lock() {
            if let Some(previous) = slot.replace(pump) {
                previous.abort();
            }
        }
    }

    /// 转发下游数据作为设备遥测。
    pub async fn send_data(&self, data: &Value) -> Result<(), TransportError> {
        self.transport.send_event(data, None).await
    }

    pub async fn close(&self) {
        if let Some(pump) = self.pump.lock().ok().and_then(|mut slot| slot.take()) {
            pump.abort();
        }
        self.transport.close().await;
        info!(target: "gw.registry", device_id = %self.device_id(), "device_session_closed");
    }
}

async fn pump_events(
    device_id: String,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    transport: Arc<TransportSession>,
    synchronizer: Arc<TwinSynchronizer>,
    router: MethodRouter,
    health: Arc<RwLock<HealthState>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::DesiredProperties(delta) => {
                synchronizer
                    .on_desired_properties(&delta, transport.as_ref())
                    .await;
                transport.set_debug_telemetry(
                    synchronizer.settings().get_bool(DEVICE_DEBUG_TELEMETRY),
                );
            }
            TransportEvent::MethodInvoked(call) => {
                let router = router.clone();
                tokio::spawn(async move { router.serve(call).await });
            }
            TransportEvent::Error(message) => {
                if let Ok(mut health) = health.write() {
                    *health = HealthState::Critical;
                }
                error!(
                    target: "gw.registry",
                    device_id = %device_id,
                    error = %message,
                    "device_client_error"
                );
            }
            TransportEvent::Connected => {
                info!(target: "gw.registry", device_id = %device_id, "device_client_connected");
            }
            TransportEvent::Disconnected => {
                info!(target: "gw.registry", device_id = %device_id, "device_client_disconnected");
            }
            TransportEvent::InputMessage { input, .. } => {
                warn!(
                    target: "gw.registry",
                    device_id = %device_id,
                    input = %input,
                    "device_input_ignored"
                );
            }
        }
    }
}

/// 指示灯命令：向设备的第一个发布节点写入 true / false。
fn register_indicator(
    router: &MethodRouter,
    name: &str,
    value: bool,
    info: &DeviceProvisionInfo,
    writer: &ChunkedCallClient,
) {
    let request = &info.opc_publisher_nodes_request;
    let node_id = request.opc_nodes.first().map(|node| node.id.clone());
    let endpoint_url = request.endpoint_url.clone();
    let use_security = request.use_security;
    let writer = writer.clone();
    router.register(
        name,
        handler_fn(move |_payload| {
            let node_id = node_id.clone();
            let endpoint_url = endpoint_url.clone();
            let writer = writer.clone();
            async move {
                let node_id = node_id.ok_or_else(|| {
                    MethodError::Handler("the device has no published node to write".to_string())
                })?;
                let body = json!([{
                    "opcEndpoint": { "uri": endpoint_url, "securityMode": u8::from(use_security) },
                    "nodeId": node_id,
                    "value": value,
                }]);
                let envelope = match writer.call(WRITE_VALUES_METHOD, &body).await {
                    Ok(result) => CommandEnvelope::success("Succeeded").with_payload(result),
                    Err(err) => CommandEnvelope::error(err.status(), err.to_string()),
                };
                Ok::<_, MethodError>(envelope)
            }
        }),
    );
}
