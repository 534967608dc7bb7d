use crate::{ModuleError, system_properties};
use api_contract::CommandEnvelope;
use async_trait::async_trait;
use domain::{HealthState, ModuleIdentity};
use gw_control::{MethodError, MethodRouter, handler_fn};
use gw_health::{HealthMonitor, HealthProbe, ResourceProbe, RestartHandler};
use gw_transport::{
    CLOUD_OUTPUT, EventSender, PropertyReporter, TransportEvent, TransportSession,
};
use gw_twin::{ReadyGate, SettingSpec, SettingsMap, TwinSynchronizer};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const MODULE_DEBUG_TELEMETRY: &str = "wpDebugTelemetry";
pub const RESTART_GATEWAY_MODULE: &str = "cmRestartGatewayModule";
pub const RESTART_COMMAND_REASON: &str = "RestartModule command received";
pub const MODULE_STARTED_EVENT: &str = "evModuleStarted";

/// 业务模块回调。
#[async_trait]
pub trait ModuleHooks: Send + Sync {
    /// 业务侧的模块孪生设置。
    fn setting_specs(&self) -> Vec<SettingSpec> {
        Vec::new()
    }

    /// 注册业务方法。
    fn register_methods(&self, router: &MethodRouter);

    /// 收到第一份期望属性后调用。
    async fn on_ready(&self, settings: &SettingsMap) -> Result<(), ModuleError>;

    /// 路由到模块的入站消息。
    async fn on_input(&self, input: &str, payload: &Value);

    /// 业务健康状态（仅在模块健康为 Good 时调用）。
    async fn on_health(&self) -> HealthState;
}

struct HooksProbe(Arc<dyn ModuleHooks>);

#[async_trait]
impl HealthProbe for HooksProbe {
    async fn probe(&self) -> Result<HealthState, gw_health::HealthError> {
        Ok(self.0.on_health().await)
    }
}

#[derive(Debug, Clone)]
pub struct ModuleOptions {
    pub identity: ModuleIdentity,
    pub health_check_retries: u32,
    pub health_check_interval: Duration,
    /// 等待第一份期望属性的时限；`None` 表示一直等待。
    pub ready_timeout: Option<Duration>,
}

/// 模块运行时：持有模块级传输会话、设置表、方法路由与健康监视器。
pub struct ModuleRuntime {
    options: ModuleOptions,
    transport: Arc<TransportSession>,
    synchronizer: Arc<TwinSynchronizer>,
    router: MethodRouter,
    hooks: Arc<dyn ModuleHooks>,
    monitor: Arc<HealthMonitor>,
    restarter: Arc<dyn RestartHandler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ModuleRuntime {
    pub fn new(
        options: ModuleOptions,
        transport: Arc<TransportSession>,
        hooks: Arc<dyn ModuleHooks>,
        restarter: Arc<dyn RestartHandler>,
        resources: Arc<dyn ResourceProbe>,
    ) -> Self {
        let label = options.identity.module_id.clone();
        let mut specs = vec![SettingSpec::new(MODULE_DEBUG_TELEMETRY, json!(true))];
        specs.extend(hooks.setting_specs());
        let synchronizer = Arc::new(TwinSynchronizer::new(
            label.clone(),
            SettingsMap::new(specs),
            ReadyGate::new(),
        ));
        let router = MethodRouter::new(label.clone());
        hooks.register_methods(&router);
        let monitor = Arc::new(HealthMonitor::new(
            label,
            Arc::new(HooksProbe(hooks.clone())),
            resources,
            restarter.clone(),
            transport.clone(),
            options.health_check_retries,
        ));
        Self {
            options,
            transport,
            synchronizer,
            router,
            hooks,
            monitor,
            restarter,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &ModuleIdentity {
        &self.options.identity
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

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// 最近一次观测到的模块健康。
    pub fn health(&self) -> HealthState {
        self.monitor.last_health()
    }

    /// 启动模块；失败返回 false，由调用方决定是否退出进程。
    pub async fn start_module(&self) -> bool {
        match self.start().await {
            Ok(()) => {
                info!(
                    target: "gw.module",
                    module_id = %self.options.identity.module_id,
                    device_id = %self.options.identity.device_id,
                    "module_started"
                );
                true
            }
            Err(err) => {
                error!(
                    target: "gw.module",
                    module_id = %self.options.identity.module_id,
                    error = %err,
                    "module_start_failed"
                );
                false
            }
        }
    }

    async fn start(&self) -> Result<(), ModuleError> {
        let events = self.transport.connect().await?;
        self.spawn_pump(events);

        let ready_timeout = self.options.ready_timeout;
        if !self.synchronizer.gate().wait_within(ready_timeout).await {
            warn!(target: "gw.module", timeout = ?ready_timeout, "module_ready_timeout");
            return Err(ModuleError::ReadyTimeout);
        }
        self.transport
            .set_debug_telemetry(self.settings().get_bool(MODULE_DEBUG_TELEMETRY));
        self.hooks.on_ready(self.settings()).await?;

        self.router
            .register(RESTART_GATEWAY_MODULE, restart_handler(self.restarter.clone()));
        for name in self.router.names() {
            self.transport.register_method(&name).await?;
        }

        if let Err(err) = self.transport.report_properties(&system_properties()).await {
            warn!(target: "gw.module", error = %err, "system_properties_report_failed");
        }
        self.transport
            .send_event(
                &json!({ MODULE_STARTED_EVENT: "Module initialization" }),
                Some(CLOUD_OUTPUT),
            )
            .await?;

        let poller = self
            .monitor
            .clone()
            .spawn_polling(self.options.health_check_interval);
        self.track(poller);
        Ok(())
    }

    fn spawn_pump(&self, events: mpsc::UnboundedReceiver<TransportEvent>) {
        let pump = tokio::spawn(pump_events(
            events,
            self.transport.clone(),
            self.synchronizer.clone(),
            self.router.clone(),
            self.hooks.clone(),
            self.monitor.clone(),
        ));
        self.track(pump);
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// 停止后台任务并关闭模块会话。
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
        self.transport.close().await;
        info!(target: "gw.module", "module_stopped");
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    transport: Arc<TransportSession>,
    synchronizer: Arc<TwinSynchronizer>,
    router: MethodRouter,
    hooks: Arc<dyn ModuleHooks>,
    monitor: Arc<HealthMonitor>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::DesiredProperties(delta) => {
                synchronizer
                    .on_desired_properties(&delta, transport.as_ref())
                    .await;
                transport.set_debug_telemetry(
                    synchronizer.settings().get_bool(MODULE_DEBUG_TELEMETRY),
                );
            }
            TransportEvent::MethodInvoked(call) => {
                let router = router.clone();
                tokio::spawn(async move { router.serve(call).await });
            }
            TransportEvent::InputMessage { input, payload } => {
                hooks.on_input(&input, &payload).await;
            }
            TransportEvent::Error(message) => {
                monitor.mark_critical();
                error!(target: "gw.module", error = %message, "module_client_error");
            }
            TransportEvent::Connected => {
                info!(target: "gw.module", "module_client_connected");
            }
            TransportEvent::Disconnected => {
                info!(target: "gw.module", "module_client_disconnected");
            }
        }
    }
}

/// `cmRestartGatewayModule {timeout}`：等待 timeout 秒后回复，进程随后退出。
fn restart_handler(restarter: Arc<dyn RestartHandler>) -> Arc<dyn gw_control::MethodHandler> {
    handler_fn(move |payload: Value| {
        let restarter = restarter.clone();
        async move {
            let timeout = payload.get("timeout").and_then(Value::as_u64).unwrap_or(0);
            restarter
                .restart(Duration::from_secs(timeout), RESTART_COMMAND_REASON)
                .await;
            Ok::<_, MethodError>(CommandEnvelope::success("Restart module request received"))
        }
    })
}
