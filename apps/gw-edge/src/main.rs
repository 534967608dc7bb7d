//! 边缘网关模块：模块会话、设备注册表、网关命令与健康端点。

mod gateway;
mod http;

use domain::ConnectionDescriptor;
use gateway::Gateway;
use gw_chunked::{ChunkedCallClient, NoopTransfer};
use gw_config::GatewayConfig;
use gw_health::{ProcessRestarter, SystemResourceProbe};
use gw_module::{ModuleOptions, ModuleRuntime};
use gw_registry::{DeviceRegistry, LocalIdentityProvider, RegistryOptions};
use gw_storage::RedisProvisionCache;
use gw_telemetry::init_tracing;
use gw_transport::{
    CloudConnector, ConnectPolicy, EventSender, MqttConnector, MqttConnectorConfig,
    TransportSession,
};
use http::HttpState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env()?;
    init_tracing();
    let identity = config.identity();

    let mut mqtt = MqttConnectorConfig::new(config.mqtt_host.clone(), config.mqtt_port);
    mqtt.username = config.mqtt_username.clone();
    mqtt.password = config.mqtt_password.clone();
    let connector: Arc<dyn CloudConnector> = Arc::new(MqttConnector::new(mqtt));

    // 模块会话：打开后等待边缘代理稳定再取孪生
    let transport = Arc::new(TransportSession::new(
        identity.module_id.clone(),
        ConnectionDescriptor::for_module(
            config.iothub_hostname.clone(),
            identity.device_id.clone(),
            identity.module_id.clone(),
        ),
        connector.clone(),
        ConnectPolicy {
            attempts: config.connect_attempts,
            retry_delay: config.connect_retry_delay(),
            settle_delay: config.module_settle_delay(),
        },
    ));
    let events: Arc<dyn EventSender> = transport.clone();

    let adapter = ChunkedCallClient::new(transport.clone(), config.adapter_module_id.clone())
        .with_poll_interval(config.chunk_poll_interval())
        .with_max_poll_duration(config.chunk_max_poll_duration());

    let cache = Arc::new(RedisProvisionCache::connect(&config.redis_url)?);
    let registry = Arc::new(DeviceRegistry::new(
        cache,
        Arc::new(LocalIdentityProvider::new(config.iothub_hostname.clone())),
        connector,
        adapter.clone(),
        events.clone(),
        RegistryOptions {
            gateway: identity.clone(),
            id_scope: config.dps_id_scope.clone(),
            device_policy: ConnectPolicy {
                attempts: config.connect_attempts,
                retry_delay: config.connect_retry_delay(),
                settle_delay: Duration::ZERO,
            },
            ready_timeout: config.ready_timeout(),
        },
    ));

    let gateway = Gateway::new(
        adapter,
        registry.clone(),
        events.clone(),
        Arc::new(NoopTransfer),
        config.storage_root.clone(),
    );
    let restarter = Arc::new(ProcessRestarter::new(
        events,
        Duration::from_secs(config.restart_grace_seconds),
    ));
    let runtime = ModuleRuntime::new(
        ModuleOptions {
            identity,
            health_check_retries: config.health_check_retries,
            health_check_interval: Duration::from_secs(config.health_check_interval_seconds),
            ready_timeout: config.ready_timeout(),
        },
        transport,
        Arc::new(gateway),
        restarter,
        Arc::new(SystemResourceProbe::new()),
    );

    if !runtime.start_module().await {
        error!(target: "gw.gateway", "gateway_start_failed");
        return Err("module start failed".into());
    }

    let recovery = registry.recreate_from_cache().await;
    info!(
        target: "gw.gateway",
        recovered = recovery.recovered.len(),
        failed = recovery.failed.len(),
        "device_sessions_recreated"
    );

    let state = HttpState::new(runtime.monitor().clone());
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(target: "gw.gateway", addr = %config.http_addr, "http_listening");
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.close_all().await;
    runtime.shutdown().await;
    info!(target: "gw.gateway", "gateway_stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target: "gw.gateway", error = %err, "shutdown_signal_failed");
    }
}
