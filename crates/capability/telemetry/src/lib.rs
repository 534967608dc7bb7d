//! 追踪初始化、关联 ID 与进程级计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 请求级追踪标识。
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub session_invalidations: u64,
    pub events_sent: u64,
    pub properties_reported: u64,
    pub methods_received: u64,
    pub method_failures: u64,
    pub invoke_calls: u64,
    pub chunked_calls: u64,
    pub chunked_polls: u64,
    pub chunked_failures: u64,
    pub pages_fetched: u64,
    pub health_degraded: u64,
    pub restarts_requested: u64,
    pub devices_provisioned: u64,
    pub devices_deprovisioned: u64,
    pub cache_write_failures: u64,
}

/// 网关进程级计数器。
pub struct TelemetryMetrics {
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    session_invalidations: AtomicU64,
    events_sent: AtomicU64,
    properties_reported: AtomicU64,
    methods_received: AtomicU64,
    method_failures: AtomicU64,
    invoke_calls: AtomicU64,
    chunked_calls: AtomicU64,
    chunked_polls: AtomicU64,
    chunked_failures: AtomicU64,
    pages_fetched: AtomicU64,
    health_degraded: AtomicU64,
    restarts_requested: AtomicU64,
    devices_provisioned: AtomicU64,
    devices_deprovisioned: AtomicU64,
    cache_write_failures: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            session_invalidations: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            properties_reported: AtomicU64::new(0),
            methods_received: AtomicU64::new(0),
            method_failures: AtomicU64::new(0),
            invoke_calls: AtomicU64::new(0),
            chunked_calls: AtomicU64::new(0),
            chunked_polls: AtomicU64::new(0),
            chunked_failures: AtomicU64::new(0),
            pages_fetched: AtomicU64::new(0),
            health_degraded: AtomicU64::new(0),
            restarts_requested: AtomicU64::new(0),
            devices_provisioned: AtomicU64::new(0),
            devices_deprovisioned: AtomicU64::new(0),
            cache_write_failures: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            session_invalidations: self.session_invalidations.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            properties_reported: self.properties_reported.load(Ordering::Relaxed),
            methods_received: self.methods_received.load(Ordering::Relaxed),
            method_failures: self.method_failures.load(Ordering::Relaxed),
            invoke_calls: self.invoke_calls.load(Ordering::Relaxed),
            chunked_calls: self.chunked_calls.load(Ordering::Relaxed),
            chunked_polls: self.chunked_polls.load(Ordering::Relaxed),
            chunked_failures: self.chunked_failures.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            health_degraded: self.health_degraded.load(Ordering::Relaxed),
            restarts_requested: self.restarts_requested.load(Ordering::Relaxed),
            devices_provisioned: self.devices_provisioned.load(Ordering::Relaxed),
            devices_deprovisioned: self.devices_deprovisioned.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 request_id 与 trace_id。
pub fn new_request_ids() -> RequestIds {
    RequestIds {
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// 生成关联 ID（`$rid`、拉取任务 ID）。
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 记录一次连接尝试。
pub fn record_connect_attempt() {
    metrics().connect_attempts.fetch_add(1, Ordering::Relaxed);
}

/// 记录一次连接失败。
pub fn record_connect_failure() {
    metrics().connect_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录会话因传输错误失效。
pub fn record_session_invalidated() {
    metrics()
        .session_invalidations
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_event_sent() {
    metrics().events_sent.fetch_add(1, Ordering::Relaxed);
}

pub fn record_properties_reported() {
    metrics().properties_reported.fetch_add(1, Ordering::Relaxed);
}

/// 记录收到的远程方法调用。
pub fn record_method_received() {
    metrics().methods_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录返回 status >= 400 的方法调用。
pub fn record_method_failure() {
    metrics().method_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录对下游模块的方法调用。
pub fn record_invoke_call() {
    metrics().invoke_calls.fetch_add(1, Ordering::Relaxed);
}

pub fn record_chunked_call() {
    metrics().chunked_calls.fetch_add(1, Ordering::Relaxed);
}

pub fn record_chunked_poll() {
    metrics().chunked_polls.fetch_add(1, Ordering::Relaxed);
}

pub fn record_chunked_failure() {
    metrics().chunked_failures.fetch_add(1, Ordering::Relaxed);
}

pub fn record_page_fetched() {
    metrics().pages_fetched.fetch_add(1, Ordering::Relaxed);
}

/// 记录一次低于 Good 的健康观测。
pub fn record_health_degraded() {
    metrics().health_degraded.fetch_add(1, Ordering::Relaxed);
}

pub fn record_restart_requested() {
    metrics().restarts_requested.fetch_add(1, Ordering::Relaxed);
}

pub fn record_device_provisioned() {
    metrics()
        .devices_provisioned
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_device_deprovisioned() {
    metrics()
        .devices_deprovisioned
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录开通缓存写入失败（不致命，仅影响崩溃后恢复）。
pub fn record_cache_write_failure() {
    metrics()
        .cache_write_failures
        .fetch_add(1, Ordering::Relaxed);
}
