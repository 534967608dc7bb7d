//! 健康检查与重启协议。
//!
//! 连续低于 Good 的观测达到阈值后请求重启；重启总是退出进程，由外部编排器拉起。

mod probe;
mod restart;

pub use probe::{ResourceProbe, SystemResourceProbe};
pub use restart::{ExitHook, ProcessRestarter, RESTART_OUTPUT};

use async_trait::async_trait;
use domain::HealthState;
use gw_telemetry::{record_health_degraded, record_restart_requested};
use gw_transport::TransportSession;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 健康检查触发重启时使用的原因。
pub const HEALTH_RESTART_REASON: &str = "health check exceeded retry threshold";

/// 健康检查错误。
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("probe error: {0}")]
    Probe(String),
}

/// 业务健康探针。
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<HealthState, HealthError>;
}

/// 重启请求处理。
#[async_trait]
pub trait RestartHandler: Send + Sync {
    async fn restart(&self, timeout: Duration, reason: &str);
}

/// 会话存在性判定。
pub trait SessionPresence: Send + Sync {
    fn has_session(&self) -> bool;
}

impl SessionPresence for TransportSession {
    fn has_session(&self) -> bool {
        TransportSession::has_session(self)
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    health: HealthState,
    fail_streak: u32,
    forced_critical: bool,
    restart_requested: bool,
}

/// 健康监视器（模块级一个）。
pub struct HealthMonitor {
    label: String,
    probe: Arc<dyn HealthProbe>,
    resources: Arc<dyn ResourceProbe>,
    restarter: Arc<dyn RestartHandler>,
    presence: Arc<dyn SessionPresence>,
    retries: u32,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(
        label: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
        resources: Arc<dyn ResourceProbe>,
        restarter: Arc<dyn RestartHandler>,
        presence: Arc<dyn SessionPresence>,
        retries: u32,
    ) -> Self {
        Self {
            label: label.into(),
            probe,
            resources,
            restarter,
            presence,
            retries: retries.max(1),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// 最近一次观测到的健康状态。
    pub fn last_health(&self) -> HealthState {
        self.state
            .lock()
            .map(|state| state.health)
            .unwrap_or(HealthState::Critical)
    }

    pub fn fail_streak(&self) -> u32 {
        self.state.lock().map(|state| state.fail_streak).unwrap_or(0)
    }

    /// 传输错误回调：强制置为 Critical。
    pub fn mark_critical(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.health = HealthState::Critical;
            state.forced_critical = true;
        }
        warn!(target: "gw.health", monitor = %self.label, "health_forced_critical");
    }

    /// 执行一次健康检查。
    pub async fn check_health(&self) -> HealthState {
        let (prior, forced) = match self.state.lock() {
            Ok(state) => (state.health, state.forced_critical),
            Err(_) => (HealthState::Critical, true),
        };

        let observed = if !self.presence.has_session() && !forced {
            HealthState::Good
        } else if prior == HealthState::Good {
            match self.resources.free_memory_kb() {
                None | Some(0) => {
                    warn!(target: "gw.health", monitor = %self.label, "free_memory_exhausted");
                    HealthState::Critical
                }
                Some(_) => match self.probe.probe().await {
                    Ok(health) => health,
                    Err(err) => {
                        error!(
                            target: "gw.health",
                            monitor = %self.label,
                            error = %err,
                            "health_probe_failed"
                        );
                        HealthState::Critical
                    }
                },
            }
        } else {
            prior
        };

        let restart = match self.state.lock() {
            Ok(mut state) => {
                state.health = observed;
                if observed == HealthState::Good {
                    state.fail_streak = 0;
                    false
                } else {
                    state.fail_streak += 1;
                    if state.fail_streak >= self.retries && !state.restart_requested {
                        state.restart_requested = true;
                        true
                    } else {
                        false
                    }
                }
            }
            Err(_) => false,
        };

        if observed < HealthState::Good {
            record_health_degraded();
            warn!(
                target: "gw.health",
                monitor = %self.label,
                health = %observed,
                fail_streak = self.fail_streak(),
                "health_degraded"
            );
        }
        if restart {
            record_restart_requested();
            warn!(
                target: "gw.health",
                monitor = %self.label,
                retries = self.retries,
                "health_restart_requested"
            );
            self.restarter
                .restart(Duration::ZERO, HEALTH_RESTART_REASON)
                .await;
        }
        observed
    }

    /// 按固定周期轮询健康状态。
    pub fn spawn_polling(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let health = self.check_health().await;
                info!(
                    target: "gw.health",
                    monitor = %self.label,
                    health = %health,
                    "health_check"
                );
            }
        })
    }
}
