use crate::RestartHandler;
use async_trait::async_trait;
use gw_transport::{CLOUD_OUTPUT, EventSender};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 重启事件使用的输出通道。
pub const RESTART_OUTPUT: &str = CLOUD_OUTPUT;

/// 进程退出钩子（测试中替换）。
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// 重启协议：发送重启事件，等待 timeout，再经过宽限期后以 1 退出进程。
pub struct ProcessRestarter {
    sender: Arc<dyn EventSender>,
    grace: Duration,
    exit: ExitHook,
}

impl ProcessRestarter {
    pub fn new(sender: Arc<dyn EventSender>, grace: Duration) -> Self {
        Self {
            sender,
            grace,
            exit: Arc::new(exit_process),
        }
    }

    pub fn with_exit_hook(mut self, exit: ExitHook) -> Self {
        self.exit = exit;
        self
    }
}

fn exit_process(code: i32) {
    std::process::exit(code)
}

#[async_trait]
impl RestartHandler for ProcessRestarter {
    async fn restart(&self, timeout: Duration, reason: &str) {
        info!(
            target: "gw.health",
            reason = %reason,
            timeout_secs = timeout.as_secs(),
            "module_restart"
        );
        let event = json!({
            "evModuleRestart": reason,
            "evModuleStopped": "Module restart",
        });
        if let Err(err) = self.sender.send_event(&event, Some(RESTART_OUTPUT)).await {
            warn!(target: "gw.health", error = %err, "module_restart_event_failed");
        }
        tokio::time::sleep(timeout).await;

        let grace = self.grace;
        let exit = self.exit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            exit(1);
        });
    }
}
