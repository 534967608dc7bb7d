use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// 一次性就绪闸门：首次释放后永久打开。
#[derive(Debug, Clone)]
pub struct ReadyGate {
    sender: Arc<watch::Sender<bool>>,
}

impl ReadyGate {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 释放闸门；仅第一次调用返回 true。
    pub fn release(&self) -> bool {
        self.sender.send_if_modified(|released| {
            if *released {
                false
            } else {
                *released = true;
                true
            }
        })
    }

    pub fn is_released(&self) -> bool {
        *self.sender.borrow()
    }

    /// 等待闸门打开。
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|released| *released).await;
    }

    /// 带时限等待；超时返回 false。`None` 表示一直等待。
    pub async fn wait_within(&self, limit: Option<Duration>) -> bool {
        match limit {
            Some(limit) => tokio::time::timeout(limit, self.wait()).await.is_ok(),
            None => {
                self.wait().await;
                true
            }
        }
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}
