use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer failed: {0}")]
    Failed(String),
}

/// 结果文件的外部传输（上传等）。
#[async_trait]
pub trait ArtifactTransfer: Send + Sync {
    async fn transfer(&self, path: &Path) -> Result<(), TransferError>;
}

/// 空传输（保留本地文件，仅记录日志）。
#[derive(Debug, Default)]
pub struct NoopTransfer;

#[async_trait]
impl ArtifactTransfer for NoopTransfer {
    async fn transfer(&self, path: &Path) -> Result<(), TransferError> {
        info!(target: "gw.chunked", path = %path.display(), "artifact_kept_locally");
        Ok(())
    }
}

/// 交给外部传输后立即返回，不等待完成。
pub fn hand_off(transfer: Arc<dyn ArtifactTransfer>, path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = transfer.transfer(&path).await {
            warn!(
                target: "gw.chunked",
                path = %path.display(),
                error = %err,
                "artifact_transfer_failed"
            );
        }
    })
}
