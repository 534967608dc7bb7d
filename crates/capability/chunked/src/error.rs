use serde_json::Value;
use std::time::Duration;

/// 分块调用错误。
#[derive(Debug, thiserror::Error)]
pub enum ChunkedCallError {
    #[error("encode error: {0}")]
    Encode(String),
    /// 适配器返回的非成功结果，message 优先使用适配器错误码。
    #[error("{message}")]
    Rejected {
        status: u16,
        message: String,
        detail: Option<Value>,
    },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{method} still processing after {elapsed:?}")]
    Deadline { method: String, elapsed: Duration },
}

impl ChunkedCallError {
    /// 对应命令信封中的 status。
    pub fn status(&self) -> u16 {
        match self {
            ChunkedCallError::Rejected { status, .. } => *status,
            ChunkedCallError::Deadline { .. } => 504,
            _ => 500,
        }
    }

    pub fn detail(&self) -> Option<&Value> {
        match self {
            ChunkedCallError::Rejected { detail, .. } => detail.as_ref(),
            _ => None,
        }
    }
}

/// 批量拉取错误。
#[derive(Debug, thiserror::Error)]
pub enum BulkFetchError {
    #[error(transparent)]
    Chunked(#[from] ChunkedCallError),
    #[error("fetch job was not started: {0}")]
    MissingJobId(String),
    #[error("invalid page: {0}")]
    Page(String),
    #[error("sink error: {0}")]
    Sink(String),
}

impl BulkFetchError {
    pub fn status(&self) -> u16 {
        match self {
            BulkFetchError::Chunked(err) => err.status(),
            _ => 500,
        }
    }
}
