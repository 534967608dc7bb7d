/// 传输层错误。
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("connect error: {0}")]
    Connect(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("payload error: {0}")]
    Payload(String),
}

/// 连接重试耗尽。
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}
