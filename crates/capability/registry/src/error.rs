use gw_storage::StorageError;
use gw_transport::{ConnectError, TransportError};

/// 注册表错误。
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("identity registration failed: {0}")]
    Identity(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no desired properties received before the ready timeout")]
    ReadyTimeout,
}
