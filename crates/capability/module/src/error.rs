use gw_transport::{ConnectError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("module ready hook failed: {0}")]
    Ready(String),
    #[error("no desired properties received before the ready timeout")]
    ReadyTimeout,
}
