//! 设备注册表。
//!
//! - `DeviceRegistry`：开通 / 注销 / 启动时从缓存重建，维护内存中的设备会话表
//! - `DeviceSession`：单个下游设备到云端的会话（孪生设置、指示灯命令、遥测转发）
//! - `IdentityProvider`：设备身份注册（DPS 握手本身不在此实现）

mod error;
mod identity;
mod registry;
mod session;

pub use error::RegistryError;
pub use identity::{IdentityProvider, LocalIdentityProvider, Registration, RegistrationRequest};
pub use registry::{
    DeprovisionOutcome, DeviceRegistry, RecoverySummary, RegistryOptions, UNPUBLISH_NODES_METHOD,
};
pub use session::{
    CLIENT_STATE_CONNECTED, CLIENT_STATE_KEY, DEVICE_DEBUG_TELEMETRY, DeviceSession,
    TURN_OFF_INDICATOR, TURN_ON_INDICATOR, WRITE_VALUES_METHOD,
};
