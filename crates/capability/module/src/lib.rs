//! 模块运行时。
//!
//! 启动序列：连接 → 等待第一份期望属性 → 业务就绪回调 → 注册方法 →
//! 上报主机属性 → 发送 `evModuleStarted` → 开始健康轮询。

mod error;
mod runtime;
mod system;

pub use error::ModuleError;
pub use runtime::{
    MODULE_DEBUG_TELEMETRY, MODULE_STARTED_EVENT, ModuleHooks, ModuleOptions, ModuleRuntime,
    RESTART_COMMAND_REASON, RESTART_GATEWAY_MODULE,
};
pub use system::system_properties;
