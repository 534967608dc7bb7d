use serde_json::{Value, json};
use sysinfo::System;

const UNKNOWN: &str = "Unknown";

/// 启动时上报的主机属性。
pub fn system_properties() -> Value {
    json!({
        "processorArchitecture": std::env::consts::ARCH,
        "hostname": System::host_name().unwrap_or_else(|| UNKNOWN.to_string()),
        "platform": std::env::consts::OS,
        "osType": System::name().unwrap_or_else(|| UNKNOWN.to_string()),
        "osName": System::kernel_version().unwrap_or_else(|| UNKNOWN.to_string()),
        "swVersion": System::long_os_version().unwrap_or_else(|| UNKNOWN.to_string()),
    })
}
