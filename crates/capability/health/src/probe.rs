use std::sync::Mutex;
use sysinfo::System;

/// 资源探针：空闲内存（KB），不可用时为 None。
pub trait ResourceProbe: Send + Sync {
    fn free_memory_kb(&self) -> Option<u64>;
}

/// 基于 sysinfo 的资源探针。
pub struct SystemResourceProbe {
    system: Mutex<System>,
}

impl SystemResourceProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemResourceProbe {
    fn free_memory_kb(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        Some(system.available_memory() / 1024)
    }
}
