//! # Gateway Storage 模块
//!
//! 设备开通缓存的持久化抽象。
//!
//! 缓存只需要整体读写语义：启动时读取一次，用于在进程崩溃后重建设备会话；
//! 开通成功时写入（按 deviceId 更新或追加），注销时删除。
//!
//! ## 存储实现
//!
//! - [`InMemoryProvisionCache`]：`RwLock<HashMap>`，用于测试和无 Redis 的本地运行
//! - [`RedisProvisionCache`]：JSON 序列化后写入单个 Redis 键
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use gw_storage::{ProvisionCacheStore, RedisProvisionCache, DEVICE_CACHE_KEY};
//!
//! let cache = RedisProvisionCache::connect("redis://127.0.0.1:6379")?;
//! let entries = cache.get(DEVICE_CACHE_KEY).await?;
//! ```

pub mod error;
pub mod in_memory;
pub mod redis;

pub use error::StorageError;
pub use in_memory::InMemoryProvisionCache;
pub use redis::RedisProvisionCache;

use domain::DeviceCacheEntry;

/// 设备缓存使用的键名。
pub const DEVICE_CACHE_KEY: &str = "deviceCache";

/// 开通缓存存储接口（整体 get/set）。
#[async_trait::async_trait]
pub trait ProvisionCacheStore: Send + Sync {
    /// 读取整个集合；键不存在时返回空集合。
    async fn get(&self, key: &str) -> Result<Vec<DeviceCacheEntry>, StorageError>;

    async fn set(&self, key: &str, entries: &[DeviceCacheEntry]) -> Result<(), StorageError>;
}

/// 按 deviceId 更新或追加。
pub fn upsert_entry(entries: &mut Vec<DeviceCacheEntry>, entry: DeviceCacheEntry) {
    match entries
        .iter_mut()
        .find(|existing| existing.device_id() == entry.device_id())
    {
        Some(existing) => *existing = entry,
        None => entries.push(entry),
    }
}

/// 删除指定设备，返回是否存在。
pub fn remove_entry(entries: &mut Vec<DeviceCacheEntry>, device_id: &str) -> bool {
    let before = entries.len();
    entries.retain(|entry| entry.device_id() != device_id);
    entries.len() != before
}
