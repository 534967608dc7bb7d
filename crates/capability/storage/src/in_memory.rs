//! 开通缓存内存实现（用于测试与本地运行）。

use crate::ProvisionCacheStore;
use crate::error::StorageError;
use domain::DeviceCacheEntry;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct InMemoryProvisionCache {
    values: RwLock<HashMap<String, Vec<DeviceCacheEntry>>>,
}

impl InMemoryProvisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(key: &str, entries: Vec<DeviceCacheEntry>) -> Self {
        let mut values = HashMap::new();
        values.insert(key.to_string(), entries);
        Self {
            values: RwLock::new(values),
        }
    }
}

#[async_trait::async_trait]
impl ProvisionCacheStore for InMemoryProvisionCache {
    async fn get(&self, key: &str) -> Result<Vec<DeviceCacheEntry>, StorageError> {
        let values = self.values.read().map_err(|_| StorageError::Lock)?;
        Ok(values.get(key).cloned().unwrap_or_default())
    }

    async fn set(&self, key: &str, entries: &[DeviceCacheEntry]) -> Result<(), StorageError> {
        let mut values = self.values.write().map_err(|_| StorageError::Lock)?;
        values.insert(key.to_string(), entries.to_vec());
        Ok(())
    }
}
