//! Redis 开通缓存实现

use crate::ProvisionCacheStore;
use crate::error::StorageError;
use domain::DeviceCacheEntry;
use redis::AsyncCommands;

fn cache_key(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

/// Redis 开通缓存：整个集合序列化为一个 JSON 字符串。
pub struct RedisProvisionCache {
    client: redis::Client,
    namespace: String,
}

impl RedisProvisionCache {
    pub fn new(client: redis::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// 使用默认命名空间 `gateway` 连接。
    pub fn connect(redis_url: &str) -> Result<Self, StorageError> {
        Self::connect_with_namespace(redis_url, "gateway")
    }

    pub fn connect_with_namespace(redis_url: &str, namespace: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self::new(client, namespace))
    }
}

#[async_trait::async_trait]
impl ProvisionCacheStore for RedisProvisionCache {
    async fn get(&self, key: &str) -> Result<Vec<DeviceCacheEntry>, StorageError> {
        let mut connection = self.client.get_multiplexed_tokio_connection().await?;
        let data: Option<String> = connection.get(cache_key(&self.namespace, key)).await?;
        let Some(data) = data else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&data)?)
    }

    async fn set(&self, key: &str, entries: &[DeviceCacheEntry]) -> Result<(), StorageError> {
        let mut connection = self.client.get_multiplexed_tokio_connection().await?;
        let data = serde_json::to_string(entries)?;
        connection
            .set::<_, _, ()>(cache_key(&self.namespace, key), data)
            .await?;
        Ok(())
    }
}
