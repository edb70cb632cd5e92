//! 本地持久化存储模块
//!
//! 按命名空间组织的键值存储，值为 JSON。对账引擎是唯一写入方；
//! 读到缺失或损坏的数据时返回空值并告警，绝不向上抛错阻塞用户操作。

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

/// 持久化存储统一接口
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// 读取命名空间下的值，缺失时返回 None
    async fn get(&self, namespace: &str) -> Result<Option<Value>>;

    /// 写入命名空间下的值（整体替换）
    async fn set(&self, namespace: &str, value: Value) -> Result<()>;

    /// 删除命名空间
    async fn remove(&self, namespace: &str) -> Result<()>;
}

/// 读取并反序列化持久化状态
///
/// 缺失、读取失败或反序列化失败都回退为 `T::default()`，
/// 损坏的数据只产生一条告警日志。
pub async fn load_state<T>(store: &dyn DurableStore, namespace: &str) -> T
where
    T: DeserializeOwned + Default,
{
    let raw = match store.get(namespace).await {
        Ok(Some(value)) => value,
        Ok(None) => return T::default(),
        Err(err) => {
            warn!(namespace, error = %err, "durable store read failed, starting empty");
            return T::default();
        }
    };
    match serde_json::from_value(raw) {
        Ok(state) => state,
        Err(err) => {
            warn!(namespace, error = %err, "corrupt persisted state discarded");
            T::default()
        }
    }
}

/// 序列化并写入持久化状态
///
/// 写入失败只记录日志：会话内的内存状态仍然是权威状态。
pub async fn save_state<T>(store: &dyn DurableStore, namespace: &str, state: &T) -> bool
where
    T: Serialize,
{
    let value = match serde_json::to_value(state) {
        Ok(value) => value,
        Err(err) => {
            warn!(namespace, error = %err, "failed to serialize state for persistence");
            return false;
        }
    };
    if let Err(err) = store.set(namespace, value).await {
        warn!(namespace, error = %err, "durable store write failed, keeping in-memory state");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Sample {
        count: u32,
    }

    #[tokio::test]
    async fn test_load_state_tolerates_corrupt_value() {
        let store = InMemoryStore::new();
        store
            .set("sample:u-1", json!({"count": "not-a-number"}))
            .await
            .unwrap();

        let loaded: Sample = load_state(&store, "sample:u-1").await;
        assert_eq!(loaded, Sample::default());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let store = InMemoryStore::new();
        assert!(save_state(&store, "sample:u-1", &Sample { count: 3 }).await);
        let loaded: Sample = load_state(&store, "sample:u-1").await;
        assert_eq!(loaded.count, 3);
    }
}
