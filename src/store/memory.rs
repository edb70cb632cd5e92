//! 内存存储实现（测试与临时会话使用）

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::Result;

use super::DurableStore;

/// 内存键值存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: DashMap<String, Value>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前命名空间数量
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get(&self, namespace: &str) -> Result<Option<Value>> {
        Ok(self.inner.get(namespace).map(|entry| entry.value().clone()))
    }

    async fn set(&self, namespace: &str, value: Value) -> Result<()> {
        self.inner.insert(namespace.to_string(), value);
        Ok(())
    }

    async fn remove(&self, namespace: &str) -> Result<()> {
        self.inner.remove(namespace);
        Ok(())
    }
}
