//! 文件存储实现
//!
//! 每个命名空间对应根目录下的一个 JSON 文件。命名空间中文件系统
//! 不友好的字符统一替换为 `_`，避免路径逃逸。

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::{ClientCoreError, Result};

use super::DurableStore;

/// 基于本地文件的键值存储
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// 打开（必要时创建）根目录
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        let sanitized: String = namespace
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{sanitized}.json"))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, namespace: &str) -> Result<Option<Value>> {
        let path = self.path_for(namespace);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                // 损坏的文件当作空值处理，不让读错误阻塞会话
                warn!(namespace, path = %path.display(), error = %err, "corrupt store file ignored");
                Ok(None)
            }
        }
    }

    async fn set(&self, namespace: &str, value: Value) -> Result<()> {
        let path = self.path_for(namespace);
        let raw = serde_json::to_string(&value)?;
        // 先写临时文件再改名，避免写一半的文件被下次启动读到
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw.as_bytes())?;
        fs::rename(&tmp, &path).map_err(|err| {
            ClientCoreError::Persistence(format!(
                "failed to replace {}: {}",
                path.display(),
                err
            ))
        })
    }

    async fn remove(&self, namespace: &str) -> Result<()> {
        let path = self.path_for(namespace);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("messages:chan-1", json!(["a", "b"])).await.unwrap();
        assert_eq!(
            store.get("messages:chan-1").await.unwrap(),
            Some(json!(["a", "b"]))
        );

        store.remove("messages:chan-1").await.unwrap();
        assert!(store.get("messages:chan-1").await.unwrap().is_none());
        // 重复删除幂等
        store.remove("messages:chan-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        assert!(store.get("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespace_sanitization_keeps_files_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("../escape:u/1", json!(1)).await.unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
