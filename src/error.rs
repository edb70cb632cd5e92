//! 统一异常处理模块
//!
//! 客户端核心的错误分类：传输错误（可重试）、冲突（服务端前置条件失效，
//! 按幂等空操作处理）、持久化错误（降级为会话内存态）、校验错误
//! （在乐观应用之前拒绝，不会到达传输层）。

use thiserror::Error;

/// 客户端核心错误类型
#[derive(Debug, Error)]
pub enum ClientCoreError {
    /// 传输错误（网络/超时）
    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// 是否可重试
        retryable: bool,
    },

    /// 冲突错误（服务端拒绝了前置条件已失效的操作）
    #[error("conflict: {0}")]
    Conflict(String),

    /// 持久化错误（存储读写失败）
    #[error("persistence error: {0}")]
    Persistence(String),

    /// 校验错误（本地输入不合法）
    #[error("validation error: {0}")]
    Validation(String),
}

impl ClientCoreError {
    /// 构造可重试的传输错误
    pub fn transport(message: impl Into<String>) -> Self {
        ClientCoreError::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// 构造不可重试的传输错误
    pub fn transport_permanent(message: impl Into<String>) -> Self {
        ClientCoreError::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// 是否可以通过重试恢复
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientCoreError::Transport { retryable: true, .. })
    }

    /// 是否为冲突错误
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientCoreError::Conflict(_))
    }
}

impl From<serde_json::Error> for ClientCoreError {
    fn from(err: serde_json::Error) -> Self {
        ClientCoreError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for ClientCoreError {
    fn from(err: std::io::Error) -> Self {
        ClientCoreError::Persistence(err.to_string())
    }
}

/// 客户端核心统一 Result 类型
pub type Result<T> = std::result::Result<T, ClientCoreError>;
