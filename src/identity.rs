//! 当前用户身份上下文
//!
//! 只读句柄，由外部认证层在构造时注入。核心用它判断"自己的回声消息"，
//! 并为持久化命名空间做按用户隔离。

use serde::{Deserialize, Serialize};

/// 当前用户身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    /// 用户ID（全局唯一）
    actor_id: String,
    /// 展示名称
    display_name: String,
}

impl IdentityContext {
    pub fn new(actor_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            display_name: display_name.into(),
        }
    }

    /// 当前用户ID
    pub fn current_actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// 按用户隔离的持久化命名空间，如 `notifications:u-1`
    pub fn scoped_namespace(&self, kind: &str) -> String {
        format!("{}:{}", kind, self.actor_id)
    }

    /// 用户通知推送主题，如 `user-notifications:u-1`
    pub fn notification_topic(&self) -> String {
        format!("user-notifications:{}", self.actor_id)
    }
}
