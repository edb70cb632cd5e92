//! 通知领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::reconcile::Reconcilable;

/// 通知分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    /// 系统通知
    System,
    /// 活动通知
    Events,
    /// 资源通知
    Resources,
    /// 消息通知
    Messages,
    /// 连接通知
    Connections,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::System => "system",
            NotificationCategory::Events => "events",
            NotificationCategory::Resources => "resources",
            NotificationCategory::Messages => "messages",
            NotificationCategory::Connections => "connections",
        }
    }
}

impl fmt::Display for NotificationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 通知优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    /// 普通
    Normal,
    /// 高
    High,
    /// 紧急
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Normal => "normal",
            NotificationPriority::High => "high",
            NotificationPriority::Urgent => "urgent",
        }
    }
}

/// 通知动作（有序列表，渲染为按钮等交互入口）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    /// 展示文案
    pub label: String,
    /// 动作标识
    pub action_id: String,
    /// 动作负载
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// 通知实体
///
/// 同一逻辑 ID 恰好一条；`read` 只在显式切换之外做 false -> true 迁移；
/// 全局未读数永远等于 `read == false` 的条数（推导，不单独记账）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// 通知 ID（乐观创建时为客户端临时 ID，确认后换为服务端 ID）
    pub id: String,
    /// 分类
    pub category: NotificationCategory,
    /// 优先级
    pub priority: NotificationPriority,
    /// 标题
    pub title: String,
    /// 正文
    pub body: String,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 已读标记
    #[serde(default)]
    pub read: bool,
    /// 动作列表
    #[serde(default)]
    pub actions: Vec<NotificationAction>,
    /// 是否仍在等待服务端确认（在途乐观条目不参与淘汰）
    #[serde(default)]
    pub pending: bool,
}

impl Notification {
    /// 构造一条本地乐观通知（客户端临时 ID）
    pub fn local(
        category: NotificationCategory,
        priority: NotificationPriority,
        title: impl Into<String>,
        body: impl Into<String>,
        actions: Vec<NotificationAction>,
    ) -> Self {
        Self {
            id: format!("ntf-tmp-{}", Uuid::new_v4()),
            category,
            priority,
            title: title.into(),
            body: body.into(),
            created_at: Utc::now(),
            read: false,
            actions,
            pending: true,
        }
    }

    /// 换上服务端 ID 的确认副本
    pub fn confirmed_as(&self, server_id: impl Into<String>) -> Self {
        let mut confirmed = self.clone();
        confirmed.id = server_id.into();
        confirmed.pending = false;
        confirmed
    }
}

impl Reconcilable for Notification {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_evictable(&self) -> bool {
        self.read && !self.pending
    }

    fn merge_remote(&mut self, incoming: Self) {
        // 服务端字段为准（含另一台设备显式切换的 read 状态）
        *self = incoming;
        self.pending = false;
    }

    fn mark_failed(&mut self, _reason: &str) {
        // 发布失败的通知保留为本地条目，不再占用"在途"保护
        self.pending = false;
    }
}
