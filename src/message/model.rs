//! 消息领域模型
//!
//! 消息状态机管理一条消息从乐观发送到权威确认的生命周期：
//! - PENDING: 已本地可见，等待服务端确认
//! - CONFIRMED: 服务端已确认（ID 已换为服务端 ID）
//! - FAILED: 发送失败，保留在序列中等待重试或丢弃

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::reconcile::Reconcilable;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// 文本消息
    Text,
    /// 文件消息
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
        }
    }
}

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    /// 等待服务端确认
    Pending,
    /// 服务端已确认
    Confirmed,
    /// 发送失败（可重试）
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Pending => "PENDING",
            MessageState::Confirmed => "CONFIRMED",
            MessageState::Failed => "FAILED",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageState::Pending)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MessageState::Confirmed)
    }

    /// 是否可以发起重试
    pub fn can_retry(&self) -> bool {
        matches!(self, MessageState::Failed)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_state() -> MessageState {
    // 推送进来的远端消息天然是已确认消息
    MessageState::Confirmed
}

/// 消息实体
///
/// 频道内对外序列严格按 `(created_at, id)` 排序，与网络到达顺序无关；
/// 同一 `client_temp_id` 谱系对账后至多一条确认消息。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 消息 ID（确认前为客户端临时 ID）
    pub id: String,
    /// 客户端临时 ID 谱系（本端发出的消息携带）
    #[serde(default)]
    pub client_temp_id: Option<String>,
    /// 频道 ID
    pub channel_id: String,
    /// 发送者 ID
    pub author_id: String,
    /// 消息内容
    pub content: String,
    /// 消息类型
    pub kind: MessageKind,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 状态
    #[serde(default = "default_state")]
    pub state: MessageState,
    /// 失败原因（state == FAILED 时有值）
    #[serde(default)]
    pub error: Option<String>,
}

impl Message {
    /// 构造一条本端乐观发送的消息（authored "now"）
    pub fn outgoing(
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        let temp_id = format!("msg-tmp-{}", Uuid::new_v4());
        Self {
            id: temp_id.clone(),
            client_temp_id: Some(temp_id),
            channel_id: channel_id.into(),
            author_id: author_id.into(),
            content: content.into(),
            kind,
            created_at: Utc::now(),
            state: MessageState::Pending,
            error: None,
        }
    }

    /// 换上服务端 ID 的确认副本
    pub fn confirmed_as(
        &self,
        server_id: impl Into<String>,
        server_created_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut confirmed = self.clone();
        confirmed.id = server_id.into();
        confirmed.state = MessageState::Confirmed;
        confirmed.error = None;
        if let Some(created_at) = server_created_at {
            confirmed.created_at = created_at;
        }
        confirmed
    }
}

impl Reconcilable for Message {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn is_evictable(&self) -> bool {
        self.state.is_confirmed()
    }

    fn merge_remote(&mut self, incoming: Self) {
        let lineage = self.client_temp_id.take().or(incoming.client_temp_id.clone());
        *self = incoming;
        self.client_temp_id = lineage;
    }

    fn mark_failed(&mut self, reason: &str) {
        self.state = MessageState::Failed;
        self.error = Some(reason.to_string());
    }
}
