//! 连接请求领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::reconcile::Reconcilable;

/// 连接请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// 等待对方处理
    Pending,
    /// 已接受（终态）
    Accepted,
    /// 已拒绝（终态）
    Declined,
    /// 已取消（终态，仅发起方可达）
    Cancelled,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Accepted => "accepted",
            ConnectionStatus::Declined => "declined",
            ConnectionStatus::Cancelled => "cancelled",
        }
    }

    /// 是否为终态（不可再变更）
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConnectionStatus::Pending)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 连接请求实体
///
/// 同一 (from_id, to_id) 对至多一条 pending 请求；终态一经达成不可回退。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// 请求 ID（确认前为客户端临时 ID）
    pub id: String,
    /// 客户端临时 ID 谱系（本端发起的请求携带）
    #[serde(default)]
    pub client_temp_id: Option<String>,
    /// 发起方
    pub from_id: String,
    /// 接收方
    pub to_id: String,
    /// 附言
    #[serde(default)]
    pub message: String,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 状态
    pub status: ConnectionStatus,
}

impl ConnectionRequest {
    /// 构造一条本端发起的乐观请求
    pub fn outgoing(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let temp_id = format!("req-tmp-{}", Uuid::new_v4());
        Self {
            id: temp_id.clone(),
            client_temp_id: Some(temp_id),
            from_id: from_id.into(),
            to_id: to_id.into(),
            message: message.into(),
            created_at: Utc::now(),
            status: ConnectionStatus::Pending,
        }
    }

    /// 换上服务端 ID 的确认副本
    pub fn confirmed_as(&self, server_id: impl Into<String>) -> Self {
        let mut confirmed = self.clone();
        confirmed.id = server_id.into();
        confirmed
    }

    /// 是否为发给当前用户的请求
    pub fn is_incoming_for(&self, actor_id: &str) -> bool {
        self.to_id == actor_id
    }

    /// 是否为当前用户发起的请求
    pub fn is_outgoing_for(&self, actor_id: &str) -> bool {
        self.from_id == actor_id
    }

    /// 相对当前用户的对端
    pub fn peer_of(&self, actor_id: &str) -> &str {
        if self.from_id == actor_id {
            &self.to_id
        } else {
            &self.from_id
        }
    }
}

impl Reconcilable for ConnectionRequest {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn merge_remote(&mut self, incoming: Self) {
        // 终态不可回退：先达成的终态吞掉过期的状态迁移
        if self.status.is_terminal() {
            return;
        }
        let lineage = self.client_temp_id.take().or(incoming.client_temp_id.clone());
        *self = incoming;
        self.client_temp_id = lineage;
    }

    fn mark_failed(&mut self, _reason: &str) {
        // 请求没有失败态：发送失败的请求保持 pending，等推送流纠正
    }
}

/// 连接记录（接受请求时的副作用产物）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// 对端用户 ID
    pub peer_id: String,
    /// 来源请求 ID
    pub request_id: String,
    /// 建立时间
    pub established_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_is_immutable_on_merge() {
        let mut request = ConnectionRequest::outgoing("u-2", "u-1", "hi");
        request.status = ConnectionStatus::Declined;

        let mut stale = request.clone();
        stale.status = ConnectionStatus::Accepted;
        request.merge_remote(stale);

        // 拒绝是终态，过期的接受事件不生效
        assert_eq!(request.status, ConnectionStatus::Declined);
    }

    #[test]
    fn test_pending_adopts_remote_transition() {
        let mut request = ConnectionRequest::outgoing("u-1", "u-2", "hi");
        let mut accepted = request.clone();
        accepted.status = ConnectionStatus::Accepted;

        request.merge_remote(accepted);
        assert_eq!(request.status, ConnectionStatus::Accepted);
    }

    #[test]
    fn test_peer_resolution() {
        let request = ConnectionRequest::outgoing("u-1", "u-2", "hi");
        assert_eq!(request.peer_of("u-1"), "u-2");
        assert_eq!(request.peer_of("u-2"), "u-1");
        assert!(request.is_outgoing_for("u-1"));
        assert!(request.is_incoming_for("u-2"));
    }
}
