//! 状态变更事件分发模块
//!
//! 视图层与核心之间唯一的挂钩：核心在每次可观察状态变化后广播一份
//! 不可变快照，任意数量的订阅方（DOM 渲染、终端、测试）各自消费。
//! 慢订阅方允许丢帧，丢帧后重新读取最新快照即可。

use tokio::sync::broadcast;
use tracing::debug;

use crate::connection::{Connection, ConnectionRequest};
use crate::message::Message;
use crate::notification::Notification;

/// 默认广播缓冲容量
const DEFAULT_CAPACITY: usize = 64;

/// 状态变更事件（快照为独立副本，不引用核心内部结构）
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// 通知集合发生变化
    NotificationsChanged {
        snapshot: Vec<Notification>,
        unread: usize,
    },
    /// 某频道的消息序列发生变化
    MessagesChanged {
        channel_id: String,
        snapshot: Vec<Message>,
    },
    /// 连接请求集合发生变化
    ConnectionsChanged { snapshot: Vec<ConnectionRequest> },
    /// 连接建立副作用（接受请求时恰好触发一次）
    ConnectionEstablished { connection: Connection },
}

impl StateEvent {
    /// 事件主题名
    pub fn topic(&self) -> String {
        match self {
            StateEvent::NotificationsChanged { .. } => "notifications-changed".to_string(),
            StateEvent::MessagesChanged { channel_id, .. } => {
                format!("messages-changed:{channel_id}")
            }
            StateEvent::ConnectionsChanged { .. } => "connection-changed".to_string(),
            StateEvent::ConnectionEstablished { .. } => "connection-established".to_string(),
        }
    }
}

/// 状态事件分发器
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<StateEvent>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 订阅状态事件
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// 广播一次状态变更（无订阅方时静默丢弃）
    pub fn emit(&self, event: StateEvent) {
        debug!(topic = %event.topic(), "state event emitted");
        let _ = self.tx.send(event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
