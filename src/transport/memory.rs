//! 内存传输实现
//!
//! 可编程的传输替身：按操作名排队应答、记录已发请求、主动注入推送
//! 事件。未脚本化的操作按约定自动应答（为发送类操作铸造服务端 ID），
//! 使宿主测试与集成测试可以精确驱动对账时序。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::error::{ClientCoreError, Result};

use super::{PushEvent, PushSubscription, Transport};

/// 记录的一次 RPC 请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub op: String,
    pub payload: Value,
}

/// 内存传输
#[derive(Default)]
pub struct InMemoryTransport {
    responses: DashMap<String, VecDeque<Result<Value>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<PushEvent>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某操作排队一个成功应答
    pub fn enqueue_ok(&self, op: &str, data: Value) {
        self.responses
            .entry(op.to_string())
            .or_default()
            .push_back(Ok(data));
    }

    /// 为某操作排队一个失败应答
    pub fn enqueue_err(&self, op: &str, err: ClientCoreError) {
        self.responses
            .entry(op.to_string())
            .or_default()
            .push_back(Err(err));
    }

    fn request_log(&self) -> std::sync::MutexGuard<'_, Vec<RecordedRequest>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 已发出的全部请求
    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        self.request_log().clone()
    }

    /// 某操作已发出的请求次数
    pub fn request_count(&self, op: &str) -> usize {
        self.request_log()
            .iter()
            .filter(|req| req.op == op)
            .count()
    }

    /// 向主题注入一个推送事件
    pub fn publish(&self, topic: &str, kind: &str, payload: Value) {
        if let Some(mut senders) = self.subscribers.get_mut(topic) {
            // 投递同时清理已退订（接收端已丢弃）的通道
            senders.retain(|tx| {
                tx.send(PushEvent {
                    topic: topic.to_string(),
                    kind: kind.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
    }

    /// 主题当前存活的订阅数
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .get_mut(topic)
            .map(|mut senders| {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            })
            .unwrap_or(0)
    }

    /// 等待主题出现至少一个订阅方（测试同步用）
    pub async fn wait_for_subscriber(&self, topic: &str) {
        while self.subscriber_count(topic) == 0 {
            tokio::task::yield_now().await;
        }
    }

    /// 未脚本化操作的自动应答
    fn auto_response(op: &str) -> Value {
        match op {
            "sendMessage" => json!({
                "id": Ulid::new().to_string(),
                "created_at": Utc::now(),
            }),
            "publishNotification" => json!({ "id": Ulid::new().to_string() }),
            "fetchNotifications" => json!({ "notifications": [] }),
            "fetchMessages" => json!({ "messages": [] }),
            "sendConnectionRequest" => json!({ "id": Ulid::new().to_string() }),
            "acceptConnectionRequest" => json!({ "status": "accepted" }),
            "declineConnectionRequest" => json!({ "status": "declined" }),
            "cancelConnectionRequest" => json!({ "status": "cancelled" }),
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request(&self, op: &str, payload: Value) -> Result<Value> {
        self.request_log().push(RecordedRequest {
            op: op.to_string(),
            payload,
        });

        if let Some(mut queue) = self.responses.get_mut(op) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        Ok(Self::auto_response(op))
    }

    async fn subscribe(&self, topic: &str) -> Result<PushSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(PushSubscription::new(topic, rx))
    }
}
