//! 传输层抽象模块
//!
//! 核心对网络的全部假设收敛在两个原语上：RPC 请求与推送订阅。
//! 传输层被视为不可信通道：事件可能乱序、重复投递、中途断开，
//! 上层对账引擎负责把这些都收敛成一致状态。
//!
//! 约定：`request` 的 Ok 携带服务端应答的 data 部分；服务端以
//! "前置条件已失效"拒绝时映射为 [`ClientCoreError::Conflict`]，
//! 其余失败映射为 [`ClientCoreError::Transport`]。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

mod memory;
mod retry;

pub use memory::InMemoryTransport;
pub use retry::RetryPolicy;

/// 推送事件信封
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// 来源主题，如 `channel:<id>`、`user-notifications:<userId>`
    pub topic: String,
    /// 事件类型，如 `message.new`、`notification.updated`
    pub kind: String,
    /// JSON 负载
    pub payload: Value,
}

/// 推送订阅句柄
///
/// 丢弃句柄即退订：发送端在下一次投递时清理已关闭的接收方。
#[derive(Debug)]
pub struct PushSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<PushEvent>,
}

impl PushSubscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<PushEvent>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 等待下一个推送事件；通道关闭时返回 None
    pub async fn next(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }
}

/// 传输层统一接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 发起一次 RPC 请求
    async fn request(&self, op: &str, payload: Value) -> Result<Value>;

    /// 订阅一个推送主题
    async fn subscribe(&self, topic: &str) -> Result<PushSubscription>;
}

/// 推送事件处理方
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn handle(&self, event: PushEvent) -> Result<()>;
}

/// 订阅泵：把一个主题的推送事件持续喂给处理方
///
/// 通道断开后按退避策略静默重连，重连成功即清零退避计数；
/// 已渲染的历史状态保存在引擎里，不受断线影响。
pub struct SubscriptionPump {
    transport: Arc<dyn Transport>,
    topic: String,
    policy: RetryPolicy,
}

impl SubscriptionPump {
    pub fn new(transport: Arc<dyn Transport>, topic: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            topic: topic.into(),
            policy,
        }
    }

    /// 驱动订阅直到连续重连失败超过上限；调用方通过 abort 任务退订
    pub async fn run(self, handler: Arc<dyn PushHandler>) {
        let mut failed_attempts = 0u32;
        loop {
            match self.transport.subscribe(&self.topic).await {
                Ok(mut subscription) => {
                    failed_attempts = 0;
                    debug!(topic = %self.topic, "push subscription established");
                    while let Some(event) = subscription.next().await {
                        if let Err(err) = handler.handle(event).await {
                            warn!(topic = %self.topic, error = %err, "push event handling failed");
                        }
                    }
                    debug!(topic = %self.topic, "push channel closed, reconnecting");
                }
                Err(err) => {
                    failed_attempts += 1;
                    if failed_attempts >= self.policy.max_attempts {
                        warn!(
                            topic = %self.topic,
                            attempts = failed_attempts,
                            error = %err,
                            "resubscribe attempts exhausted"
                        );
                        return;
                    }
                    warn!(topic = %self.topic, error = %err, "resubscribe failed, backing off");
                }
            }
            tokio::time::sleep(self.policy.calculate_delay(failed_attempts)).await;
        }
    }
}
