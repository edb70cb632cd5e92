//! 频道消息序列
//!
//! 每个频道一个实例。发送走"乐观入列 -> 后台确认"的两段式：
//! RPC 在独立任务中完成，不随调用方取消；离开频道后发送仍会
//! 收敛为确认或失败，下次打开频道即可见。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::error::{ClientCoreError, Result};
use crate::events::{EventDispatcher, StateEvent};
use crate::identity::IdentityContext;
use crate::metrics::SyncMetrics;
use crate::reconcile::{EngineState, ReconciliationEngine, RemoteEvent, RemoteOutcome};
use crate::store::{self, DurableStore};
use crate::transport::{PushEvent, PushHandler, Transport};

use super::model::{Message, MessageKind, MessageState};

struct FeedInner {
    channel_id: String,
    engine: RwLock<ReconciliationEngine<Message>>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    dispatcher: EventDispatcher,
    identity: IdentityContext,
    metrics: Arc<SyncMetrics>,
    namespace: String,
}

/// 频道消息序列
#[derive(Clone)]
pub struct MessageFeed {
    inner: Arc<FeedInner>,
}

impl MessageFeed {
    /// 打开频道并从持久化存储恢复消息序列
    pub async fn open(
        channel_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
        dispatcher: EventDispatcher,
        identity: IdentityContext,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let channel_id = channel_id.into();
        let namespace = identity.scoped_namespace(&format!("messages:{channel_id}"));
        let state: EngineState<Message> = store::load_state(store.as_ref(), &namespace).await;
        let engine = ReconciliationEngine::from_state(state, None);
        Self {
            inner: Arc::new(FeedInner {
                channel_id,
                engine: RwLock::new(engine),
                transport,
                store,
                dispatcher,
                identity,
                metrics,
                namespace,
            }),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.channel_id
    }

    /// 本频道的推送主题
    pub fn topic(&self) -> String {
        format!("channel:{}", self.inner.channel_id)
    }

    /// 乐观发送：立即返回 PENDING 消息，确认在后台完成
    #[instrument(skip(self, content), fields(channel_id = %self.inner.channel_id))]
    pub async fn send(&self, content: impl Into<String>, kind: MessageKind) -> Result<Message> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ClientCoreError::Validation(
                "message content must not be empty".to_string(),
            ));
        }

        let pending = Message::outgoing(
            &self.inner.channel_id,
            self.inner.identity.current_actor_id(),
            content,
            kind,
        );
        {
            let mut engine = self.inner.engine.write().await;
            engine.apply_local(pending.clone());
        }
        self.commit().await;

        // RPC 在独立任务中收敛，不随调用方导航/取消而中断
        let feed = self.clone();
        let in_flight = pending.clone();
        tokio::spawn(async move {
            feed.resolve_send(in_flight).await;
        });

        Ok(pending)
    }

    /// 重试一条失败消息：沿用原谱系，绝不产生第二个条目
    pub async fn retry(&self, id: &str) -> Result<Option<Message>> {
        let retrying = {
            let mut engine = self.inner.engine.write().await;
            let Some(current) = engine.get(id).cloned() else {
                return Ok(None);
            };
            if !current.state.can_retry() {
                // 非失败态重试是幂等空操作，返回当前状态
                debug!(id, state = %current.state, "retry on non-failed message ignored");
                return Ok(Some(current));
            }
            engine.update(id, |m| {
                m.state = MessageState::Pending;
                m.error = None;
            })
        };
        let Some(retrying) = retrying else {
            return Ok(None);
        };
        self.inner.metrics.send_retries.inc();
        self.commit().await;

        let feed = self.clone();
        let in_flight = retrying.clone();
        tokio::spawn(async move {
            feed.resolve_send(in_flight).await;
        });
        Ok(Some(retrying))
    }

    async fn resolve_send(&self, pending: Message) {
        let payload = json!({
            "channel_id": pending.channel_id,
            "client_temp_id": pending.client_temp_id,
            "author_id": pending.author_id,
            "content": pending.content,
            "kind": pending.kind,
            "created_at": pending.created_at,
        });
        match self.inner.transport.request("sendMessage", payload).await {
            Ok(data) => {
                let Some(server_id) = data.get("id").and_then(|v| v.as_str()) else {
                    warn!(temp_id = %pending.id, "send ack carried no server id");
                    self.fail_send(&pending.id, "malformed ack").await;
                    return;
                };
                let server_created_at = data
                    .get("created_at")
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                let confirmed = pending.confirmed_as(server_id, server_created_at);
                let outcome = {
                    let mut engine = self.inner.engine.write().await;
                    engine.apply_remote(RemoteEvent::Upsert {
                        entity: confirmed,
                        lineage: pending.client_temp_id.clone(),
                    })
                };
                match outcome {
                    RemoteOutcome::Replaced => self.inner.metrics.sends_confirmed.inc(),
                    RemoteOutcome::DuplicateDropped => {
                        // 推送回声先于 ack 完成了换领
                        self.inner.metrics.duplicates_dropped.inc()
                    }
                    _ => {}
                }
                self.commit().await;
            }
            Err(err) => {
                warn!(temp_id = %pending.id, error = %err, "send failed");
                self.fail_send(&pending.id, &err.to_string()).await;
            }
        }
    }

    async fn fail_send(&self, temp_id: &str, reason: &str) {
        {
            let mut engine = self.inner.engine.write().await;
            engine.reconcile_failure(temp_id, reason);
        }
        self.inner.metrics.sends_failed.inc();
        self.commit().await;
    }

    /// 拉取频道最近一页历史消息并合并；拉取失败不做任何局部应用
    #[instrument(skip(self), fields(channel_id = %self.inner.channel_id))]
    pub async fn fetch_history(&self, limit: usize) -> Result<usize> {
        let payload = json!({
            "channel_id": self.inner.channel_id,
            "limit": limit,
        });
        let data = self.inner.transport.request("fetchMessages", payload).await?;
        let messages: Vec<Message> = match data.get("messages") {
            Some(list) => serde_json::from_value(list.clone())?,
            None => Vec::new(),
        };

        let fetched = messages.len();
        let actor = self.inner.identity.current_actor_id().to_string();
        {
            let mut engine = self.inner.engine.write().await;
            for message in messages {
                let lineage = if message.author_id == actor {
                    message.client_temp_id.clone()
                } else {
                    None
                };
                let outcome = engine.apply_remote(RemoteEvent::Upsert {
                    entity: message,
                    lineage,
                });
                self.count_outcome(outcome);
            }
        }
        self.commit().await;
        Ok(fetched)
    }

    /// 应用一条推送事件
    pub async fn handle_push(&self, event: PushEvent) -> Result<()> {
        self.inner
            .metrics
            .push_events
            .with_label_values(&[event.kind.as_str()])
            .inc();

        let remote = match event.kind.as_str() {
            "message.new" | "message.updated" => {
                let message: Message = serde_json::from_value(event.payload)?;
                // 自己发出的消息经推送回流：按谱系判重后丢弃回声
                let lineage = if message.author_id == self.inner.identity.current_actor_id() {
                    message.client_temp_id.clone()
                } else {
                    None
                };
                RemoteEvent::Upsert {
                    entity: message,
                    lineage,
                }
            }
            "message.deleted" => {
                let id = event
                    .payload
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ClientCoreError::Validation("delete event without id".to_string())
                    })?;
                RemoteEvent::Delete { id: id.to_string() }
            }
            other => {
                debug!(kind = other, "unknown message push kind ignored");
                return Ok(());
            }
        };

        {
            let mut engine = self.inner.engine.write().await;
            let outcome = engine.apply_remote(remote);
            self.count_outcome(outcome);
        }
        self.commit().await;
        Ok(())
    }

    fn count_outcome(&self, outcome: RemoteOutcome) {
        let metrics = &self.inner.metrics;
        match outcome {
            RemoteOutcome::Inserted => metrics.remote_inserted.inc(),
            RemoteOutcome::Merged => metrics.remote_merged.inc(),
            RemoteOutcome::Replaced => metrics.lineage_replaced.inc(),
            RemoteOutcome::DuplicateDropped => metrics.duplicates_dropped.inc(),
            RemoteOutcome::TombstoneDropped => metrics.tombstone_dropped.inc(),
            RemoteOutcome::Removed | RemoteOutcome::Missed => {}
        }
    }

    /// 当前快照（按 `(created_at, id)` 排序的独立副本）
    pub async fn snapshot(&self) -> Vec<Message> {
        self.inner.engine.read().await.snapshot()
    }

    async fn commit(&self) {
        let (state, snapshot) = {
            let engine = self.inner.engine.read().await;
            (engine.export_state(), engine.snapshot())
        };
        if !store::save_state(self.inner.store.as_ref(), &self.inner.namespace, &state).await {
            self.inner.metrics.persistence_errors.inc();
        }
        self.inner.dispatcher.emit(StateEvent::MessagesChanged {
            channel_id: self.inner.channel_id.clone(),
            snapshot,
        });
    }
}

#[async_trait]
impl PushHandler for MessageFeed {
    async fn handle(&self, event: PushEvent) -> Result<()> {
        self.handle_push(event).await
    }
}
