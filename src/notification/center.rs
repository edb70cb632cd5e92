//! 通知中心
//!
//! 角标 = `count(read == false)`，每次变更后重新推导，从不独立记账。
//! 持久化失败只记日志，会话内内存状态保持权威。

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

use super::model::{
    Notification, NotificationAction, NotificationCategory, NotificationPriority,
};

/// 本地新建通知的输入
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub category: NotificationCategory,
    pub priority: NotificationPriority,
    pub title: String,
    pub body: String,
    pub actions: Vec<NotificationAction>,
}

struct CenterInner {
    engine: RwLock<ReconciliationEngine<Notification>>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    dispatcher: EventDispatcher,
    identity: IdentityContext,
    metrics: Arc<SyncMetrics>,
    namespace: String,
}

/// 通知中心
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<CenterInner>,
}

impl NotificationCenter {
    /// 打开通知中心并从持久化存储恢复上次会话的状态
    pub async fn open(
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
        dispatcher: EventDispatcher,
        identity: IdentityContext,
        metrics: Arc<SyncMetrics>,
        cap: usize,
    ) -> Self {
        let namespace = identity.scoped_namespace("notifications");
        let state: EngineState<Notification> = store::load_state(store.as_ref(), &namespace).await;
        let engine = ReconciliationEngine::from_state(state, Some(cap));
        Self {
            inner: Arc::new(CenterInner {
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

    /// 本中心的推送主题
    pub fn topic(&self) -> String {
        self.inner.identity.notification_topic()
    }

    /// 新建本地通知（默认持久化），立即可见，后台换取服务端 ID
    #[instrument(skip(self, draft), fields(category = %draft.category))]
    pub async fn add(&self, draft: NotificationDraft) -> Result<Notification> {
        self.add_with_options(draft, true).await
    }

    /// 新建本地通知，可选择跳过持久化
    pub async fn add_with_options(
        &self,
        draft: NotificationDraft,
        persist: bool,
    ) -> Result<Notification> {
        if draft.title.trim().is_empty() {
            return Err(ClientCoreError::Validation(
                "notification title must not be empty".to_string(),
            ));
        }

        let notification = Notification::local(
            draft.category,
            draft.priority,
            draft.title,
            draft.body,
            draft.actions,
        );
        {
            let mut engine = self.inner.engine.write().await;
            engine.apply_local(notification.clone());
            let evicted = engine.enforce_cap();
            if evicted > 0 {
                self.inner.metrics.evictions.inc_by(evicted as u64);
            }
        }
        // 乐观条目先于确认对观察方可见
        self.commit(persist).await;

        Ok(self.publish_local(notification, persist).await)
    }

    /// 换取服务端 ID；失败时本地条目保持权威
    async fn publish_local(&self, local: Notification, persist: bool) -> Notification {
        let payload = json!({
            "client_temp_id": local.id,
            "category": local.category,
            "priority": local.priority,
            "title": local.title,
            "body": local.body,
            "actions": local.actions,
            "created_at": local.created_at,
        });
        match self.inner.transport.request("publishNotification", payload).await {
            Ok(data) => {
                let Some(server_id) = data.get("id").and_then(|v| v.as_str()) else {
                    warn!(temp_id = %local.id, "publish ack carried no server id");
                    return local;
                };
                // 以确认时刻的本地条目为底稿，确认期间的已读迁移不丢失
                let current = {
                    let engine = self.inner.engine.read().await;
                    engine.get(&local.id).cloned().unwrap_or_else(|| local.clone())
                };
                let confirmed = current.confirmed_as(server_id);
                let outcome = {
                    let mut engine = self.inner.engine.write().await;
                    engine.apply_remote(RemoteEvent::Upsert {
                        entity: confirmed.clone(),
                        lineage: Some(local.id.clone()),
                    })
                };
                if outcome == RemoteOutcome::Replaced {
                    self.inner.metrics.lineage_replaced.inc();
                }
                self.commit(persist).await;
                confirmed
            }
            Err(err) => {
                warn!(temp_id = %local.id, error = %err, "notification publish failed, keeping local entry");
                let kept = {
                    let mut engine = self.inner.engine.write().await;
                    engine.reconcile_failure(&local.id, "publish failed")
                };
                kept.unwrap_or(local)
            }
        }
    }

    /// 标记已读（幂等）
    pub async fn mark_read(&self, id: &str) -> Option<Notification> {
        self.set_read(id, true).await
    }

    /// 标记未读（幂等）
    pub async fn mark_unread(&self, id: &str) -> Option<Notification> {
        self.set_read(id, false).await
    }

    /// 显式切换已读状态
    pub async fn toggle_read(&self, id: &str) -> Option<Notification> {
        let updated = {
            let mut engine = self.inner.engine.write().await;
            engine.update(id, |n| n.read = !n.read)
        };
        if updated.is_some() {
            self.commit(true).await;
        }
        updated
    }

    async fn set_read(&self, id: &str, read: bool) -> Option<Notification> {
        let (updated, changed) = {
            let mut engine = self.inner.engine.write().await;
            let before = engine.get(id).map(|n| n.read);
            let updated = engine.update(id, |n| n.read = read);
            (updated, before.map(|b| b != read).unwrap_or(false))
        };
        if changed {
            self.commit(true).await;
        }
        updated
    }

    /// 全部标为已读：单次批量迁移，观察方不会看到中间角标
    #[instrument(skip(self))]
    pub async fn mark_all_read(&self) -> usize {
        let transitioned = {
            let mut engine = self.inner.engine.write().await;
            let unread_ids: Vec<String> = engine
                .filtered_snapshot(|n| !n.read)
                .into_iter()
                .map(|n| n.id)
                .collect();
            for id in &unread_ids {
                engine.update(id, |n| n.read = true);
            }
            unread_ids.len()
        };
        if transitioned > 0 {
            self.commit(true).await;
        }
        transitioned
    }

    /// 删除指定通知（不存在时为空操作）
    pub async fn delete(&self, id: &str) -> Option<Notification> {
        let removed = {
            let mut engine = self.inner.engine.write().await;
            engine.remove(id)
        };
        if removed.is_some() {
            self.commit(true).await;
        }
        removed
    }

    /// 当前快照（按 `(created_at, id)` 排序的独立副本）
    pub async fn snapshot(&self) -> Vec<Notification> {
        self.inner.engine.read().await.snapshot()
    }

    /// 纯投影过滤，不修改状态
    pub async fn filter<P>(&self, predicate: P) -> Vec<Notification>
    where
        P: Fn(&Notification) -> bool,
    {
        self.inner.engine.read().await.filtered_snapshot(predicate)
    }

    /// 未读角标（每次重新推导）
    pub async fn unread_count(&self) -> usize {
        self.inner
            .engine
            .read()
            .await
            .filtered_snapshot(|n| !n.read)
            .len()
    }

    /// 从服务端拉取通知全量并合并；拉取失败不做任何局部应用
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize> {
        let payload = json!({ "user_id": self.inner.identity.current_actor_id() });
        let data = self
            .inner
            .transport
            .request("fetchNotifications", payload)
            .await?;
        let notifications: Vec<Notification> = match data.get("notifications") {
            Some(list) => serde_json::from_value(list.clone())?,
            None => Vec::new(),
        };

        let merged = notifications.len();
        {
            let mut engine = self.inner.engine.write().await;
            for notification in notifications {
                let outcome = engine.apply_remote(RemoteEvent::Upsert {
                    entity: notification,
                    lineage: None,
                });
                self.count_outcome(outcome);
            }
            let evicted = engine.enforce_cap();
            if evicted > 0 {
                self.inner.metrics.evictions.inc_by(evicted as u64);
            }
        }
        self.commit(true).await;
        Ok(merged)
    }

    /// 应用一条推送事件
    pub async fn handle_push(&self, event: PushEvent) -> Result<()> {
        self.inner
            .metrics
            .push_events
            .with_label_values(&[event.kind.as_str()])
            .inc();

        let remote = match event.kind.as_str() {
            "notification.new" | "notification.updated" => {
                // 自己发布的通知经推送回流时带谱系标识，交给引擎去重
                let lineage = event
                    .payload
                    .get("client_temp_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let notification: Notification = serde_json::from_value(event.payload)?;
                RemoteEvent::Upsert {
                    entity: notification,
                    lineage,
                }
            }
            "notification.deleted" => {
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
                debug!(kind = other, "unknown notification push kind ignored");
                return Ok(());
            }
        };

        {
            let mut engine = self.inner.engine.write().await;
            let outcome = engine.apply_remote(remote);
            self.count_outcome(outcome);
            let evicted = engine.enforce_cap();
            if evicted > 0 {
                self.inner.metrics.evictions.inc_by(evicted as u64);
            }
        }
        self.commit(true).await;
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

    /// 持久化并广播当前快照
    async fn commit(&self, persist: bool) {
        let (state, snapshot) = {
            let engine = self.inner.engine.read().await;
            (engine.export_state(), engine.snapshot())
        };
        let unread = snapshot.iter().filter(|n| !n.read).count();
        if persist
            && !store::save_state(self.inner.store.as_ref(), &self.inner.namespace, &state).await
        {
            self.inner.metrics.persistence_errors.inc();
        }
        self.inner.dispatcher.emit(StateEvent::NotificationsChanged {
            snapshot,
            unread,
        });
    }
}

#[async_trait]
impl PushHandler for NotificationCenter {
    async fn handle(&self, event: PushEvent) -> Result<()> {
        self.handle_push(event).await
    }
}
