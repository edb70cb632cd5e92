//! 连接请求生命周期
//!
//! accept/decline/cancel 都是幂等操作：作用在非 pending 请求上时
//! 返回当前状态而不是报错。服务端以冲突拒绝（对方已先处理）同样
//! 收敛为幂等空操作，权威纠正随推送流到达。

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

use super::model::{Connection, ConnectionRequest, ConnectionStatus};

struct LifecycleInner {
    engine: RwLock<ReconciliationEngine<ConnectionRequest>>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    dispatcher: EventDispatcher,
    identity: IdentityContext,
    metrics: Arc<SyncMetrics>,
    namespace: String,
}

/// 连接请求生命周期
#[derive(Clone)]
pub struct ConnectionLifecycle {
    inner: Arc<LifecycleInner>,
}

impl ConnectionLifecycle {
    /// 打开并从持久化存储恢复请求集合
    pub async fn open(
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
        dispatcher: EventDispatcher,
        identity: IdentityContext,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let namespace = identity.scoped_namespace("connections");
        let state: EngineState<ConnectionRequest> =
            store::load_state(store.as_ref(), &namespace).await;
        let engine = ReconciliationEngine::from_state(state, None);
        Self {
            inner: Arc::new(LifecycleInner {
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

    /// 本用户的连接事件推送主题
    pub fn topic(&self) -> String {
        format!("user-connections:{}", self.inner.identity.current_actor_id())
    }

    /// 发起连接请求
    ///
    /// 同一 (from, to) 对已有 pending 请求时幂等返回既有请求。
    #[instrument(skip(self, message))]
    pub async fn send_request(
        &self,
        to_id: &str,
        message: impl Into<String>,
    ) -> Result<ConnectionRequest> {
        let actor = self.inner.identity.current_actor_id().to_string();
        if to_id.trim().is_empty() {
            return Err(ClientCoreError::Validation(
                "connection target must not be empty".to_string(),
            ));
        }
        if to_id == actor {
            return Err(ClientCoreError::Validation(
                "cannot send a connection request to yourself".to_string(),
            ));
        }

        let request = {
            let mut engine = self.inner.engine.write().await;
            let existing = engine
                .filtered_snapshot(|r| {
                    r.status == ConnectionStatus::Pending && r.from_id == actor && r.to_id == to_id
                })
                .into_iter()
                .next();
            if let Some(existing) = existing {
                debug!(to_id, request_id = %existing.id, "pending request already exists");
                return Ok(existing);
            }
            engine.apply_local(ConnectionRequest::outgoing(actor, to_id, message))
        };
        self.commit().await;

        let payload = json!({
            "client_temp_id": request.id,
            "to_id": request.to_id,
            "message": request.message,
            "created_at": request.created_at,
        });
        match self
            .inner
            .transport
            .request("sendConnectionRequest", payload)
            .await
        {
            Ok(data) => {
                let Some(server_id) = data.get("id").and_then(|v| v.as_str()) else {
                    warn!(temp_id = %request.id, "request ack carried no server id");
                    return Ok(request);
                };
                let confirmed = request.confirmed_as(server_id);
                {
                    let mut engine = self.inner.engine.write().await;
                    engine.apply_remote(RemoteEvent::Upsert {
                        entity: confirmed.clone(),
                        lineage: Some(request.id.clone()),
                    });
                }
                self.commit().await;
                Ok(confirmed)
            }
            Err(err) => {
                // 发送失败的请求保持本地 pending，推送流负责权威纠正
                warn!(temp_id = %request.id, error = %err, "connection request send failed");
                Ok(request)
            }
        }
    }

    /// 接受一条收到的请求（幂等）
    ///
    /// pending -> accepted 的迁移恰好触发一次"连接建立"副作用。
    pub async fn accept(&self, id: &str) -> Result<ConnectionRequest> {
        self.transition(
            id,
            ConnectionStatus::Accepted,
            "acceptConnectionRequest",
            TransitionSide::Incoming,
        )
        .await
    }

    /// 拒绝一条收到的请求（幂等）
    pub async fn decline(&self, id: &str) -> Result<ConnectionRequest> {
        self.transition(
            id,
            ConnectionStatus::Declined,
            "declineConnectionRequest",
            TransitionSide::Incoming,
        )
        .await
    }

    /// 取消一条自己发出的请求（幂等）
    pub async fn cancel(&self, id: &str) -> Result<ConnectionRequest> {
        self.transition(
            id,
            ConnectionStatus::Cancelled,
            "cancelConnectionRequest",
            TransitionSide::Outgoing,
        )
        .await
    }

    async fn transition(
        &self,
        id: &str,
        target: ConnectionStatus,
        op: &str,
        side: TransitionSide,
    ) -> Result<ConnectionRequest> {
        let actor = self.inner.identity.current_actor_id().to_string();
        let (request, transitioned) = {
            let mut engine = self.inner.engine.write().await;
            let Some(current) = engine.get(id).cloned() else {
                return Err(ClientCoreError::Validation(format!(
                    "unknown connection request: {id}"
                )));
            };
            match side {
                TransitionSide::Incoming if !current.is_incoming_for(&actor) => {
                    return Err(ClientCoreError::Validation(
                        "only the recipient may act on this request".to_string(),
                    ));
                }
                TransitionSide::Outgoing if !current.is_outgoing_for(&actor) => {
                    return Err(ClientCoreError::Validation(
                        "only the sender may cancel this request".to_string(),
                    ));
                }
                _ => {}
            }
            if current.status.is_terminal() {
                // 幂等：重复操作返回当前状态，不产生第二次副作用
                debug!(id, status = %current.status, "transition on settled request is a no-op");
                (current, false)
            } else {
                let updated = engine.update(id, |r| r.status = target);
                (updated.unwrap_or(current), true)
            }
        };
        if !transitioned {
            return Ok(request);
        }

        if target == ConnectionStatus::Accepted {
            self.emit_established(&request);
        }
        self.commit().await;

        match self.inner.transport.request(op, json!({ "id": id })).await {
            Ok(_) => {}
            Err(err) if err.is_conflict() => {
                // 对方已先处理：冲突收敛为空操作，权威状态随推送到达
                debug!(id, error = %err, "server rejected stale transition, treated as no-op");
            }
            Err(err) => {
                warn!(id, error = %err, "transition rpc failed, keeping optimistic state");
            }
        }
        Ok(request)
    }

    fn emit_established(&self, request: &ConnectionRequest) {
        let actor = self.inner.identity.current_actor_id();
        self.inner.dispatcher.emit(StateEvent::ConnectionEstablished {
            connection: Connection {
                peer_id: request.peer_of(actor).to_string(),
                request_id: request.id.clone(),
                established_at: chrono::Utc::now(),
            },
        });
    }

    /// 应用一条推送事件
    pub async fn handle_push(&self, event: PushEvent) -> Result<()> {
        self.inner
            .metrics
            .push_events
            .with_label_values(&[event.kind.as_str()])
            .inc();

        match event.kind.as_str() {
            "connection.requested" | "connection.updated" => {
                let incoming: ConnectionRequest = serde_json::from_value(event.payload)?;
                let actor = self.inner.identity.current_actor_id().to_string();
                let lineage = if incoming.from_id == actor {
                    incoming.client_temp_id.clone()
                } else {
                    None
                };

                let (outcome, established) = {
                    let mut engine = self.inner.engine.write().await;
                    // ack 未完成时本端条目还挂在临时 ID 下，迁移检测要看谱系两端
                    let before = engine
                        .get(&incoming.id)
                        .or_else(|| lineage.as_deref().and_then(|temp| engine.get(temp)))
                        .map(|r| r.status);
                    let incoming_id = incoming.id.clone();
                    let outcome = engine.apply_remote(RemoteEvent::Upsert {
                        entity: incoming,
                        lineage,
                    });
                    let after = engine.get(&incoming_id).cloned();
                    // 自己发出的请求被对方接受：pending -> accepted 触发副作用
                    let established = match (before, &after) {
                        (Some(ConnectionStatus::Pending), Some(request))
                            if request.status == ConnectionStatus::Accepted =>
                        {
                            Some(request.clone())
                        }
                        _ => None,
                    };
                    (outcome, established)
                };
                self.count_outcome(outcome);
                if let Some(request) = established {
                    self.emit_established(&request);
                }
                self.commit().await;
            }
            other => {
                debug!(kind = other, "unknown connection push kind ignored");
            }
        }
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
    pub async fn snapshot(&self) -> Vec<ConnectionRequest> {
        self.inner.engine.read().await.snapshot()
    }

    /// 等待当前用户处理的 pending 请求
    pub async fn pending_incoming(&self) -> Vec<ConnectionRequest> {
        let actor = self.inner.identity.current_actor_id().to_string();
        self.inner
            .engine
            .read()
            .await
            .filtered_snapshot(|r| r.status == ConnectionStatus::Pending && r.to_id == actor)
    }

    async fn commit(&self) {
        let (state, snapshot) = {
            let engine = self.inner.engine.read().await;
            (engine.export_state(), engine.snapshot())
        };
        if !store::save_state(self.inner.store.as_ref(), &self.inner.namespace, &state).await {
            self.inner.metrics.persistence_errors.inc();
        }
        self.inner
            .dispatcher
            .emit(StateEvent::ConnectionsChanged { snapshot });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionSide {
    /// 仅接收方可操作（accept/decline）
    Incoming,
    /// 仅发起方可操作（cancel）
    Outgoing,
}

#[async_trait]
impl PushHandler for ConnectionLifecycle {
    async fn handle(&self, event: PushEvent) -> Result<()> {
        self.handle_push(event).await
    }
}
