// 集成测试套件 - 端到端验证乐观更新与服务端事件的对账闭环
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use flare_client_core::{
    ChannelRouter, ConnectionLifecycle, ConnectionStatus, EventDispatcher, IdentityContext,
    Message, MessageFeed, MessageKind, NotificationCategory, NotificationCenter,
    NotificationDraft, NotificationPriority, PushEvent, RetryPolicy, StateEvent, SyncMetrics,
};
use flare_client_core::store::InMemoryStore;
use flare_client_core::transport::InMemoryTransport;

struct Harness {
    transport: Arc<InMemoryTransport>,
    store: Arc<InMemoryStore>,
    dispatcher: EventDispatcher,
    identity: IdentityContext,
    metrics: Arc<SyncMetrics>,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        Self {
            transport: Arc::new(InMemoryTransport::new()),
            store: Arc::new(InMemoryStore::new()),
            dispatcher: EventDispatcher::new(),
            identity: IdentityContext::new("u-1", "Alice"),
            metrics: Arc::new(SyncMetrics::unregistered()),
        }
    }

    async fn notification_center(&self) -> NotificationCenter {
        NotificationCenter::open(
            self.transport.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            self.identity.clone(),
            self.metrics.clone(),
            50,
        )
        .await
    }

    async fn message_feed(&self, channel_id: &str) -> MessageFeed {
        MessageFeed::open(
            channel_id,
            self.transport.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            self.identity.clone(),
            self.metrics.clone(),
        )
        .await
    }

    async fn lifecycle(&self) -> ConnectionLifecycle {
        ConnectionLifecycle::open(
            self.transport.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            self.identity.clone(),
            self.metrics.clone(),
        )
        .await
    }

    fn router(&self) -> ChannelRouter {
        ChannelRouter::new(
            self.transport.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            self.identity.clone(),
            self.metrics.clone(),
            RetryPolicy::default(),
            100,
        )
    }
}

async fn wait_until<F>(predicate: impl Fn() -> F)
where
    F: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if predicate().await {
                return;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("state did not converge in time");
}

#[tokio::test]
async fn test_mark_all_read_clears_badge() -> Result<()> {
    let harness = Harness::new();
    let center = harness.notification_center().await;

    let n1 = center
        .add(NotificationDraft {
            category: NotificationCategory::System,
            priority: NotificationPriority::Normal,
            title: "n1".to_string(),
            body: "".to_string(),
            actions: vec![],
        })
        .await?;
    assert_eq!(center.unread_count().await, 1);

    center.mark_all_read().await;
    assert_eq!(center.unread_count().await, 0);
    let snapshot = center.snapshot().await;
    assert!(snapshot.iter().find(|n| n.id == n1.id).unwrap().read);
    Ok(())
}

#[tokio::test]
async fn test_send_flow_confirms_without_duplicates() -> Result<()> {
    let harness = Harness::new();
    harness
        .transport
        .enqueue_ok("sendMessage", json!({"id": "srv1"}));
    let feed = harness.message_feed("chan-1").await;

    let pending = feed.send("hello", MessageKind::Text).await?;
    assert!(pending.state.is_pending());
    assert_eq!(feed.snapshot().await.len(), 1);

    wait_until(|| async {
        let snapshot = feed.snapshot().await;
        snapshot.len() == 1 && snapshot[0].id == "srv1" && snapshot[0].state.is_confirmed()
    })
    .await;

    // 推送回声不产生第二条
    feed.handle_push(PushEvent {
        topic: "channel:chan-1".to_string(),
        kind: "message.new".to_string(),
        payload: json!({
            "id": "srv1",
            "client_temp_id": pending.client_temp_id,
            "channel_id": "chan-1",
            "author_id": "u-1",
            "content": "hello",
            "kind": "text",
            "created_at": pending.created_at,
        }),
    })
    .await?;
    assert_eq!(feed.snapshot().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_send_retries_with_same_lineage() -> Result<()> {
    let harness = Harness::new();
    harness
        .transport
        .enqueue_err("sendMessage", flare_client_core::ClientCoreError::transport("down"));
    harness
        .transport
        .enqueue_ok("sendMessage", json!({"id": "srv1"}));
    let feed = harness.message_feed("chan-1").await;

    let pending = feed.send("hi", MessageKind::Text).await?;
    wait_until(|| async { feed.snapshot().await[0].state.can_retry() }).await;

    feed.retry(&pending.id).await?;
    wait_until(|| async {
        let snapshot = feed.snapshot().await;
        snapshot.len() == 1 && snapshot[0].state.is_confirmed()
    })
    .await;
    Ok(())
}

#[tokio::test]
async fn test_observers_see_pending_before_confirmed() -> Result<()> {
    let harness = Harness::new();
    harness
        .transport
        .enqueue_ok("sendMessage", json!({"id": "srv1"}));
    let feed = harness.message_feed("chan-1").await;
    let mut events = harness.dispatcher.subscribe();

    feed.send("hello", MessageKind::Text).await?;
    wait_until(|| async { feed.snapshot().await[0].state.is_confirmed() }).await;

    // 观察方先看到 PENDING 快照，再看到 CONFIRMED 快照
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let StateEvent::MessagesChanged { snapshot, .. } = event {
            if let Some(message) = snapshot.first() {
                states.push(message.state);
            }
        }
    }
    assert!(states.first().unwrap().is_pending());
    assert!(states.last().unwrap().is_confirmed());
    Ok(())
}

#[tokio::test]
async fn test_declined_request_survives_stale_accept() -> Result<()> {
    let harness = Harness::new();
    let lifecycle = harness.lifecycle().await;

    lifecycle
        .handle_push(PushEvent {
            topic: "user-connections:u-1".to_string(),
            kind: "connection.requested".to_string(),
            payload: json!({
                "id": "r1",
                "from_id": "u-2",
                "to_id": "u-1",
                "message": "hi",
                "created_at": chrono::Utc::now(),
                "status": "pending",
            }),
        })
        .await?;

    lifecycle.decline("r1").await?;

    // 过期的重复 accept 事件
    lifecycle
        .handle_push(PushEvent {
            topic: "user-connections:u-1".to_string(),
            kind: "connection.updated".to_string(),
            payload: json!({
                "id": "r1",
                "from_id": "u-2",
                "to_id": "u-1",
                "message": "hi",
                "created_at": chrono::Utc::now(),
                "status": "accepted",
            }),
        })
        .await?;

    assert_eq!(
        lifecycle.snapshot().await[0].status,
        ConnectionStatus::Declined
    );
    Ok(())
}

#[tokio::test]
async fn test_accepting_request_opens_feed_via_side_effect() -> Result<()> {
    let harness = Harness::new();
    let mut events = harness.dispatcher.subscribe();
    let lifecycle = harness.lifecycle().await;

    lifecycle
        .handle_push(PushEvent {
            topic: "user-connections:u-1".to_string(),
            kind: "connection.requested".to_string(),
            payload: json!({
                "id": "r1",
                "from_id": "u-2",
                "to_id": "u-1",
                "message": "hi",
                "created_at": chrono::Utc::now(),
                "status": "pending",
            }),
        })
        .await?;
    lifecycle.accept("r1").await?;

    // 连接建立副作用驱动其他子系统（此处模拟打开新频道）
    let mut peer = None;
    while let Ok(event) = events.try_recv() {
        if let StateEvent::ConnectionEstablished { connection } = event {
            peer = Some(connection.peer_id);
        }
    }
    let peer = peer.expect("connection established event must fire");
    assert_eq!(peer, "u-2");

    let router = harness.router();
    let feed = router.open(&format!("dm:{peer}")).await;
    assert!(feed.snapshot().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_state_survives_restart_within_store() -> Result<()> {
    let harness = Harness::new();
    {
        let feed = harness.message_feed("chan-1").await;
        feed.handle_push(PushEvent {
            topic: "channel:chan-1".to_string(),
            kind: "message.new".to_string(),
            payload: json!({
                "id": "srv-1",
                "channel_id": "chan-1",
                "author_id": "u-2",
                "content": "hello",
                "kind": "text",
                "created_at": chrono::Utc::now(),
            }),
        })
        .await?;
        feed.handle_push(PushEvent {
            topic: "channel:chan-1".to_string(),
            kind: "message.deleted".to_string(),
            payload: json!({"id": "srv-1"}),
        })
        .await?;
    }

    // 同一存储上重开：删除终态必须跨会话保持
    let reopened = harness.message_feed("chan-1").await;
    assert!(reopened.snapshot().await.is_empty());
    reopened
        .handle_push(PushEvent {
            topic: "channel:chan-1".to_string(),
            kind: "message.new".to_string(),
            payload: json!({
                "id": "srv-1",
                "channel_id": "chan-1",
                "author_id": "u-2",
                "content": "hello",
                "kind": "text",
                "created_at": chrono::Utc::now(),
            }),
        })
        .await?;
    assert!(reopened.snapshot().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_snapshot_is_isolated_copy() -> Result<()> {
    let harness = Harness::new();
    let feed = harness.message_feed("chan-1").await;
    feed.handle_push(PushEvent {
        topic: "channel:chan-1".to_string(),
        kind: "message.new".to_string(),
        payload: json!({
            "id": "srv-1",
            "channel_id": "chan-1",
            "author_id": "u-2",
            "content": "hello",
            "kind": "text",
            "created_at": chrono::Utc::now(),
        }),
    })
    .await?;

    let mut snapshot: Vec<Message> = feed.snapshot().await;
    snapshot[0].content = "tampered".to_string();
    // 修改快照不影响核心状态
    assert_eq!(feed.snapshot().await[0].content, "hello");
    Ok(())
}
