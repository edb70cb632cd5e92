//! 频道路由
//!
//! 管理频道与订阅的交接：打开新频道前必须先退订上一个频道的主题，
//! 避免跨频道串流。频道序列实例被缓存，离开频道时在途的发送仍会
//! 在后台收敛，下次打开同一频道即可见结果。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::events::EventDispatcher;
use crate::identity::IdentityContext;
use crate::metrics::SyncMetrics;
use crate::store::DurableStore;
use crate::transport::{RetryPolicy, SubscriptionPump, Transport};

use super::feed::MessageFeed;

struct ActivePump {
    channel_id: String,
    handle: JoinHandle<()>,
}

/// 频道路由
pub struct ChannelRouter {
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    dispatcher: EventDispatcher,
    identity: IdentityContext,
    metrics: Arc<SyncMetrics>,
    retry: RetryPolicy,
    page_size: usize,
    feeds: RwLock<HashMap<String, MessageFeed>>,
    active: Mutex<Option<ActivePump>>,
}

impl ChannelRouter {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
        dispatcher: EventDispatcher,
        identity: IdentityContext,
        metrics: Arc<SyncMetrics>,
        retry: RetryPolicy,
        page_size: usize,
    ) -> Self {
        Self {
            transport,
            store,
            dispatcher,
            identity,
            metrics,
            retry,
            page_size,
            feeds: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    /// 当前活跃频道
    pub fn active_channel(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|pump| pump.channel_id.clone())
    }

    /// 打开（或切换到）一个频道
    ///
    /// 先退订上一个频道，再订阅新频道，然后才交出新频道的序列。
    #[instrument(skip(self))]
    pub async fn open(&self, channel_id: &str) -> MessageFeed {
        self.stop_active();

        let feed = {
            let feeds = self.feeds.read().await;
            feeds.get(channel_id).cloned()
        };
        let feed = match feed {
            Some(feed) => feed,
            None => {
                let feed = MessageFeed::open(
                    channel_id,
                    self.transport.clone(),
                    self.store.clone(),
                    self.dispatcher.clone(),
                    self.identity.clone(),
                    self.metrics.clone(),
                )
                .await;
                self.feeds
                    .write()
                    .await
                    .entry(channel_id.to_string())
                    .or_insert_with(|| feed.clone())
                    .clone()
            }
        };

        let pump = SubscriptionPump::new(self.transport.clone(), feed.topic(), self.retry.clone());
        let handle = tokio::spawn(pump.run(Arc::new(feed.clone())));
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActivePump {
            channel_id: channel_id.to_string(),
            handle,
        });

        // 最近一页历史：拉取失败只记日志，已有序列保持不变
        if let Err(err) = feed.fetch_history(self.page_size).await {
            warn!(channel_id, error = %err, "history fetch failed, keeping local sequence");
        }
        debug!(channel_id, "channel opened");
        feed
    }

    /// 关闭当前频道的订阅（历史序列保留在内存与存储中）
    pub fn close(&self) {
        self.stop_active();
    }

    fn stop_active(&self) {
        if let Some(previous) = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            debug!(channel_id = %previous.channel_id, "unsubscribing previous channel");
            previous.handle.abort();
        }
    }
}

impl Drop for ChannelRouter {
    fn drop(&mut self) {
        self.stop_active();
    }
}
