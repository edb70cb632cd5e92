//! 客户端核心装配
//!
//! 按配置把三个子系统装配到同一组注入的协作者上（传输、存储、身份、
//! 分发器、指标），并启动通知与连接主题的订阅泵。频道主题的订阅
//! 由 [`ChannelRouter`] 在打开频道时接管。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ClientCoreConfig;
use crate::connection::ConnectionLifecycle;
use crate::error::{ClientCoreError, Result};
use crate::events::EventDispatcher;
use crate::identity::IdentityContext;
use crate::message::ChannelRouter;
use crate::metrics::SyncMetrics;
use crate::notification::NotificationCenter;
use crate::store::DurableStore;
use crate::transport::{RetryPolicy, SubscriptionPump, Transport};

/// 装配完成的客户端核心
pub struct ClientCore {
    notifications: NotificationCenter,
    channels: ChannelRouter,
    connections: ConnectionLifecycle,
    dispatcher: EventDispatcher,
    pumps: Vec<JoinHandle<()>>,
}

impl ClientCore {
    /// 校验配置、恢复持久化状态并启动后台订阅
    pub async fn bootstrap(
        config: ClientCoreConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
        identity: IdentityContext,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| ClientCoreError::Validation(err.to_string()))?;

        let dispatcher = EventDispatcher::new();
        let retry = RetryPolicy::from(&config.retry);

        let notifications = NotificationCenter::open(
            transport.clone(),
            store.clone(),
            dispatcher.clone(),
            identity.clone(),
            metrics.clone(),
            config.notification_cap,
        )
        .await;
        let connections = ConnectionLifecycle::open(
            transport.clone(),
            store.clone(),
            dispatcher.clone(),
            identity.clone(),
            metrics.clone(),
        )
        .await;
        let channels = ChannelRouter::new(
            transport.clone(),
            store,
            dispatcher.clone(),
            identity.clone(),
            metrics,
            retry.clone(),
            config.channel_page_size,
        );

        let mut pumps = Vec::new();
        let pump = SubscriptionPump::new(transport.clone(), notifications.topic(), retry.clone());
        pumps.push(tokio::spawn(pump.run(Arc::new(notifications.clone()))));
        let pump = SubscriptionPump::new(transport, connections.topic(), retry);
        pumps.push(tokio::spawn(pump.run(Arc::new(connections.clone()))));

        info!(actor_id = identity.current_actor_id(), "client core bootstrapped");
        Ok(Self {
            notifications,
            channels,
            connections,
            dispatcher,
            pumps,
        })
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn channels(&self) -> &ChannelRouter {
        &self.channels
    }

    pub fn connections(&self) -> &ConnectionLifecycle {
        &self.connections
    }

    /// 视图层从这里订阅状态快照
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// 停掉全部后台订阅（状态保留在内存与存储中）
    pub fn shutdown(&mut self) {
        self.channels.close();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
