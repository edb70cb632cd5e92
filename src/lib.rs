//! Flare IM 客户端状态核心库
//!
//! 把本地乐观变更与异步到达的服务端权威事件合并为一致的客户端状态：
//! - 通用对账引擎（临时 ID 谱系、删除墓碑、有序去重快照）
//! - 通知中心（未读角标推导、批量已读、容量淘汰）
//! - 频道消息序列（乐观发送、失败重试、回声去重、频道切换交接）
//! - 连接请求生命周期（幂等终态迁移、连接建立副作用）
//!
//! 渲染层、认证层与具体网络栈都是注入的外部协作者；本库只决定
//! 任意时刻的权威一致状态，以及何时通知观察方状态变化。

pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod identity;
pub mod message;
pub mod metrics;
pub mod notification;
pub mod reconcile;
pub mod store;
pub mod transport;

pub use bootstrap::ClientCore;
pub use config::{ClientCoreConfig, RetryPolicyConfig, load_config};
pub use connection::{Connection, ConnectionLifecycle, ConnectionRequest, ConnectionStatus};
pub use error::{ClientCoreError, Result};
pub use events::{EventDispatcher, StateEvent};
pub use identity::IdentityContext;
pub use message::{ChannelRouter, Message, MessageFeed, MessageKind, MessageState};
pub use metrics::SyncMetrics;
pub use notification::{
    Notification, NotificationAction, NotificationCategory, NotificationCenter,
    NotificationDraft, NotificationPriority,
};
pub use reconcile::{EngineState, Reconcilable, ReconciliationEngine, RemoteEvent, RemoteOutcome};
pub use store::{DurableStore, FileStore, InMemoryStore};
pub use transport::{
    InMemoryTransport, PushEvent, PushHandler, PushSubscription, RetryPolicy, SubscriptionPump,
    Transport,
};
