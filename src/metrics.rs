//! 对账核心监控指标
//! 提供本地乐观状态与服务端事件合并过程的指标收集

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// 对账监控指标
#[derive(Clone)]
pub struct SyncMetrics {
    /// 远端事件插入数
    pub remote_inserted: IntCounter,
    /// 远端事件合并数（已确认实体的字段更新）
    pub remote_merged: IntCounter,
    /// 临时ID谱系就地替换数
    pub lineage_replaced: IntCounter,
    /// 重复投递丢弃数
    pub duplicates_dropped: IntCounter,
    /// 墓碑拦截数（删除终态之后到达的过期事件）
    pub tombstone_dropped: IntCounter,
    /// 容量淘汰数
    pub evictions: IntCounter,
    /// 发送确认数
    pub sends_confirmed: IntCounter,
    /// 发送失败数
    pub sends_failed: IntCounter,
    /// 发送重试数
    pub send_retries: IntCounter,
    /// 按类型分类的推送事件数
    pub push_events: IntCounterVec,
    /// 持久化错误数
    pub persistence_errors: IntCounter,
}

impl SyncMetrics {
    /// 创建并注册对账监控指标
    pub fn new(registry: &Registry) -> Result<Self, Box<dyn std::error::Error>> {
        let remote_inserted = IntCounter::new(
            "sync_remote_inserted",
            "Remote events inserted as new entities",
        )?;
        let remote_merged = IntCounter::new(
            "sync_remote_merged",
            "Remote updates merged into confirmed entities",
        )?;
        let lineage_replaced = IntCounter::new(
            "sync_lineage_replaced",
            "Optimistic temp entries replaced in place by server entities",
        )?;
        let duplicates_dropped = IntCounter::new(
            "sync_duplicates_dropped",
            "Duplicate remote deliveries dropped",
        )?;
        let tombstone_dropped = IntCounter::new(
            "sync_tombstone_dropped",
            "Stale events dropped because the entity was already deleted",
        )?;
        let evictions = IntCounter::new(
            "sync_evictions",
            "Entities evicted by the bounded-size policy",
        )?;
        let sends_confirmed =
            IntCounter::new("sync_sends_confirmed", "Optimistic sends confirmed by ack")?;
        let sends_failed =
            IntCounter::new("sync_sends_failed", "Optimistic sends marked failed")?;
        let send_retries = IntCounter::new("sync_send_retries", "Failed sends retried")?;
        let push_events = IntCounterVec::new(
            Opts::new("sync_push_events", "Push events handled, by kind"),
            &["kind"],
        )?;
        let persistence_errors = IntCounter::new(
            "sync_persistence_errors",
            "Durable store failures (state kept in memory)",
        )?;

        registry.register(Box::new(remote_inserted.clone()))?;
        registry.register(Box::new(remote_merged.clone()))?;
        registry.register(Box::new(lineage_replaced.clone()))?;
        registry.register(Box::new(duplicates_dropped.clone()))?;
        registry.register(Box::new(tombstone_dropped.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(sends_confirmed.clone()))?;
        registry.register(Box::new(sends_failed.clone()))?;
        registry.register(Box::new(send_retries.clone()))?;
        registry.register(Box::new(push_events.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;

        Ok(Self {
            remote_inserted,
            remote_merged,
            lineage_replaced,
            duplicates_dropped,
            tombstone_dropped,
            evictions,
            sends_confirmed,
            sends_failed,
            send_retries,
            push_events,
            persistence_errors,
        })
    }

    /// 创建挂在独立 Registry 上的指标（测试或未接入监控的宿主使用）
    pub fn unregistered() -> Self {
        let registry = Registry::new();
        Self::new(&registry).expect("metrics construction on a fresh registry cannot fail")
    }
}
