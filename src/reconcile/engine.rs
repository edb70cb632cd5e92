//! 通用对账引擎
//!
//! 引擎维护一个以实体 ID 为键的去重集合，并保证对外快照始终按
//! `(created_at, id)` 排序。本地乐观写入是展示层的预测，服务端
//! 对账永远纠正本地，反之不成立。
//!
//! 三条核心规则：
//! - 临时 ID 谱系：乐观实体先以客户端临时 ID 入场，服务端确认后
//!   就地换成服务端 ID，绝不产生重复条目。
//! - 删除终态：删除一经应用即落墓碑，之后乱序到达的确认/更新一律丢弃。
//! - 重复投递幂等：已应用过的事件再来一次没有任何额外效果。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 可对账实体
pub trait Reconcilable: Clone + Send + Sync {
    /// 实体 ID（临时或服务端分配）
    fn entity_id(&self) -> &str;

    /// 创建时间（排序主键）
    fn created_at(&self) -> DateTime<Utc>;

    /// 是否允许被容量淘汰；等待乐观确认的实体必须返回 false
    fn is_evictable(&self) -> bool {
        false
    }

    /// 合并一次远端字段更新；终态保护由实体自身实现
    fn merge_remote(&mut self, incoming: Self);

    /// 转入失败表示（保留在集合里供重试，而不是悄悄丢掉）
    fn mark_failed(&mut self, reason: &str);
}

/// 远端事件
#[derive(Debug, Clone)]
pub enum RemoteEvent<T> {
    /// 新实体或已有实体的更新；`lineage` 为本端在途操作的客户端临时 ID
    Upsert { entity: T, lineage: Option<String> },
    /// 删除（终态）
    Delete { id: String },
}

/// 远端事件的应用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// 未见过的实体，已插入
    Inserted,
    /// 临时条目已就地替换为服务端实体
    Replaced,
    /// 已确认实体的字段更新已合并
    Merged,
    /// 重复投递，已丢弃
    DuplicateDropped,
    /// 实体已处于删除终态，事件已丢弃
    TombstoneDropped,
    /// 删除已应用
    Removed,
    /// 删除目标不存在（仍落墓碑以拦截乱序事件）
    Missed,
}

/// 可持久化的引擎状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState<T> {
    pub entries: Vec<T>,
    pub tombstones: Vec<String>,
    /// (客户端临时 ID, 服务端 ID) 谱系对
    pub lineage: Vec<(String, String)>,
}

impl<T> Default for EngineState<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            tombstones: Vec::new(),
            lineage: Vec::new(),
        }
    }
}

/// 通用对账引擎
#[derive(Debug)]
pub struct ReconciliationEngine<T> {
    entries: HashMap<String, T>,
    /// 已完成谱系：临时 ID -> 服务端 ID
    resolved_by_temp: HashMap<String, String>,
    /// 已完成谱系：服务端 ID -> 临时 ID
    resolved_by_server: HashMap<String, String>,
    /// 删除终态集合
    tombstones: HashSet<String>,
    /// 容量上限（仅通知场景配置）
    cap: Option<usize>,
}

impl<T: Reconcilable> ReconciliationEngine<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            resolved_by_temp: HashMap::new(),
            resolved_by_server: HashMap::new(),
            tombstones: HashSet::new(),
            cap: None,
        }
    }

    pub fn with_cap(cap: usize) -> Self {
        let mut engine = Self::new();
        engine.cap = Some(cap);
        engine
    }

    /// 从持久化状态重建引擎
    pub fn from_state(state: EngineState<T>, cap: Option<usize>) -> Self {
        let mut engine = Self::new();
        engine.cap = cap;
        engine.restore_state(state);
        engine
    }

    /// 本地乐观写入：同步应用，立即返回本地可见实体
    pub fn apply_local(&mut self, entity: T) -> T {
        let id = entity.entity_id().to_string();
        self.entries.insert(id, entity.clone());
        entity
    }

    /// 应用一条远端事件
    pub fn apply_remote(&mut self, event: RemoteEvent<T>) -> RemoteOutcome {
        match event {
            RemoteEvent::Upsert { entity, lineage } => self.apply_upsert(entity, lineage),
            RemoteEvent::Delete { id } => self.apply_delete(&id),
        }
    }

    fn apply_upsert(&mut self, entity: T, lineage: Option<String>) -> RemoteOutcome {
        let server_id = entity.entity_id().to_string();

        if self.is_tombstoned(&server_id) {
            // 删除先于确认到达：连同还挂在临时 ID 下的乐观条目一起清掉
            if let Some(temp) = lineage {
                self.entries.remove(&temp);
                self.tombstones.insert(temp);
            }
            return RemoteOutcome::TombstoneDropped;
        }

        if let Some(temp) = lineage {
            if self.is_tombstoned(&temp) {
                return RemoteOutcome::TombstoneDropped;
            }
            if self.entries.contains_key(&temp) {
                // 在途乐观条目：就地替换，临时 ID 让位给服务端 ID
                self.entries.remove(&temp);
                self.entries.insert(server_id.clone(), entity);
                self.resolved_by_temp.insert(temp.clone(), server_id.clone());
                self.resolved_by_server.insert(server_id, temp);
                return RemoteOutcome::Replaced;
            }
            if self.resolved_by_temp.contains_key(&temp) {
                // 谱系已完成，这是自己消息的推送回声
                debug!(lineage = %temp, "own echo dropped");
                return RemoteOutcome::DuplicateDropped;
            }
            // 谱系无人认领（例如另一端设备的发送），按普通远端实体处理
        }

        if let Some(existing) = self.entries.get_mut(&server_id) {
            existing.merge_remote(entity);
            return RemoteOutcome::Merged;
        }

        self.entries.insert(server_id, entity);
        RemoteOutcome::Inserted
    }

    fn apply_delete(&mut self, id: &str) -> RemoteOutcome {
        // 把谱系两端的 ID 一起落墓碑，换过 ID 的实体也无法复活
        self.tombstones.insert(id.to_string());
        if let Some(temp) = self.resolved_by_server.get(id).cloned() {
            self.tombstones.insert(temp);
        }
        if let Some(server) = self.resolved_by_temp.get(id).cloned() {
            self.tombstones.insert(server.clone());
            if self.entries.remove(&server).is_some() {
                return RemoteOutcome::Removed;
            }
        }
        if self.entries.remove(id).is_some() {
            RemoteOutcome::Removed
        } else {
            RemoteOutcome::Missed
        }
    }

    /// 本地删除（幂等；同样落墓碑）
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let existed = self.entries.remove(id);
        self.tombstones.insert(id.to_string());
        if let Some(temp) = self.resolved_by_server.get(id).cloned() {
            self.tombstones.insert(temp);
        }
        existed
    }

    /// 乐观操作失败：转入失败表示而不是移除
    pub fn reconcile_failure(&mut self, temp_id: &str, reason: &str) -> Option<T> {
        let entry = self.entries.get_mut(temp_id)?;
        entry.mark_failed(reason);
        Some(entry.clone())
    }

    /// 就地修改一个条目（重试转换等实体相关变更）
    pub fn update<F>(&mut self, id: &str, mutate: F) -> Option<T>
    where
        F: FnOnce(&mut T),
    {
        let entry = self.entries.get_mut(id)?;
        mutate(entry);
        Some(entry.clone())
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 某临时 ID 对应的服务端 ID（谱系已完成时）
    pub fn resolved_server_id(&self, temp_id: &str) -> Option<&str> {
        self.resolved_by_temp.get(temp_id).map(String::as_str)
    }

    /// 对外快照：独立副本，按 `(created_at, id)` 排序
    pub fn snapshot(&self) -> Vec<T> {
        let mut entries: Vec<T> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.entity_id().cmp(b.entity_id()))
        });
        entries
    }

    /// 按条件过滤的快照（纯投影，不修改状态）
    pub fn filtered_snapshot<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut entries: Vec<T> = self
            .entries
            .values()
            .filter(|entity| predicate(entity))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.entity_id().cmp(b.entity_id()))
        });
        entries
    }

    /// 执行容量淘汰：超限时按最旧优先丢弃可淘汰实体，返回淘汰数量
    ///
    /// 等待乐观确认的实体（`is_evictable() == false`）永不淘汰。
    pub fn enforce_cap(&mut self) -> usize {
        let Some(cap) = self.cap else {
            return 0;
        };
        let mut evicted = 0;
        while self.entries.len() > cap {
            let oldest = self
                .entries
                .values()
                .filter(|entity| entity.is_evictable())
                .min_by(|a, b| {
                    a.created_at()
                        .cmp(&b.created_at())
                        .then_with(|| a.entity_id().cmp(b.entity_id()))
                })
                .map(|entity| entity.entity_id().to_string());
            let Some(id) = oldest else {
                break;
            };
            self.entries.remove(&id);
            evicted += 1;
        }
        evicted
    }

    /// 导出可持久化状态（条目 + 墓碑 + 谱系）
    pub fn export_state(&self) -> EngineState<T> {
        EngineState {
            entries: self.snapshot(),
            tombstones: self.tombstones.iter().cloned().collect(),
            lineage: self
                .resolved_by_temp
                .iter()
                .map(|(temp, server)| (temp.clone(), server.clone()))
                .collect(),
        }
    }

    /// 从持久化状态恢复
    pub fn restore_state(&mut self, state: EngineState<T>) {
        self.entries = state
            .entries
            .into_iter()
            .map(|entity| (entity.entity_id().to_string(), entity))
            .collect();
        self.tombstones = state.tombstones.into_iter().collect();
        self.resolved_by_temp.clear();
        self.resolved_by_server.clear();
        for (temp, server) in state.lineage {
            self.resolved_by_server.insert(server.clone(), temp.clone());
            self.resolved_by_temp.insert(temp, server);
        }
    }
}

impl<T: Reconcilable> Default for ReconciliationEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        created_at: DateTime<Utc>,
        body: String,
        settled: bool,
        failed: bool,
    }

    impl Item {
        fn new(id: &str, seconds: i64, body: &str) -> Self {
            Self {
                id: id.to_string(),
                created_at: DateTime::<Utc>::from_timestamp(seconds, 0).unwrap(),
                body: body.to_string(),
                settled: true,
                failed: false,
            }
        }

        fn pending(id: &str, seconds: i64, body: &str) -> Self {
            Self {
                settled: false,
                ..Self::new(id, seconds, body)
            }
        }
    }

    impl Reconcilable for Item {
        fn entity_id(&self) -> &str {
            &self.id
        }

        fn created_at(&self) -> DateTime<Utc> {
            self.created_at
        }

        fn is_evictable(&self) -> bool {
            self.settled
        }

        fn merge_remote(&mut self, incoming: Self) {
            self.body = incoming.body;
        }

        fn mark_failed(&mut self, _reason: &str) {
            self.failed = true;
        }
    }

    fn upsert(entity: Item) -> RemoteEvent<Item> {
        RemoteEvent::Upsert {
            entity,
            lineage: None,
        }
    }

    #[test]
    fn test_snapshot_sorted_regardless_of_arrival_order() {
        let mut engine = ReconciliationEngine::new();
        // 乱序投递
        engine.apply_remote(upsert(Item::new("b", 30, "third")));
        engine.apply_remote(upsert(Item::new("a", 10, "first")));
        engine.apply_remote(upsert(Item::new("c", 20, "second")));

        let ids: Vec<_> = engine.snapshot().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_identical_timestamps_break_ties_by_id() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_remote(upsert(Item::new("z", 10, "")));
        engine.apply_remote(upsert(Item::new("a", 10, "")));

        let ids: Vec<_> = engine.snapshot().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec!["a", "z"]);
    }

    #[test]
    fn test_lineage_replaces_in_place_without_duplicate() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_local(Item::pending("tmp-1", 10, "hello"));

        let outcome = engine.apply_remote(RemoteEvent::Upsert {
            entity: Item::new("srv-1", 10, "hello"),
            lineage: Some("tmp-1".to_string()),
        });
        assert_eq!(outcome, RemoteOutcome::Replaced);
        assert_eq!(engine.len(), 1);
        assert!(engine.get("srv-1").is_some());
        assert!(engine.get("tmp-1").is_none());

        // 回声重复投递幂等
        let echo = engine.apply_remote(RemoteEvent::Upsert {
            entity: Item::new("srv-1", 10, "hello"),
            lineage: Some("tmp-1".to_string()),
        });
        assert_eq!(echo, RemoteOutcome::DuplicateDropped);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_delete_is_terminal_against_late_confirm() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_remote(upsert(Item::new("srv-1", 10, "hello")));

        assert_eq!(
            engine.apply_remote(RemoteEvent::Delete {
                id: "srv-1".to_string()
            }),
            RemoteOutcome::Removed
        );
        // 乱序到达的确认不能复活已删除实体
        assert_eq!(
            engine.apply_remote(upsert(Item::new("srv-1", 10, "hello"))),
            RemoteOutcome::TombstoneDropped
        );
        assert!(engine.is_empty());
    }

    #[test]
    fn test_delete_before_ack_clears_pending_lineage() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_local(Item::pending("tmp-1", 10, "hello"));

        // 服务端删除先于确认到达
        engine.apply_remote(RemoteEvent::Delete {
            id: "srv-1".to_string(),
        });
        let outcome = engine.apply_remote(RemoteEvent::Upsert {
            entity: Item::new("srv-1", 10, "hello"),
            lineage: Some("tmp-1".to_string()),
        });
        assert_eq!(outcome, RemoteOutcome::TombstoneDropped);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_duplicate_delete_is_idempotent() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_remote(upsert(Item::new("srv-1", 10, "hello")));

        engine.apply_remote(RemoteEvent::Delete {
            id: "srv-1".to_string(),
        });
        assert_eq!(
            engine.apply_remote(RemoteEvent::Delete {
                id: "srv-1".to_string()
            }),
            RemoteOutcome::Missed
        );
        assert!(engine.is_empty());
    }

    #[test]
    fn test_merge_updates_confirmed_entity() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_remote(upsert(Item::new("srv-1", 10, "old")));

        let outcome = engine.apply_remote(upsert(Item::new("srv-1", 10, "new")));
        assert_eq!(outcome, RemoteOutcome::Merged);
        assert_eq!(engine.get("srv-1").unwrap().body, "new");
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_failure_keeps_entity_visible() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_local(Item::pending("tmp-1", 10, "hello"));

        let failed = engine.reconcile_failure("tmp-1", "timeout").unwrap();
        assert!(failed.failed);
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_eviction_skips_pending_entries() {
        let mut engine = ReconciliationEngine::with_cap(2);
        engine.apply_local(Item::pending("tmp-1", 5, "oldest but pending"));
        engine.apply_remote(upsert(Item::new("a", 10, "")));
        engine.apply_remote(upsert(Item::new("b", 20, "")));
        engine.apply_remote(upsert(Item::new("c", 30, "")));

        let evicted = engine.enforce_cap();
        assert_eq!(evicted, 2);
        // 最旧的可淘汰实体先走，pending 永不淘汰
        assert!(engine.get("tmp-1").is_some());
        assert!(engine.get("a").is_none());
        assert!(engine.get("b").is_none());
        assert!(engine.get("c").is_some());
    }

    #[test]
    fn test_state_roundtrip_preserves_tombstones() {
        let mut engine = ReconciliationEngine::new();
        engine.apply_local(Item::pending("tmp-1", 10, "hello"));
        engine.apply_remote(RemoteEvent::Upsert {
            entity: Item::new("srv-1", 10, "hello"),
            lineage: Some("tmp-1".to_string()),
        });
        engine.apply_remote(RemoteEvent::Delete {
            id: "srv-1".to_string(),
        });

        let state = engine.export_state();
        let mut restored: ReconciliationEngine<Item> =
            ReconciliationEngine::from_state(state, None);

        // 重启后删除依然是终态
        assert_eq!(
            restored.apply_remote(upsert(Item::new("srv-1", 10, "hello"))),
            RemoteOutcome::TombstoneDropped
        );
    }
}
