//! 待同步队列（Pending-Action Queue）
//!
//! 规则：
//! - 同一 (集合, id) 最多保留一个意图，新意图替换旧意图（不合并），并排到队尾
//! - 其它条目保持 FIFO 顺序
//! - 只有远端确认成功后才从队列中移除
//!
//! 内部用 `(集合, id) → 条目` 的映射加一个按序号排序的索引实现，
//! 入队/移除都是 O(log n)。整个队列作为一个 KV 条目持久化。

use std::collections::{BTreeMap, HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::kv::{keys, KvStore};
use crate::sync::CollectionName;

pub mod pending_action;
pub mod retry_policy;

pub use pending_action::{ActionKind, PendingAction, QueueKey};
pub use retry_policy::{retry_with_backoff, RetryPolicy, Sleeper, TokioSleeper};

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub total_actions: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    /// 最早一条意图的入队时间（毫秒）
    pub oldest_enqueued_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
struct QueueState {
    entries: HashMap<QueueKey, (u64, PendingAction)>,
    order: BTreeMap<u64, QueueKey>,
    next_seq: u64,
}

impl QueueState {
    fn from_actions(actions: Vec<PendingAction>) -> Self {
        let mut state = Self::default();
        for action in actions {
            state.push(action);
        }
        state
    }

    /// 先删同目标旧条目，再追加到队尾
    fn push(&mut self, action: PendingAction) -> Option<PendingAction> {
        let key = action.key();
        let replaced = self.take(&key);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key, (seq, action));
        replaced
    }

    fn take(&mut self, key: &QueueKey) -> Option<PendingAction> {
        let (seq, action) = self.entries.remove(key)?;
        self.order.remove(&seq);
        Some(action)
    }

    fn ordered(&self) -> Vec<PendingAction> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key).map(|(_, action)| action.clone()))
            .collect()
    }
}

/// 队列检查点
#[derive(Debug, Clone)]
pub(crate) struct QueueCheckpoint(QueueState);

/// 持久化的待同步队列
#[derive(Debug)]
pub struct PendingActionQueue {
    kv: KvStore,
    state: Mutex<QueueState>,
}

impl PendingActionQueue {
    /// 从 KV 加载队列；条目缺失或损坏时按空队列处理
    pub fn load(kv: KvStore) -> Self {
        let actions = match kv.get::<_, Vec<PendingAction>>(keys::SYNC_QUEUE) {
            Ok(Some(actions)) => actions,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("⚠️ 读取待同步队列失败，按空队列处理: {}", e);
                Vec::new()
            }
        };
        let state = QueueState::from_actions(actions);
        info!("待同步队列已加载: {} 条", state.entries.len());
        Self {
            kv,
            state: Mutex::new(state),
        }
    }

    /// 在副本上修改并落盘，成功后才替换内存状态
    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut QueueState) -> T,
    {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let output = f(&mut next);
        self.kv.set(keys::SYNC_QUEUE, &next.ordered())?;
        *state = next;
        Ok(output)
    }

    /// 入队（同目标的旧意图被丢弃）
    pub fn enqueue(&self, action: PendingAction) -> Result<()> {
        let label = action.to_string();
        let replaced = self.mutate(|state| state.push(action))?;
        match replaced {
            Some(old) => debug!("入队 {}，替换了未发送的 {}", label, old),
            None => debug!("入队 {}", label),
        }
        Ok(())
    }

    /// 有序快照，不移除任何条目
    pub fn dequeue_all(&self) -> Vec<PendingAction> {
        self.state.lock().ordered()
    }

    /// 按目标 id 移除（不区分集合），返回移除条数
    pub fn remove(&self, id: &str) -> Result<usize> {
        self.mutate(|state| {
            let keys: Vec<QueueKey> = state.entries.keys().filter(|k| k.id == id).cloned().collect();
            keys.iter().filter(|k| state.take(k).is_some()).count()
        })
    }

    /// 移除指定目标的意图并返回它
    pub fn remove_target(&self, collection: CollectionName, id: &str) -> Result<Option<PendingAction>> {
        let key = QueueKey { collection, id: id.to_string() };
        if !self.state.lock().entries.contains_key(&key) {
            return Ok(None);
        }
        self.mutate(|state| state.take(&key))
    }

    /// 该意图是否仍是目标当前的待发送意图
    pub fn is_current(&self, action: &PendingAction) -> bool {
        matches!(
            self.state.lock().entries.get(&action.key()),
            Some((_, current)) if current.action_id == action.action_id
        )
    }

    /// 确认刷出成功：仅当队列中该目标仍是同一个意图时才移除
    ///
    /// 刷出期间 UI 可能为同一目标入队了新意图，此时保留新意图。
    /// 已确认的是 Create 而新意图也是 Create 时，远端已有该行，新意图改为 Update。
    pub fn acknowledge(&self, action: &PendingAction) -> Result<bool> {
        let key = action.key();
        let current_kind = match self.state.lock().entries.get(&key) {
            Some((_, current)) if current.action_id == action.action_id => None,
            Some((_, current)) => Some(current.action),
            None => return Ok(false),
        };

        if let Some(kind) = current_kind {
            if action.action == ActionKind::Create && kind == ActionKind::Create {
                self.mutate(|state| {
                    if let Some((_, current)) = state.entries.get_mut(&key) {
                        current.action = ActionKind::Update;
                    }
                })?;
                debug!("{} 已在远端创建，后续意图改为 Update", action);
            } else {
                debug!("{} 在刷出期间被新意图替换，保留新意图", action);
            }
            return Ok(false);
        }

        self.mutate(|state| {
            let still_current = matches!(
                state.entries.get(&key),
                Some((_, current)) if current.action_id == action.action_id
            );
            still_current && state.take(&key).is_some()
        })
    }

    /// 记录当前队列，供多步写入失败时回滚
    pub(crate) fn checkpoint(&self) -> QueueCheckpoint {
        QueueCheckpoint(self.state.lock().clone())
    }

    /// 回到检查点时的队列并落盘
    pub(crate) fn rollback(&self, checkpoint: QueueCheckpoint) -> Result<()> {
        if self.state.lock().ordered() == checkpoint.0.ordered() {
            return Ok(());
        }
        self.mutate(|state| *state = checkpoint.0)
    }

    /// 清空队列
    pub fn clear(&self) -> Result<()> {
        self.mutate(|state| *state = QueueState::default())?;
        info!("待同步队列已清空");
        Ok(())
    }

    /// 待同步数量（UI 角标）
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 指定目标当前的待发送意图
    pub fn pending_target(&self, collection: CollectionName, id: &str) -> Option<PendingAction> {
        let key = QueueKey { collection, id: id.to_string() };
        self.state.lock().entries.get(&key).map(|(_, action)| action.clone())
    }

    /// 某集合中所有有待发送意图的记录 id
    pub fn pending_ids(&self, collection: CollectionName) -> HashSet<String> {
        self.state
            .lock()
            .entries
            .keys()
            .filter(|k| k.collection == collection)
            .map(|k| k.id.clone())
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            total_actions: state.entries.len(),
            ..Default::default()
        };
        for (_, action) in state.entries.values() {
            match action.action {
                ActionKind::Create => stats.creates += 1,
                ActionKind::Update => stats.updates += 1,
                ActionKind::Delete => stats.deletes += 1,
            }
            stats.oldest_enqueued_at = Some(match stats.oldest_enqueued_at {
                Some(t) => t.min(action.enqueued_at),
                None => action.enqueued_at,
            });
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::Record;
    use tempfile::TempDir;

    async fn open_queue(dir: &TempDir) -> PendingActionQueue {
        PendingActionQueue::load(KvStore::open(dir.path(), "test").await.unwrap())
    }

    fn product(id: &str, stock: i64) -> Record {
        Record::new(id).with_field("Stock", stock)
    }

    #[tokio::test]
    async fn test_squash_keeps_last_payload() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;

        for stock in [5, 4, 3] {
            queue.enqueue(PendingAction::update(CollectionName::Products, product("P1", stock))).unwrap();
        }

        let snapshot = queue.dequeue_all();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].payload.get_i64("Stock"), Some(3));
    }

    #[tokio::test]
    async fn test_squash_moves_target_to_tail_and_keeps_others_fifo() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;

        queue.enqueue(PendingAction::create(CollectionName::Products, product("A", 1))).unwrap();
        queue.enqueue(PendingAction::create(CollectionName::Products, product("B", 1))).unwrap();
        queue.enqueue(PendingAction::create(CollectionName::Products, product("C", 1))).unwrap();
        queue.enqueue(PendingAction::update(CollectionName::Products, product("A", 2))).unwrap();

        let ids: Vec<_> = queue.dequeue_all().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn test_same_id_in_different_collections_are_distinct_targets() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;

        queue.enqueue(PendingAction::create(CollectionName::Products, Record::new("X"))).unwrap();
        queue.enqueue(PendingAction::create(CollectionName::Sales, Record::new("X"))).unwrap();
        assert_eq!(queue.len(), 2);

        // remove 按 id 移除，不区分集合
        assert_eq!(queue.remove("X").unwrap(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_all_does_not_remove() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;

        queue.enqueue(PendingAction::create(CollectionName::Sales, Record::new("S1"))).unwrap();
        let _ = queue.dequeue_all();
        let _ = queue.dequeue_all();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_ignores_superseded_intent() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;

        queue.enqueue(PendingAction::update(CollectionName::Products, product("P1", 5))).unwrap();
        let in_flight = queue.dequeue_all().remove(0);

        // 刷出期间 UI 又改了一次
        queue.enqueue(PendingAction::update(CollectionName::Products, product("P1", 3))).unwrap();

        assert!(!queue.acknowledge(&in_flight).unwrap());
        let remaining = queue.dequeue_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload.get_i64("Stock"), Some(3));

        assert!(queue.acknowledge(&remaining[0]).unwrap());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledged_create_turns_newer_create_into_update() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;

        queue.enqueue(PendingAction::create(CollectionName::Products, product("P1", 5))).unwrap();
        let in_flight = queue.dequeue_all().remove(0);
        queue.enqueue(PendingAction::create(CollectionName::Products, product("P1", 4))).unwrap();

        assert!(!queue.acknowledge(&in_flight).unwrap());
        let remaining = queue.dequeue_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].action, ActionKind::Update);
        assert_eq!(remaining[0].payload.get_i64("Stock"), Some(4));
        drop(queue);

        // 改写已落盘
        let queue = open_queue(&dir).await;
        assert_eq!(queue.dequeue_all()[0].action, ActionKind::Update);
    }

    #[tokio::test]
    async fn test_acknowledged_create_keeps_newer_delete() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;

        queue.enqueue(PendingAction::create(CollectionName::Customers, Record::new("C1"))).unwrap();
        let in_flight = queue.dequeue_all().remove(0);
        queue.enqueue(PendingAction::delete(CollectionName::Customers, Record::new("C1"))).unwrap();

        assert!(!queue.acknowledge(&in_flight).unwrap());
        assert!(!queue.is_current(&in_flight));
        assert_eq!(queue.dequeue_all()[0].action, ActionKind::Delete);
    }

    #[tokio::test]
    async fn test_rollback_restores_checkpoint_on_disk() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;
        queue.enqueue(PendingAction::update(CollectionName::Products, product("P1", 5))).unwrap();
        let before = queue.dequeue_all();

        let checkpoint = queue.checkpoint();
        queue.enqueue(PendingAction::create(CollectionName::Customers, Record::new("C1"))).unwrap();
        queue.enqueue(PendingAction::update(CollectionName::Products, product("P1", 2))).unwrap();
        queue.rollback(checkpoint).unwrap();

        assert_eq!(queue.dequeue_all(), before);
        drop(queue);
        assert_eq!(open_queue(&dir).await.dequeue_all(), before);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen_in_order() {
        let dir = TempDir::new().unwrap();
        {
            let queue = open_queue(&dir).await;
            queue.enqueue(PendingAction::create(CollectionName::Customers, Record::new("C1"))).unwrap();
            queue.enqueue(PendingAction::create(CollectionName::Sales, Record::new("S1"))).unwrap();
        }

        let queue = open_queue(&dir).await;
        let snapshot = queue.dequeue_all();
        let ids: Vec<_> = snapshot.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["C1", "S1"]);
        assert_eq!(snapshot[0].collection, CollectionName::Customers);
    }

    #[tokio::test]
    async fn test_corrupt_queue_loads_empty() {
        let dir = TempDir::new().unwrap();
        {
            let kv = KvStore::open(dir.path(), "test").await.unwrap();
            kv.set_raw(keys::SYNC_QUEUE, b"[{\"broken\":").unwrap();
        }

        let queue = open_queue(&dir).await;
        assert!(queue.is_empty());
        queue.enqueue(PendingAction::create(CollectionName::Products, Record::new("P1"))).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir).await;

        queue.enqueue(PendingAction::create(CollectionName::Products, Record::new("P1"))).unwrap();
        queue.enqueue(PendingAction::update(CollectionName::Products, Record::new("P2"))).unwrap();
        queue.enqueue(PendingAction::delete(CollectionName::Sales, Record::new("S9"))).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total_actions, 3);
        assert_eq!((stats.creates, stats.updates, stats.deletes), (1, 1, 1));
        assert!(stats.oldest_enqueued_at.is_some());

        assert_eq!(queue.pending_ids(CollectionName::Products).len(), 2);
        assert!(queue.pending_target(CollectionName::Sales, "S9").is_some());

        queue.clear().unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.stats(), QueueStats::default());
    }
}
