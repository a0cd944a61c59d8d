//! 同步协调器
//!
//! 一个周期：拉取（各集合并发）→ 推送（按入队顺序串行）→ 空闲。
//! 离线时整个周期跳过。并发调用 `sync()` 共享同一个进行中的周期；
//! 周期跑在独立任务上，调用方放弃等待不会打断它。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::FailureKind;
use crate::events::{EventManager, SyncEvent};
use crate::gateway::{RemoteStore, SyncResult};
use crate::network::NetworkMonitor;
use crate::storage::{ActionKind, LocalStore, PendingAction, PendingActionQueue, Record};
use crate::sync::{CollectionName, FlushFailure, PullOutcome, SyncReport, SyncState};

type CycleFuture = Shared<BoxFuture<'static, SyncReport>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    Normal,
    /// 队列为空时先清理队列条目，再做一次完整拉取
    Resync,
}

/// 同步协调器
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    remote: Arc<dyn RemoteStore>,
    local_store: Arc<LocalStore>,
    queue: Arc<PendingActionQueue>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    state: RwLock<SyncState>,
    in_flight: Mutex<Option<CycleFuture>>,
    /// 本地写入（本地存储 + 队列）与合并/确认之间互斥
    mutation_gate: Mutex<()>,
    /// 正在提交的意图 action_id；只在持有 mutation_gate 时读写
    submitting: Mutex<Option<String>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.state())
            .field("pending", &self.inner.queue.len())
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local_store: Arc<LocalStore>,
        queue: Arc<PendingActionQueue>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                remote,
                local_store,
                queue,
                network,
                events,
                state: RwLock::new(SyncState::Idle),
                in_flight: Mutex::new(None),
                mutation_gate: Mutex::new(()),
                submitting: Mutex::new(None),
            }),
        }
    }

    /// 当前状态
    pub fn state(&self) -> SyncState {
        *self.inner.state.read()
    }

    /// 是否有正在进行的周期
    pub fn is_syncing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// 执行一次同步；已有周期在跑时等待并返回它的结果
    pub async fn sync(&self) -> SyncReport {
        self.start_cycle(CycleMode::Normal).await
    }

    /// 完整重同步
    ///
    /// 先跑一个普通周期；只有推送全部成功且队列已空时，才清理队列并重新拉取全部集合。
    /// 否则直接返回第一个周期的结果，队列保持不动。
    pub async fn full_resync(&self) -> SyncReport {
        let first = self.sync().await;
        if !first.fully_flushed() || !self.inner.queue.is_empty() {
            warn!(
                "⚠️ 完整重同步中止：仍有 {} 条待同步变更未确认",
                self.inner.queue.len()
            );
            return first;
        }

        info!("🔄 开始完整重同步");
        let mut second = self.start_cycle(CycleMode::Resync).await;
        second.started_at = first.started_at;
        second.flushed += first.flushed;
        second
    }

    /// 等待进行中的周期结束（关闭时使用）
    pub async fn wait_idle(&self) {
        let current = self.inner.in_flight.lock().clone();
        if let Some(cycle) = current {
            cycle.await;
        }
    }

    /// 本地写入时持有，保证"写本地 + 入队"对合并和确认是原子的
    pub(crate) fn mutation_guard(&self) -> MutexGuard<'_, ()> {
        self.inner.mutation_gate.lock()
    }

    /// 该意图是否正在提交给远端（调用方需持有 `mutation_guard`）
    pub(crate) fn is_submitting(&self, action: &PendingAction) -> bool {
        self.inner.submitting.lock().as_deref() == Some(action.action_id.as_str())
    }

    fn start_cycle(&self, mode: CycleMode) -> CycleFuture {
        let mut slot = self.inner.in_flight.lock();
        if let Some(existing) = slot.as_ref() {
            debug!("已有同步周期在进行，共享其结果");
            return existing.clone();
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let report = inner.run_cycle(mode).await;
            inner.in_flight.lock().take();
            report
        });

        let fallback = self.inner.clone();
        let cycle = async move {
            match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("❌ 同步任务异常退出: {}", e);
                    fallback.in_flight.lock().take();
                    fallback.submitting.lock().take();
                    fallback.set_state(SyncState::Idle);
                    SyncReport {
                        remaining: fallback.queue.len(),
                        ..Default::default()
                    }
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(cycle.clone());
        cycle
    }
}

impl CoordinatorInner {
    fn set_state(&self, new_state: SyncState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            debug!("同步状态: {:?} -> {:?}", old_state, new_state);
            self.events.emit(SyncEvent::StateChanged { old_state, new_state });
        }
    }

    async fn run_cycle(&self, mode: CycleMode) -> SyncReport {
        let started_at = chrono::Utc::now().timestamp_millis();

        if !self.network.is_online() {
            info!("📴 离线，跳过同步（待同步 {} 条）", self.queue.len());
            return SyncReport::skipped(started_at, self.queue.len());
        }

        if mode == CycleMode::Resync {
            let _gate = self.mutation_gate.lock();
            if self.queue.is_empty() {
                if let Err(e) = self.queue.clear() {
                    warn!("⚠️ 清理同步队列失败: {}", e);
                }
            }
        }

        self.set_state(SyncState::Pulling);
        let pulls = self.pull_all().await;

        self.set_state(SyncState::Flushing);
        let (flushed, halted) = self.flush().await;

        self.set_state(SyncState::Idle);

        let report = SyncReport {
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
            skipped_offline: false,
            pulls,
            flushed,
            halted,
            remaining: self.queue.len(),
        };
        info!(
            "✅ 同步周期结束: 推送 {} 条，剩余 {} 条，拉取失败 {} 个集合",
            report.flushed,
            report.remaining,
            report.pull_failures().count()
        );
        report
    }

    async fn pull_all(&self) -> Vec<PullOutcome> {
        let fetches = CollectionName::ALL.iter().map(|&collection| async move {
            (collection, self.remote.fetch_collection(collection).await)
        });

        let mut outcomes = Vec::with_capacity(CollectionName::ALL.len());
        for (collection, result) in join_all(fetches).await {
            let outcome = match result {
                Ok(remote) => self.apply_pull(collection, remote),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(records) => outcomes.push(PullOutcome::Replaced { collection, records }),
                Err(e) => {
                    let kind = e.failure_kind();
                    if kind == FailureKind::Storage {
                        error!("❌ {} 拉取成功但写入本地失败，本地数据未变: {}", collection, e);
                    } else {
                        warn!("⚠️ 拉取 {} 失败，继续使用本地数据: {}", collection, e);
                    }
                    let message = e.to_string();
                    self.events.emit(SyncEvent::PullFailed {
                        collection,
                        kind,
                        message: message.clone(),
                    });
                    outcomes.push(PullOutcome::Failed { collection, kind, message });
                }
            }
        }
        outcomes
    }

    fn apply_pull(&self, collection: CollectionName, remote: Vec<Record>) -> crate::error::Result<usize> {
        let _gate = self.mutation_gate.lock();
        let pending: HashMap<String, PendingAction> = self
            .queue
            .dequeue_all()
            .into_iter()
            .filter(|a| a.collection == collection)
            .map(|a| (a.id.clone(), a))
            .collect();

        let count = self
            .local_store
            .update_with(collection, |local| merge_pulled(remote, local, &pending))?;
        debug!("📥 {} 合并完成: {} 条（保留本地待同步 {} 条）", collection, count, pending.len());
        Ok(count)
    }

    async fn flush(&self) -> (usize, Option<FlushFailure>) {
        let snapshot = self.queue.dequeue_all();
        if snapshot.is_empty() {
            return (0, None);
        }
        info!("📤 开始推送 {} 条待同步变更", snapshot.len());

        let mut flushed = 0;
        for action in snapshot {
            if !self.begin_submit(&action) {
                debug!("{} 已被取代或撤销，跳过", action);
                continue;
            }
            let result = self
                .remote
                .submit_action(action.collection, action.action, &action.payload)
                .await;

            let failure = match result {
                SyncResult::Success(_) => match self.confirm(&action) {
                    Ok(()) => None,
                    Err(e) => Some((e.failure_kind(), e.to_string())),
                },
                SyncResult::Failure { kind, message } => Some((kind, message)),
            };

            match failure {
                None => {
                    flushed += 1;
                    self.events.emit(SyncEvent::ActionFlushed {
                        collection: action.collection,
                        id: action.id.clone(),
                        action: action.action,
                    });
                    self.events.emit(SyncEvent::PendingCountChanged { count: self.queue.len() });
                }
                Some((kind, message)) => {
                    self.end_submit();
                    let remaining = self.queue.len();
                    warn!("⚠️ 推送中止于 {}: {}（剩余 {} 条）", action, message, remaining);
                    self.events.emit(SyncEvent::FlushHalted {
                        collection: action.collection,
                        id: action.id.clone(),
                        action: action.action,
                        kind,
                        message: message.clone(),
                        remaining,
                    });
                    return (
                        flushed,
                        Some(FlushFailure {
                            collection: action.collection,
                            id: action.id,
                            action: action.action,
                            kind,
                            message,
                        }),
                    );
                }
            }
        }
        (flushed, None)
    }

    /// 快照里的意图仍是当前意图时标记为提交中
    fn begin_submit(&self, action: &PendingAction) -> bool {
        let _gate = self.mutation_gate.lock();
        if !self.queue.is_current(action) {
            return false;
        }
        *self.submitting.lock() = Some(action.action_id.clone());
        true
    }

    fn end_submit(&self) {
        let _gate = self.mutation_gate.lock();
        self.submitting.lock().take();
    }

    /// 远端确认后：出队；确认的删除同时移除本地记录
    fn confirm(&self, action: &PendingAction) -> crate::error::Result<()> {
        let _gate = self.mutation_gate.lock();
        self.submitting.lock().take();
        let acknowledged = self.queue.acknowledge(action)?;
        if !acknowledged {
            debug!("{} 已被新的变更取代，保留队列中的新意图", action);
            return Ok(());
        }
        if action.action == ActionKind::Delete {
            self.local_store.remove(action.collection, &action.id)?;
        }
        Ok(())
    }
}

/// 合并远端集合与本地集合
///
/// - 没有待同步变更的记录：以远端为准（远端顺序）
/// - 有待同步变更且远端存在：保留本地版本，放在远端位置
/// - 有待同步变更但远端不存在：按本地顺序追加到末尾
/// - 本地已没有副本时回退到变更快照；待删除的记录不再出现
pub(crate) fn merge_pulled(
    remote: Vec<Record>,
    local: Vec<Record>,
    pending: &HashMap<String, PendingAction>,
) -> Vec<Record> {
    if pending.is_empty() {
        let mut seen = HashSet::new();
        return remote.into_iter().filter(|r| seen.insert(r.id.clone())).collect();
    }

    let mut local_by_id: HashMap<String, Record> = HashMap::new();
    let mut local_order = Vec::new();
    for record in local {
        if pending.contains_key(&record.id) {
            local_order.push(record.id.clone());
            local_by_id.insert(record.id.clone(), record);
        }
    }

    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(remote.len() + local_order.len());
    for record in remote {
        if !seen.insert(record.id.clone()) {
            continue;
        }
        match pending.get(&record.id) {
            None => merged.push(record),
            Some(action) => {
                if let Some(local) = local_by_id.remove(&record.id) {
                    merged.push(local);
                } else if action.action != ActionKind::Delete {
                    merged.push(action.payload.clone());
                }
            }
        }
    }

    for id in local_order {
        if let Some(local) = local_by_id.remove(&id) {
            if seen.insert(id) {
                merged.push(local);
            }
        }
    }
    merged
}
