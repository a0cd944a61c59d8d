//! 事件系统模块 - 向 UI 层广播同步过程中的变化
//!
//! 功能包括：
//! - 同步状态机的状态变化
//! - 拉取失败（非致命，UI 可提示"正在使用本地数据"）
//! - 单条变更的提交结果
//! - 待同步数量变化（角标）
//! - 网络状态变化

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::FailureKind;
use crate::network::NetworkStatus;
use crate::storage::ActionKind;
use crate::sync::{CollectionName, SyncState};

/// SDK 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 同步状态变化
    StateChanged {
        old_state: SyncState,
        new_state: SyncState,
    },
    /// 拉取某个集合失败，本地数据保持不变
    PullFailed {
        collection: CollectionName,
        kind: FailureKind,
        message: String,
    },
    /// 一条变更已被远端确认
    ActionFlushed {
        collection: CollectionName,
        id: String,
        action: ActionKind,
    },
    /// 提交失败，本轮推送中止
    FlushHalted {
        collection: CollectionName,
        id: String,
        action: ActionKind,
        kind: FailureKind,
        message: String,
        remaining: usize,
    },
    /// 待同步数量变化
    PendingCountChanged { count: usize },
    /// 网络状态变化
    NetworkChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::StateChanged { .. } => "state_changed",
            SyncEvent::PullFailed { .. } => "pull_failed",
            SyncEvent::ActionFlushed { .. } => "action_flushed",
            SyncEvent::FlushHalted { .. } => "flush_halted",
            SyncEvent::PendingCountChanged { .. } => "pending_count_changed",
            SyncEvent::NetworkChanged { .. } => "network_changed",
        }
    }

    /// 获取事件相关的集合
    pub fn collection(&self) -> Option<CollectionName> {
        match self {
            SyncEvent::PullFailed { collection, .. }
            | SyncEvent::ActionFlushed { collection, .. }
            | SyncEvent::FlushHalted { collection, .. } => Some(*collection),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 集合过滤器（不带集合的事件总是通过）
    pub collections: Option<Vec<CollectionName>>,
}

impl EventFilter {
    pub fn event_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_types: Some(types.into_iter().map(Into::into).collect()),
            collections: None,
        }
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let (Some(collections), Some(collection)) = (&self.collections, event.collection()) {
            if !collections.contains(&collection) {
                return false;
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间（毫秒）
    pub last_event_time: Option<i64>,
}

/// 事件管理器
///
/// `emit` 是同步的：协调器和写接口都可以在任意上下文里发事件。
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("stats", &*self.stats.read())
            .finish()
    }
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(chrono::Utc::now().timestamp_millis());
        }

        // 无订阅者时 send 会失败（比如没有 UI 的后台进程），只打 debug
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 先取出再调用，监听器里可以继续 add_listener / emit
        let matched: Vec<EventListener> = {
            let listeners = self.listeners.read();
            [event.event_type(), "*"]
                .iter()
                .filter_map(|key| listeners.get(*key))
                .flatten()
                .cloned()
                .collect()
        };
        for listener in matched {
            listener(&event);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`"*"` 监听全部事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners.entry(event_type.to_string()).or_default().push(Arc::new(listener));
        self.stats.write().listener_count = listeners.values().map(Vec::len).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
    }

    /// 获取事件统计
    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
