use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::entities::Record;
use crate::sync::CollectionName;

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    /// 写接口的 action 参数（小写）
    pub fn wire_name(self) -> &'static str {
        match self {
            ActionKind::Create => "add",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Create => "Create",
            ActionKind::Update => "Update",
            ActionKind::Delete => "Delete",
        };
        f.write_str(s)
    }
}

/// 队列去重键：同一 (集合, 记录 id) 只保留一个待发送意图
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub collection: CollectionName,
    pub id: String,
}

/// 待同步的变更意图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// 目标记录 id
    pub id: String,
    pub action: ActionKind,
    pub collection: CollectionName,
    /// 入队时的记录快照
    pub payload: Record,
    /// 入队时间戳（毫秒）
    pub enqueued_at: i64,
    /// 本次意图的唯一标识；刷出确认时用于判断队列里是否仍是同一个意图
    #[serde(default = "new_action_id")]
    pub action_id: String,
}

fn new_action_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl PendingAction {
    pub fn new(collection: CollectionName, action: ActionKind, payload: Record) -> Self {
        Self {
            id: payload.id.clone(),
            action,
            collection,
            payload,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            action_id: new_action_id(),
        }
    }

    pub fn create(collection: CollectionName, payload: Record) -> Self {
        Self::new(collection, ActionKind::Create, payload)
    }

    pub fn update(collection: CollectionName, payload: Record) -> Self {
        Self::new(collection, ActionKind::Update, payload)
    }

    pub fn delete(collection: CollectionName, payload: Record) -> Self {
        Self::new(collection, ActionKind::Delete, payload)
    }

    pub fn key(&self) -> QueueKey {
        QueueKey {
            collection: self.collection,
            id: self.id.clone(),
        }
    }
}

impl fmt::Display for PendingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, id={})", self.action, self.collection, self.id)
    }
}
