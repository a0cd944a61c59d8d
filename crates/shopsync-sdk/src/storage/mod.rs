//! 存储模块 - 离线优先的本地持久化层
//!
//! 分层：
//! - KvStore: sled 键值存储，按店铺命名空间隔离
//! - LocalStore: 集合缓存（每个集合一个条目）
//! - PendingActionQueue: 待同步队列（单个条目）
//! - StorageManager: 统一打开上述组件

use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

pub mod entities;
pub mod kv;
pub mod local_store;
pub mod queue;

pub use entities::Record;
pub use kv::KvStore;
pub use local_store::LocalStore;
pub use queue::{ActionKind, PendingAction, PendingActionQueue, QueueKey, QueueStats};

/// 存储管理器
#[derive(Debug, Clone)]
pub struct StorageManager {
    kv: KvStore,
    local_store: Arc<LocalStore>,
    queue: Arc<PendingActionQueue>,
}

impl StorageManager {
    /// 打开数据目录下的存储；任何条目缺失或损坏都按空数据启动
    pub async fn open(data_dir: &Path, namespace: &str) -> Result<Self> {
        let kv = KvStore::open(data_dir, namespace).await?;
        let local_store = Arc::new(LocalStore::new(kv.clone()));
        let queue = Arc::new(PendingActionQueue::load(kv.clone()));

        info!("✅ 存储初始化完成: {} (待同步 {} 条)", data_dir.display(), queue.len());

        Ok(Self { kv, local_store, queue })
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn queue(&self) -> &Arc<PendingActionQueue> {
        &self.queue
    }

    /// 关闭前刷盘
    pub fn flush(&self) -> Result<()> {
        self.kv.flush_all()
    }
}
