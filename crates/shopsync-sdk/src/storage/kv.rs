//! KV 存储模块 - 基于 sled 的本地持久化
//!
//! 本模块提供：
//! - 按店铺命名空间隔离的 Tree
//! - JSON 值的读写
//! - 写操作返回前 flush 到磁盘，进程崩溃不丢失已返回的写入

use std::path::{Path, PathBuf};
use sled::{Db, Tree};
use serde::{Serialize, Deserialize};
use tracing::info;
use crate::error::{ShopSyncError, Result};

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    base_path: PathBuf,
    /// 主数据库实例
    db: Db,
    /// 当前命名空间的 Tree
    tree: Tree,
    /// 测试中让指定键的写入失败
    #[cfg(test)]
    write_faults: std::sync::Arc<parking_lot::Mutex<std::collections::HashSet<String>>>,
}

impl KvStore {
    /// 打开 KV 存储（目录不存在时自动创建）
    pub async fn open(base_path: &Path, namespace: &str) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path).await
            .map_err(|e| ShopSyncError::Storage(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个进程可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            ShopSyncError::Storage(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree_name = format!("shop_{}", namespace);
        let tree = db.open_tree(&tree_name)
            .map_err(|e| ShopSyncError::Storage(format!("打开命名空间 Tree 失败: {}", e)))?;

        info!("KV 存储已打开: {} (tree={})", kv_path.display(), tree_name);

        Ok(Self {
            base_path,
            db,
            tree,
            #[cfg(test)]
            write_faults: Default::default(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 设置键值对（flush 后返回）
    pub fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize + ?Sized,
    {
        #[cfg(test)]
        self.check_write_fault(key.as_ref())?;

        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| ShopSyncError::Serialization(format!("序列化值失败: {}", e)))?;

        self.tree.insert(key, value_bytes)
            .map_err(|e| ShopSyncError::Storage(format!("设置键值对失败: {}", e)))?;
        self.flush()
    }

    /// 获取键值对；值无法反序列化时返回 Serialization 错误，由调用方决定是否降级
    pub fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self.tree.get(key)
            .map_err(|e| ShopSyncError::Storage(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| ShopSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 写入原始字节（测试中用来模拟损坏数据）
    pub fn set_raw<K: AsRef<[u8]>>(&self, key: K, bytes: &[u8]) -> Result<()> {
        self.tree.insert(key, bytes)
            .map_err(|e| ShopSyncError::Storage(format!("设置键值对失败: {}", e)))?;
        self.flush()
    }

    /// 删除键值对
    pub fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let result = self.tree.remove(key)
            .map_err(|e| ShopSyncError::Storage(format!("删除键值对失败: {}", e)))?;
        self.flush()?;
        Ok(result.is_some())
    }

    /// 检查键是否存在
    pub fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        self.tree.contains_key(key)
            .map_err(|e| ShopSyncError::Storage(format!("检查键存在失败: {}", e)))
    }

    /// 之后对该键的 `set` 都返回 Storage 错误（所有克隆共享）
    #[cfg(test)]
    pub(crate) fn fail_writes_to(&self, key: &str) {
        self.write_faults.lock().insert(key.to_string());
    }

    #[cfg(test)]
    pub(crate) fn heal_writes(&self) {
        self.write_faults.lock().clear();
    }

    #[cfg(test)]
    fn check_write_fault(&self, key: &[u8]) -> Result<()> {
        let key = String::from_utf8_lossy(key);
        if self.write_faults.lock().contains(&*key) {
            return Err(ShopSyncError::Storage(format!("写入 {} 失败: 磁盘已满", key)));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.tree.flush()
            .map_err(|e| ShopSyncError::Storage(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    /// 关闭前整体刷盘
    pub fn flush_all(&self) -> Result<()> {
        self.db.flush()
            .map_err(|e| ShopSyncError::Storage(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 常用的键前缀常量
pub mod keys {
    /// 集合缓存前缀（collection:Products）
    pub const COLLECTION: &str = "collection:";
    /// 待同步队列
    pub const SYNC_QUEUE: &str = "sync_queue";
}
