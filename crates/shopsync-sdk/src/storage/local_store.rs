//! 本地集合缓存
//!
//! 每个集合在 KV 中占一个条目（`collection:<Name>`），保存有序记录列表。
//! 读失败一律降级为空集合；写失败返回 Storage 错误给调用方。

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::entities::Record;
use crate::storage::kv::{keys, KvStore};
use crate::sync::CollectionName;

/// 本地存储：集合名 → 有序记录列表
#[derive(Debug)]
pub struct LocalStore {
    kv: KvStore,
    /// 读-改-写串行化（UI 写入与同步合并可能同时发生）
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    fn key(collection: CollectionName) -> String {
        format!("{}{}", keys::COLLECTION, collection.as_str())
    }

    /// 读取集合（按插入顺序）
    pub fn get(&self, collection: CollectionName) -> Vec<Record> {
        match self.kv.get::<_, Vec<Record>>(Self::key(collection)) {
            Ok(Some(records)) => records,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("⚠️ 读取本地集合 {} 失败，按空集合处理: {}", collection, e);
                Vec::new()
            }
        }
    }

    /// 按 id 查找单条记录
    pub fn find(&self, collection: CollectionName, id: &str) -> Option<Record> {
        self.get(collection).into_iter().find(|r| r.id == id)
    }

    /// 插入或更新：已存在则原位替换，否则追加到末尾
    pub fn put(&self, collection: CollectionName, record: Record) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut records = self.get(collection);
        match records.iter().position(|r| r.id == record.id) {
            Some(index) => records[index] = record,
            None => records.push(record),
        }
        self.kv.set(Self::key(collection), &records)?;
        debug!("本地集合 {} 已写入，共 {} 条", collection, records.len());
        Ok(())
    }

    /// 删除记录，返回是否存在过
    pub fn remove(&self, collection: CollectionName, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut records = self.get(collection);
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.kv.set(Self::key(collection), &records)?;
        Ok(true)
    }

    /// 整体替换集合
    pub fn replace(&self, collection: CollectionName, records: &[Record]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.kv.set(Self::key(collection), records)
    }

    /// 在持有写锁的情况下基于当前内容计算新集合并写回
    pub(crate) fn update_with<F>(&self, collection: CollectionName, f: F) -> Result<usize>
    where
        F: FnOnce(Vec<Record>) -> Vec<Record>,
    {
        let _guard = self.write_lock.lock();
        let merged = f(self.get(collection));
        self.kv.set(Self::key(collection), &merged)?;
        Ok(merged.len())
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }
}
