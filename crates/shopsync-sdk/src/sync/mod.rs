//! 同步模块
//!
//! 职责：
//! - 拉取远端集合并与本地缓存合并（待同步记录以本地为准）
//! - 按入队顺序回放待同步队列
//! - 单飞：同一时刻只有一个同步周期
//! - 网络恢复时自动触发同步

pub mod collection;
pub mod coordinator;
pub mod scheduler;

pub use collection::CollectionName;
pub use coordinator::SyncCoordinator;
pub use scheduler::SyncScheduler;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::storage::ActionKind;

/// 同步状态：`Idle -> Pulling -> Flushing -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncState {
    /// 空闲
    #[default]
    Idle,
    /// 正在拉取远端数据
    Pulling,
    /// 正在推送待同步队列
    Flushing,
}

/// 单个集合的拉取结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PullOutcome {
    /// 本地集合已按远端结果替换
    Replaced {
        collection: CollectionName,
        /// 合并后的记录数
        records: usize,
    },
    /// 拉取失败，本地集合未动
    Failed {
        collection: CollectionName,
        kind: FailureKind,
        message: String,
    },
}

impl PullOutcome {
    pub fn collection(&self) -> CollectionName {
        match self {
            PullOutcome::Replaced { collection, .. } | PullOutcome::Failed { collection, .. } => *collection,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PullOutcome::Replaced { .. })
    }
}

/// 中止推送的那条变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushFailure {
    pub collection: CollectionName,
    pub id: String,
    pub action: ActionKind,
    pub kind: FailureKind,
    pub message: String,
}

/// 一个同步周期的汇总
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: i64,
    pub finished_at: i64,
    /// 离线，整个周期被跳过
    pub skipped_offline: bool,
    pub pulls: Vec<PullOutcome>,
    /// 本轮确认的变更数
    pub flushed: usize,
    pub halted: Option<FlushFailure>,
    /// 周期结束时队列剩余数量
    pub remaining: usize,
}

impl SyncReport {
    pub(crate) fn skipped(started_at: i64, remaining: usize) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            skipped_offline: true,
            remaining,
            ..Default::default()
        }
    }

    /// 推送是否跑完（没有被失败中止）
    pub fn fully_flushed(&self) -> bool {
        !self.skipped_offline && self.halted.is_none()
    }

    pub fn pull_failures(&self) -> impl Iterator<Item = &PullOutcome> {
        self.pulls.iter().filter(|p| !p.is_success())
    }

    /// 拉取全部成功、推送跑完且队列已清空
    pub fn is_clean(&self) -> bool {
        self.fully_flushed() && self.pull_failures().next().is_none() && self.remaining == 0
    }
}
