//! 网络恢复时自动触发同步

use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatusEvent};
use crate::sync::SyncCoordinator;

/// 同步调度器
///
/// 只在 离线 -> 在线 时触发一次同步；已有周期在跑时由协调器合并。
#[derive(Debug, Default)]
pub struct SyncScheduler {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动监听任务（重复启动会替换旧任务）
    pub fn start(
        &self,
        coordinator: Arc<SyncCoordinator>,
        network: &NetworkMonitor,
        events: Arc<EventManager>,
    ) {
        let receiver = network.subscribe();
        let handle = tokio::spawn(run(receiver, coordinator, events));
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
        info!("✅ 同步调度器已启动");
    }

    /// 停止监听；进行中的同步周期不受影响
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("同步调度器已停止");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    mut receiver: broadcast::Receiver<NetworkStatusEvent>,
    coordinator: Arc<SyncCoordinator>,
    events: Arc<EventManager>,
) {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                events.emit(SyncEvent::NetworkChanged {
                    old_status: event.old_status,
                    new_status: event.new_status,
                });
                if event.came_online() {
                    info!("🌐 网络恢复，触发同步");
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        coordinator.sync().await;
                    });
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("网络事件积压，跳过 {} 条", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
