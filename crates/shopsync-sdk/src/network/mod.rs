use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
}

impl NetworkStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == NetworkStatus::Online
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 是否为 离线 -> 在线
    pub fn came_online(&self) -> bool {
        self.old_status == NetworkStatus::Offline && self.new_status == NetworkStatus::Online
    }
}

/// 网络状态监听器trait（由平台层实现，如 Android/iOS/浏览器壳）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
///
/// 状态来源有两个：平台监听器推送的事件，以及宿主直接调用 `set_status`。
/// 只有状态真正变化时才广播。
#[derive(Debug)]
pub struct NetworkMonitor {
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    listener: Mutex<Option<Arc<dyn NetworkStatusListener>>>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            status_sender,
            current_status: Arc::new(RwLock::new(initial)),
            listener: Mutex::new(None),
            listen_task: Mutex::new(None),
        }
    }

    /// 接入平台监听器并启动转发任务
    pub async fn start(&self, listener: Arc<dyn NetworkStatusListener>) -> Result<()> {
        let initial = listener.get_current_status().await;
        self.set_status(initial);

        let mut receiver = listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        apply_status(&current_status, &status_sender, event.new_status);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("网络事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("网络监听任务结束");
        });

        *self.listener.lock() = Some(listener);
        if let Some(previous) = self.listen_task.lock().replace(handle) {
            previous.abort();
        }

        info!("✅ 网络监控已启动，当前状态: {:?}", self.get_status());
        Ok(())
    }

    /// 停止平台监听
    pub async fn stop(&self) {
        if let Some(handle) = self.listen_task.lock().take() {
            handle.abort();
        }
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop_monitoring().await;
        }
    }

    /// 获取当前网络状态
    pub fn get_status(&self) -> NetworkStatus {
        *self.current_status.read()
    }

    /// 手动设置网络状态（宿主层上报 online/offline）
    ///
    /// 返回状态是否发生了变化。
    pub fn set_status(&self, new_status: NetworkStatus) -> bool {
        apply_status(&self.current_status, &self.status_sender, new_status)
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.get_status().is_online()
    }
}

fn apply_status(
    current: &RwLock<NetworkStatus>,
    sender: &broadcast::Sender<NetworkStatusEvent>,
    new_status: NetworkStatus,
) -> bool {
    let old_status = {
        let mut status = current.write();
        let old = *status;
        *status = new_status;
        old
    };

    if old_status == new_status {
        return false;
    }

    info!("🌐 网络状态变化: {:?} -> {:?}", old_status, new_status);
    let event = NetworkStatusEvent {
        old_status,
        new_status,
        timestamp: chrono::Utc::now().timestamp_millis(),
    };
    // 没有订阅者时发送失败，忽略
    let _ = sender.send(event);
    true
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// 测试用：可手动推送状态的网络状态监听器
    #[derive(Debug)]
    pub struct DummyNetworkStatusListener {
        status: RwLock<NetworkStatus>,
        sender: RwLock<Option<broadcast::Sender<NetworkStatusEvent>>>,
    }

    impl Default for DummyNetworkStatusListener {
        fn default() -> Self {
            Self {
                status: RwLock::new(NetworkStatus::Online),
                sender: RwLock::new(None),
            }
        }
    }

    impl DummyNetworkStatusListener {
        pub fn push(&self, new_status: NetworkStatus) {
            let old_status = std::mem::replace(&mut *self.status.write(), new_status);
            if let Some(sender) = self.sender.read().as_ref() {
                let _ = sender.send(NetworkStatusEvent {
                    old_status,
                    new_status,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
        }
    }

    #[async_trait]
    impl NetworkStatusListener for DummyNetworkStatusListener {
        async fn get_current_status(&self) -> NetworkStatus {
            *self.status.read()
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
            let (tx, rx) = broadcast::channel(16);
            *self.sender.write() = Some(tx);
            Ok(rx)
        }

        async fn stop_monitoring(&self) {
            *self.sender.write() = None;
        }
    }
}

#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;
