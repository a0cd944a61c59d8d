//! 统一 SDK 接口 - ShopSyncSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! ShopSyncSDK (业务逻辑层：读接口、乐观写入、记账)
//!   ├── StorageManager (LocalStore + PendingActionQueue)
//!   ├── SyncCoordinator (拉取 / 推送状态机)
//!   │     └── RemoteStore (RemoteGateway -> RemoteTransport)
//!   ├── SyncScheduler (网络恢复时触发同步)
//!   ├── EventManager (事件系统层)
//!   └── NetworkMonitor (网络监控层)
//! ```
//!
//! UI 层持有一个 `Arc<ShopSyncSDK>`，所有写入都是同步的：先写本地，再记录待同步意图。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ShopSyncError};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SyncEvent};
use crate::gateway::{GatewayConfig, RemoteGateway, RemoteStore, DEFAULT_PAYLOAD_WARN_BYTES};
use crate::http_client::ReqwestTransport;
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
use crate::storage::queue::{RetryPolicy, TokioSleeper};
use crate::storage::{ActionKind, PendingAction, QueueStats, Record, StorageManager};
use crate::sync::{CollectionName, SyncCoordinator, SyncReport, SyncScheduler, SyncState};

/// HTTP 客户端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(30),
            // 脚本服务冷启动较慢
            request_timeout_secs: Some(60),
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
}

impl RetryConfig {
    pub fn read() -> Self {
        let policy = RetryPolicy::read();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay_ms,
        }
    }

    pub fn write() -> Self {
        let policy = RetryPolicy::write();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay_ms,
        }
    }

    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay_ms)
    }
}

/// ShopSync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopSyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 店铺命名空间（同一目录下多个店铺互不干扰）
    pub namespace: String,
    /// 表格脚本服务地址
    pub endpoint: String,
    /// 读接口重试
    pub read_retry: RetryConfig,
    /// 写接口重试
    pub write_retry: RetryConfig,
    /// HTTP 客户端配置
    pub http_client_config: HttpClientConfig,
    /// 写入数据超过该字节数时告警
    pub payload_warn_bytes: usize,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 启动时是否视为在线
    pub start_online: bool,
}

impl Default for ShopSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            namespace: "default".to_string(),
            endpoint: String::new(),
            read_retry: RetryConfig::read(),
            write_retry: RetryConfig::write(),
            http_client_config: HttpClientConfig::default(),
            payload_warn_bytes: DEFAULT_PAYLOAD_WARN_BYTES,
            event_buffer_size: 256,
            start_online: true,
        }
    }
}

impl ShopSyncConfig {
    pub fn builder() -> ShopSyncConfigBuilder {
        ShopSyncConfigBuilder::new()
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            endpoint: self.endpoint.clone(),
            read_retry: self.read_retry.to_policy(),
            write_retry: self.write_retry.to_policy(),
            payload_warn_bytes: self.payload_warn_bytes,
        }
    }
}

/// 获取默认数据目录 ~/.shopsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".shopsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".shopsync")
    } else {
        PathBuf::from("./shopsync_data")
    }
}

/// ShopSync SDK 配置构建器
#[derive(Debug, Default)]
pub struct ShopSyncConfigBuilder {
    config: ShopSyncConfig,
}

impl ShopSyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn read_retry(mut self, config: RetryConfig) -> Self {
        self.config.read_retry = config;
        self
    }

    pub fn write_retry(mut self, config: RetryConfig) -> Self {
        self.config.write_retry = config;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn payload_warn_bytes(mut self, bytes: usize) -> Self {
        self.config.payload_warn_bytes = bytes;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn start_online(mut self, online: bool) -> Self {
        self.config.start_online = online;
        self
    }

    pub fn build(self) -> ShopSyncConfig {
        self.config
    }
}

/// 记账时的顾客信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaleCustomer {
    pub name: String,
    pub phone: String,
    pub address: String,
}

/// ShopSync SDK
#[derive(Debug)]
pub struct ShopSyncSDK {
    config: ShopSyncConfig,
    storage: StorageManager,
    network: Arc<NetworkMonitor>,
    event_manager: Arc<EventManager>,
    coordinator: Arc<SyncCoordinator>,
    scheduler: SyncScheduler,
    shutting_down: AtomicBool,
}

impl ShopSyncSDK {
    /// 初始化 SDK，使用 reqwest 访问配置的脚本服务
    pub async fn initialize(config: ShopSyncConfig) -> Result<Arc<Self>> {
        info!("正在初始化 ShopSyncSDK...");
        Self::validate_config(&config)?;
        Self::validate_endpoint(&config.endpoint)?;

        let transport = Arc::new(ReqwestTransport::new(&config.http_client_config)?);
        let gateway = RemoteGateway::new(transport, Arc::new(TokioSleeper), config.gateway_config());

        Self::with_remote(config, Arc::new(gateway)).await
    }

    /// 使用宿主提供的远端实现初始化
    pub async fn with_remote(config: ShopSyncConfig, remote: Arc<dyn RemoteStore>) -> Result<Arc<Self>> {
        Self::validate_config(&config)?;

        // === 第1层：存储 ===
        let storage = StorageManager::open(&config.data_dir, &config.namespace).await?;

        // === 第2层：网络监控 ===
        let network = Arc::new(NetworkMonitor::new(NetworkStatus::from_online(config.start_online)));

        // === 第3层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第4层：同步协调器与调度器 ===
        let coordinator = Arc::new(SyncCoordinator::new(
            remote,
            storage.local_store().clone(),
            storage.queue().clone(),
            network.clone(),
            event_manager.clone(),
        ));
        let scheduler = SyncScheduler::new();
        scheduler.start(coordinator.clone(), &network, event_manager.clone());

        let sdk = Arc::new(Self {
            config,
            storage,
            network,
            event_manager,
            coordinator,
            scheduler,
            shutting_down: AtomicBool::new(false),
        });

        info!(
            "✅ ShopSyncSDK 初始化完成 (namespace={}, 待同步 {} 条)",
            sdk.config.namespace,
            sdk.pending_count()
        );
        Ok(sdk)
    }

    /// 验证配置
    fn validate_config(config: &ShopSyncConfig) -> Result<()> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(ShopSyncError::Config("数据目录不能为空".to_string()));
        }
        if config.namespace.trim().is_empty() {
            return Err(ShopSyncError::Config("命名空间不能为空".to_string()));
        }
        if config.read_retry.max_attempts == 0 || config.write_retry.max_attempts == 0 {
            return Err(ShopSyncError::Config("重试次数至少为 1".to_string()));
        }
        Ok(())
    }

    fn validate_endpoint(endpoint: &str) -> Result<()> {
        let lower = endpoint.trim().to_ascii_lowercase();
        let host = lower
            .strip_prefix("https://")
            .or_else(|| lower.strip_prefix("http://"));
        match host {
            Some(rest) if !rest.is_empty() => Ok(()),
            _ => Err(ShopSyncError::Config(format!(
                "服务地址必须以 http:// 或 https:// 开头: '{}'",
                endpoint
            ))),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ShopSyncError::ShuttingDown("SDK 正在关闭".to_string()));
        }
        Ok(())
    }

    pub fn config(&self) -> &ShopSyncConfig {
        &self.config
    }

    // ========== 读接口 ==========

    /// 读取集合（本地缓存，任何时候都可用）
    pub fn records(&self, collection: CollectionName) -> Vec<Record> {
        self.storage.local_store().get(collection)
    }

    pub fn record(&self, collection: CollectionName, id: &str) -> Option<Record> {
        self.storage.local_store().find(collection, id)
    }

    // ========== 写接口 ==========

    /// 新建记录：分配 id，写本地，入队 Create
    pub fn create_record(&self, collection: CollectionName, fields: Map<String, Value>) -> Result<Record> {
        self.ensure_running()?;
        let record = Record::with_generated_id(fields);
        {
            let _gate = self.coordinator.mutation_guard();
            self.write_atomically(&[collection], || self.create_locked(collection, record.clone()))?;
        }
        self.notify_pending();
        Ok(record)
    }

    /// 更新已有记录
    ///
    /// 若该记录的新建还没被远端确认，队列中保持 Create（携带最新快照）；
    /// 正在提交的那次 Create 确认后，队列会把它改为 Update。
    pub fn update_record(&self, collection: CollectionName, record: Record) -> Result<()> {
        self.ensure_running()?;
        {
            let _gate = self.coordinator.mutation_guard();
            self.write_atomically(&[collection], || self.update_locked(collection, record))?;
        }
        self.notify_pending();
        Ok(())
    }

    /// 删除记录
    ///
    /// 新建尚未推送的记录直接丢弃；其他情况（包括新建正在提交中）入队 Delete，
    /// 本地记录保留到远端确认为止。
    pub fn delete_record(&self, collection: CollectionName, id: &str) -> Result<()> {
        self.ensure_running()?;
        {
            let _gate = self.coordinator.mutation_guard();
            self.write_atomically(&[collection], || self.delete_locked(collection, id))?;
        }
        self.notify_pending();
        Ok(())
    }

    fn delete_locked(&self, collection: CollectionName, id: &str) -> Result<()> {
        let local = self.storage.local_store().find(collection, id);
        let pending = self.storage.queue().pending_target(collection, id);

        match (local, pending) {
            (_, Some(action))
                if action.action == ActionKind::Create && !self.coordinator.is_submitting(&action) =>
            {
                self.storage.queue().remove_target(collection, id)?;
                self.storage.local_store().remove(collection, id)?;
                info!("🗑️ {} id={} 尚未推送，直接丢弃", collection, id);
            }
            (Some(record), _) => {
                self.storage.queue().enqueue(PendingAction::delete(collection, record))?;
                info!("🗑️ {} id={} 标记删除，等待远端确认", collection, id);
            }
            (None, Some(action)) if action.action == ActionKind::Delete => {
                debug!("{} id={} 已在删除队列中", collection, id);
            }
            (None, Some(action)) => {
                self.storage.queue().enqueue(PendingAction::delete(collection, action.payload))?;
            }
            (None, None) => {
                return Err(ShopSyncError::NotFound(format!("{} id={}", collection, id)));
            }
        }
        Ok(())
    }

    /// 记一笔销售
    ///
    /// 按依赖顺序入队：顾客（填写了姓名时）→ 销售记录 → 商品库存。返回销售记录。
    pub fn record_sale(&self, product_id: &str, quantity: i64, customer: SaleCustomer) -> Result<Record> {
        self.ensure_running()?;
        if quantity < 1 {
            return Err(ShopSyncError::InvalidInput(format!("数量必须至少为 1: {}", quantity)));
        }

        let sale = {
            let _gate = self.coordinator.mutation_guard();
            let mut product = self
                .storage
                .local_store()
                .find(CollectionName::Products, product_id)
                .ok_or_else(|| ShopSyncError::NotFound(format!("Products id={}", product_id)))?;

            let stock = product.get_i64("Stock").unwrap_or(0);
            if quantity > stock {
                return Err(ShopSyncError::InvalidInput(format!(
                    "库存不足: 需要 {}，剩余 {}",
                    quantity, stock
                )));
            }

            let price = product.get_f64("Price").unwrap_or(0.0);
            let total = number_value(price * quantity as f64);
            let product_name = product.get_str("Name").unwrap_or_default().to_string();

            let touched = [CollectionName::Customers, CollectionName::Sales, CollectionName::Products];
            self.write_atomically(&touched, || {
                if !customer.name.trim().is_empty() {
                    let customer_record = Record::with_generated_id(Map::new())
                        .with_field("Name", customer.name.clone())
                        .with_field("Phone", customer.phone.clone())
                        .with_field("Address", customer.address.clone())
                        .with_field("Email", "")
                        .with_field("TotalPurchases", total.clone());
                    self.create_locked(CollectionName::Customers, customer_record)?;
                }

                let sale = Record::with_generated_id(Map::new())
                    .with_field("ProductName", product_name)
                    .with_field("Quantity", quantity)
                    .with_field("Price", number_value(price))
                    .with_field("Total", total)
                    .with_field("Customer", customer.name)
                    .with_field("Status", "Paid")
                    .with_field("InvoiceNumber", invoice_number())
                    .with_field("CustomerPhone", customer.phone)
                    .with_field("CustomerAddress", customer.address);
                self.create_locked(CollectionName::Sales, sale.clone())?;

                product.set("Stock", stock - quantity);
                self.update_locked(CollectionName::Products, product)?;
                Ok(sale)
            })?
        };

        info!(
            "🧾 记账完成: {} (product={}, qty={})",
            sale.get_str("InvoiceNumber").unwrap_or_default(),
            product_id,
            quantity
        );
        self.notify_pending();
        Ok(sale)
    }

    /// 多步本地写入：任何一步失败都把涉及的集合和队列恢复原状（调用方持有 `mutation_guard`）
    fn write_atomically<T, F>(&self, collections: &[CollectionName], write: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let local = self.storage.local_store();
        let snapshots: Vec<(CollectionName, Vec<Record>)> =
            collections.iter().map(|&collection| (collection, local.get(collection))).collect();
        let checkpoint = self.storage.queue().checkpoint();

        write().map_err(|e| {
            debug!("本地写入失败: {}", e);
            for (collection, records) in &snapshots {
                if local.get(*collection) == *records {
                    continue;
                }
                warn!("⚠️ 回滚本地集合 {}: {}", collection, e);
                if let Err(restore_err) = local.replace(*collection, records) {
                    error!("❌ 回滚本地集合 {} 失败: {}", collection, restore_err);
                }
            }
            if let Err(restore_err) = self.storage.queue().rollback(checkpoint) {
                error!("❌ 回滚待同步队列失败: {}", restore_err);
            }
            e
        })
    }

    fn create_locked(&self, collection: CollectionName, record: Record) -> Result<()> {
        self.storage.local_store().put(collection, record.clone())?;
        self.storage.queue().enqueue(PendingAction::create(collection, record))?;
        Ok(())
    }

    fn update_locked(&self, collection: CollectionName, record: Record) -> Result<()> {
        if self.storage.local_store().find(collection, &record.id).is_none() {
            return Err(ShopSyncError::NotFound(format!("{} id={}", collection, record.id)));
        }

        let kind = match self.storage.queue().pending_target(collection, &record.id) {
            Some(pending) if pending.action == ActionKind::Create => ActionKind::Create,
            _ => ActionKind::Update,
        };

        self.storage.local_store().put(collection, record.clone())?;
        self.storage.queue().enqueue(PendingAction::new(collection, kind, record))?;
        Ok(())
    }

    fn notify_pending(&self) {
        self.event_manager.emit(SyncEvent::PendingCountChanged { count: self.pending_count() });
    }

    // ========== 同步 ==========

    /// 待同步数量（UI 角标）
    pub fn pending_count(&self) -> usize {
        self.storage.queue().len()
    }

    /// 待同步变更（按入队顺序）
    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.storage.queue().dequeue_all()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.storage.queue().stats()
    }

    pub fn sync_state(&self) -> SyncState {
        self.coordinator.state()
    }

    /// 手动同步；已有周期在跑时共享其结果
    pub async fn sync(&self) -> Result<SyncReport> {
        self.ensure_running()?;
        Ok(self.coordinator.sync().await)
    }

    /// 完整重同步
    pub async fn full_resync(&self) -> Result<SyncReport> {
        self.ensure_running()?;
        Ok(self.coordinator.full_resync().await)
    }

    // ========== 事件与网络 ==========

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_manager.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.event_manager.subscribe_filtered(filter)
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// 宿主上报网络状态
    pub fn set_online(&self, online: bool) {
        self.network.set_status(NetworkStatus::from_online(online));
    }

    /// 接入平台网络监听器
    pub async fn attach_network_listener(&self, listener: Arc<dyn NetworkStatusListener>) -> Result<()> {
        self.ensure_running()?;
        self.network.start(listener).await
    }

    /// 关闭 SDK：停止调度，等待进行中的同步周期，刷盘
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("⚠️ ShopSyncSDK 已在关闭中");
            return Ok(());
        }
        info!("正在关闭 ShopSyncSDK...");

        self.scheduler.stop();
        self.network.stop().await;
        self.coordinator.wait_idle().await;
        self.storage.flush()?;

        info!("ShopSyncSDK 关闭完成");
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// 整数值按整数输出，和表格里的写法一致
fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

/// 发票号：`INV-` + 毫秒时间戳后六位
fn invoice_number() -> String {
    let millis = chrono::Utc::now().timestamp_millis().to_string();
    format!("INV-{}", &millis[millis.len().saturating_sub(6)..])
}
