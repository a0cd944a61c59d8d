//! ShopSync SDK - 离线优先的店铺库存同步引擎
//!
//! 远端是一个挂在表格前面的脚本服务（每个集合一个 sheet），本 SDK 在设备上缓存全部数据：
//! - 📦 本地集合缓存：商品、销售、支出、顾客，重启后依然可用
//! - 🧾 待同步队列：离线或远端不稳定时记录变更意图，同一记录只保留最后一次
//! - 🔁 有限重试：读 3 次、写 2 次，指数退避
//! - 🔄 同步协调器：拉取（待同步记录以本地为准）→ 按顺序推送，单飞执行
//! - 📡 网络监控：恢复在线时自动同步
//! - ⚙️ 事件系统：状态变化、拉取失败、推送结果、待同步数量
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use shopsync_sdk::{CollectionName, ShopSyncConfig, ShopSyncSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ShopSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .namespace("my-shop")
//!         .endpoint("https://script.example.com/macros/s/XXXX/exec")
//!         .build();
//!
//!     let sdk = ShopSyncSDK::initialize(config).await?;
//!
//!     // 读本地缓存
//!     let products = sdk.records(CollectionName::Products);
//!     println!("{} products", products.len());
//!
//!     // 乐观写入，稍后同步
//!     let mut fields = serde_json::Map::new();
//!     fields.insert("Name".into(), "Vase".into());
//!     fields.insert("Stock".into(), 5.into());
//!     sdk.create_record(CollectionName::Products, fields)?;
//!
//!     let report = sdk.sync().await?;
//!     println!("flushed {}, remaining {}", report.flushed, report.remaining);
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod events;
pub mod gateway;
pub mod http_client;
pub mod network;
pub mod sdk;
pub mod storage;
pub mod sync;

pub use error::{FailureKind, Result, ShopSyncError};
pub use events::{EventFilter, EventManager, EventStats, FilteredEventReceiver, SyncEvent};
pub use gateway::{GatewayConfig, RemoteGateway, RemoteStore, SyncResult};
pub use http_client::{RawResponse, RemoteTransport, ReqwestTransport};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use sdk::{HttpClientConfig, RetryConfig, SaleCustomer, ShopSyncConfig, ShopSyncConfigBuilder, ShopSyncSDK};
pub use storage::queue::{retry_with_backoff, RetryPolicy, Sleeper, TokioSleeper};
pub use storage::{ActionKind, KvStore, LocalStore, PendingAction, PendingActionQueue, QueueStats, Record, StorageManager};
pub use sync::{
    CollectionName, FlushFailure, PullOutcome, SyncCoordinator, SyncReport, SyncScheduler, SyncState,
};

/// SDK 版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
