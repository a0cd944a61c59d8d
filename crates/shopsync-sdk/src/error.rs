use serde::{Deserialize, Serialize};

/// SDK 统一错误类型
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShopSyncError {
    /// 传输层失败（无响应、超时、非 2xx 状态码）
    #[error("Network error: {0}")]
    Network(String),

    /// 传输成功但响应不可信（HTML 错误页、非 JSON、status=error）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 本地持久化读写失败
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

/// 失败分类（Sync Result、拉取失败与推送中止事件中的 kind）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Network,
    Protocol,
    /// 本地读写或序列化失败，远端结果本身没有问题
    Storage,
}

impl ShopSyncError {
    /// 判断是否值得重试：只有传输层失败可重试，协议层失败是确定性的
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShopSyncError::Network(_))
    }

    /// 错误对应的失败分类；其余本地错误归入 Protocol（请求未被远端接受）
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ShopSyncError::Network(_) => FailureKind::Network,
            ShopSyncError::Storage(_) | ShopSyncError::Serialization(_) => FailureKind::Storage,
            _ => FailureKind::Protocol,
        }
    }
}

impl From<sled::Error> for ShopSyncError {
    fn from(error: sled::Error) -> Self {
        ShopSyncError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for ShopSyncError {
    fn from(error: serde_json::Error) -> Self {
        ShopSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for ShopSyncError {
    fn from(error: std::io::Error) -> Self {
        ShopSyncError::Storage(error.to_string())
    }
}

impl From<reqwest::Error> for ShopSyncError {
    fn from(error: reqwest::Error) -> Self {
        ShopSyncError::Network(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShopSyncError>;
