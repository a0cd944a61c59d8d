use std::future::Future;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::Result;

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 基础延迟（毫秒），每次翻倍
    pub base_delay_ms: u64,
    /// 单次延迟上限（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::read()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: 30_000,
        }
    }

    /// 读接口：3 次尝试，1.5s 起步（应对脚本冷启动）
    pub fn read() -> Self {
        Self::new(3, 1500)
    }

    /// 写接口：2 次尝试，2s 起步
    pub fn write() -> Self {
        Self::new(2, 2000)
    }

    /// 第 attempt 次（从 0 开始）失败后的等待时间：base * 2^attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// 检查是否还能再试
    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

/// 退避等待的时钟抽象，测试中替换为记录型实现
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// 默认实现：tokio 定时器
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 按策略重试异步操作
///
/// `op` 收到的是从 0 开始的尝试序号。只有可重试错误（传输层失败）才会重试，
/// 最后一次失败后不再等待，直接把错误返回给调用方。
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && policy.has_attempts_left(attempt + 1) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} 第 {} 次尝试失败: {}，{}ms 后重试",
                    label,
                    attempt + 1,
                    e,
                    delay.as_millis()
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    error!("❌ {} 重试 {} 次后仍失败: {}", label, attempt + 1, e);
                }
                return Err(e);
            }
        }
    }
}
