//! 重试策略
//!
//! 有上限的指数退避。消费端用它决定消息是否重投；
//! 归档前从对象存储下载影像时用 `retry_with_backoff` 就地重试。

use pacs_core::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大投递次数（含首次）
    pub max_attempts: u32,
    /// 首次重试前的等待时间
    pub initial_backoff: Duration,
    /// 单次等待上限
    pub max_backoff: Duration,
    /// 退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 不重试：失败即进入死信
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// 已失败 `failed_attempts` 次后是否还能再试
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// 第 `retry` 次重试（从1开始）前的等待时间
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let delay_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// 对瞬时错误按策略重试异步操作
///
/// 非瞬时错误立即返回；重试用尽时返回最后一次的错误。
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && policy.allows_retry(attempt) => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// 为异步操作加超时，超时视为瞬时错误
pub async fn with_timeout<T, Fut>(timeout: Duration, operation_name: &str, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(PacsError::Timeout(format!(
            "{} exceeded {} ms",
            operation_name,
            timeout.as_millis()
        ))),
    }
}
