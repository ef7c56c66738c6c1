//! 重试执行器 - 有上限的指数退避

use crate::error::{is_retryable, ArchiveError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// 只尝试一次
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// 第 `attempt` 次尝试（从 1 开始）失败后的等待时间
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped.round() as u64)
        } else {
            Duration::ZERO
        }
    }
}

/// 可取消的等待
pub async fn cancellable_sleep(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), ArchiveError> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(ArchiveError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(ArchiveError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// 重试执行器
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// 退避等待时响应取消信号
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 使用默认错误分类执行
    pub async fn execute<T, F, Fut>(&self, label: &str, op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with(label, is_retryable, op).await
    }

    /// 使用调用方提供的错误分类执行
    ///
    /// 最后一次失败或不可重试的错误原样返回。
    pub async fn execute_with<T, F, Fut, C>(
        &self,
        label: &str,
        classify: C,
        mut op: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        C: Fn(&anyhow::Error) -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= max_attempts || !classify(&e) {
                        error!(
                            "{} 最终失败 (第{}/{}次尝试): {:#}",
                            label, attempt, max_attempts, e
                        );
                        return Err(e);
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        "{} 失败，{}ms 后重试 ({}/{}): {:#}",
                        label,
                        delay.as_millis(),
                        attempt,
                        max_attempts,
                        e
                    );
                    cancellable_sleep(delay, &self.cancel).await?;
                    attempt += 1;
                }
            }
        }
    }
}
