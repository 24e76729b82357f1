//! 重试策略与执行器
//!
//! - `retry_with_policy`：异步执行器，Worker 启动时绑定远端存储使用
//! - `retry_blocking`：同步执行器，引擎在调用线程上获取会话锁时使用
//!
//! 是否重试由调用方的 `is_retryable` 闭包决定，不可重试的错误直接返回。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

/// 重试策略
///
/// 第 N 次重试前等待 `initial_delay * multiplier^N`，不超过 `max_delay`。
/// `multiplier` 为 1.0 时退化为固定间隔。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 最多重试 3 次，1 秒起步，上限 30 秒
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 测试与本地开发使用的快速策略
    pub fn fast(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// 固定间隔策略（锁竞争等短时等待）
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// 第 N 次重试前的等待时间（attempt 从 0 开始）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// attempt 为已失败的次数，小于 max_retries 时继续重试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// 失败后的下一步：返回等待时间，或 None 表示放弃
    fn next_delay<E: Display>(
        &self,
        operation: &str,
        attempt: u32,
        err: &E,
        retryable: bool,
    ) -> Option<Duration> {
        if !retryable {
            warn!(operation, error = %err, "操作失败且不可重试");
            return None;
        }
        if !self.should_retry(attempt) {
            warn!(
                operation,
                attempt,
                max_retries = self.max_retries,
                error = %err,
                "已达最大重试次数，放弃重试"
            );
            return None;
        }

        let delay = self.delay_for_attempt(attempt);
        debug!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "操作失败，退避后重试"
        );
        Some(delay)
    }
}

/// 带重试的异步执行器
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) => {
                match policy.next_delay(operation_name, attempt, &err, is_retryable(&err)) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(err),
                }
                attempt += 1;
            }
        }
    }
}

/// 带重试的同步执行器，在当前线程上休眠退避
pub fn retry_blocking<F, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                match policy.next_delay(operation_name, attempt, &err, is_retryable(&err)) {
                    Some(delay) => std::thread::sleep(delay),
                    None => return Err(err),
                }
                attempt += 1;
            }
        }
    }
}
