//! 重试策略与执行器
//!
//! 提供指数退避重试机制，用于瞬时故障（网络抖动、数据库连接池满、
//! 锁竞争超时等）的自动恢复。不可重试的错误（payload 损坏、定义缺失）
//! 由调用方通过 `is_retryable` 闭包排除，直接向上传播。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::error::RewardError;

// ---------------------------------------------------------------------------
// RetryPolicy — 重试策略配置
// ---------------------------------------------------------------------------

/// 重试策略配置
///
/// 指数退避：第 1 次重试前等 initial_backoff，之后按 multiplier
/// 倍增，直到 max_backoff 封顶。同一份策略既用于进程内的短重试
/// （入队），也用于死信队列计算下一次重投递时间。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub initial_backoff: Duration,
    /// 退避时间上限
    pub max_backoff: Duration,
    /// 每次重试的退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 默认策略：最多重试 3 次，初始等待 1 秒，上限 60 秒，倍数 2.0
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 从 Worker 配置构建策略
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            max_retries: config.max_attempts,
            initial_backoff: Duration::from_secs(config.initial_backoff_seconds),
            max_backoff: Duration::from_secs(config.max_backoff_seconds),
            multiplier: config.backoff_multiplier,
        }
    }

    /// 计算第 N 次重试前的等待时间（attempt 从 0 开始）
    ///
    /// 公式: initial_backoff * multiplier^attempt，结果不超过 max_backoff。
    /// f64 运算带来的微秒级精度损失对秒级退避完全可接受。
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64;
        let backoff_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 是否应继续重试
    ///
    /// attempt 表示已经失败的轮次（从 0 开始），
    /// 当 attempt < max_retries 时返回 true。
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// retry_with_policy — 带重试的异步执行器
// ---------------------------------------------------------------------------

/// 带重试的异步执行器
///
/// 对任意异步操作应用重试策略。仅在 `is_retryable` 判定为真时重试，
/// 其余错误直接向上传播。主要用于入队器：事件发布方已经返回，
/// 入队失败只剩这一次挽救机会。
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&RewardError) -> bool,
    mut operation: F,
) -> Result<T, RewardError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RewardError>>,
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
                if !is_retryable(&err) {
                    warn!(
                        operation = operation_name,
                        error = %err,
                        "操作失败且不可重试，直接返回错误"
                    );
                    return Err(err);
                }

                if !policy.should_retry(attempt) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = policy.max_retries,
                        error = %err,
                        "已达最大重试次数，放弃重试"
                    );
                    return Err(err);
                }

                let backoff = policy.backoff_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );

                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
