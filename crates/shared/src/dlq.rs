//! 死信队列处理
//!
//! 任务处理失败后不在原地重试，而是包上重试元数据写入死信队列。
//! 死信消费者在退避时间到达后把任务重投递回任务队列；重试预算
//! 耗尽的任务归档到 dead_jobs 表并记录错误日志，等待人工介入——
//! 任何一条消息都不会被静默丢弃。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::RewardError;
use crate::jobs::JobEnvelope;
use crate::kafka::{ConsumerMessage, KafkaConsumer, KafkaProducer, topics};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// DeadLetterJob — 死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
///
/// 包装失败任务的原始信封，附加失败原因、重试次数与下一次重投递
/// 时间，供死信消费者决定重投还是归档。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterJob {
    /// 失败任务的原始信封
    pub job: JobEnvelope,
    /// 最近一次失败原因
    pub error: String,
    /// 已重试次数（等于失败时信封上的 attempt）
    pub retry_count: u32,
    /// 最大重试次数
    pub max_retries: u32,
    /// 首次失败时间
    pub first_failed_at: DateTime<Utc>,
    /// 最近失败时间
    pub last_failed_at: DateTime<Utc>,
    /// 下次重投递时间（None 表示预算耗尽，不再重投）
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeadLetterJob {
    /// 从失败的任务信封构建死信消息
    ///
    /// retry_count 直接取信封上的 attempt：任务每次重投递都会递增
    /// attempt，因此死信链路上的计数天然连续，不依赖消费端状态。
    pub fn from_failed(job: &JobEnvelope, error: &str, policy: &RetryPolicy) -> Self {
        let now = Utc::now();
        let retry_count = job.attempt;

        let next_retry_at = if retry_count < policy.max_retries {
            let backoff = policy.backoff_for_attempt(retry_count);
            Some(now + chrono::Duration::from_std(backoff).unwrap_or_default())
        } else {
            None
        };

        Self {
            job: job.clone(),
            error: error.to_string(),
            retry_count,
            max_retries: policy.max_retries,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at,
        }
    }

    /// 构建不再重试的终态死信（不可重试错误直接归档用）
    pub fn terminal(job: &JobEnvelope, error: &str) -> Self {
        let now = Utc::now();
        Self {
            job: job.clone(),
            error: error.to_string(),
            retry_count: job.attempt,
            max_retries: job.attempt,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: None,
        }
    }

    /// 是否还有重试预算
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 重投递时间是否已到
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| now >= at)
    }
}

// ---------------------------------------------------------------------------
// DlqProducer — 将失败任务送入死信队列
// ---------------------------------------------------------------------------

/// 死信生产者
///
/// Worker 在处理器返回可重试错误后调用此组件，把任务连同失败
/// 上下文写入死信队列，而非直接丢弃。
#[derive(Clone)]
pub struct DlqProducer {
    producer: KafkaProducer,
    policy: RetryPolicy,
}

impl DlqProducer {
    pub fn new(producer: KafkaProducer, policy: RetryPolicy) -> Self {
        Self { producer, policy }
    }

    /// 将失败任务写入死信队列
    pub async fn park(&self, job: &JobEnvelope, error: &str) -> Result<(), RewardError> {
        let dead = DeadLetterJob::from_failed(job, error, &self.policy);

        self.producer
            .send_json(topics::DEAD_LETTER, &job.user_id, &dead)
            .await?;

        warn!(
            job_id = %job.job_id,
            kind = %job.kind,
            attempt = job.attempt,
            error,
            "任务已送入死信队列"
        );

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 死信归档
// ---------------------------------------------------------------------------

/// 将重试耗尽的任务归档到 dead_jobs 表
///
/// job_id 上的 ON CONFLICT 使归档幂等：死信消息被重复消费时
/// 不会产生重复归档行。
pub async fn archive_dead(pool: &PgPool, dead: &DeadLetterJob) -> Result<(), RewardError> {
    let payload = serde_json::to_value(&dead.job)
        .map_err(|e| RewardError::Serialization(format!("序列化死信任务失败: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO dead_jobs (job_id, kind, user_id, payload, error, attempts, first_failed_at, dead_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        ON CONFLICT (job_id) DO NOTHING
        "#,
    )
    .bind(&dead.job.job_id)
    .bind(dead.job.kind.as_str())
    .bind(&dead.job.user_id)
    .bind(payload)
    .bind(&dead.error)
    .bind(dead.retry_count as i32)
    .bind(dead.first_failed_at)
    .execute(pool)
    .await?;

    metrics::counter!("reward_jobs_dead_total", "kind" => dead.job.kind.as_str()).increment(1);

    error!(
        job_id = %dead.job.job_id,
        kind = %dead.job.kind,
        user_id = %dead.job.user_id,
        retry_count = dead.retry_count,
        max_retries = dead.max_retries,
        first_failed_at = %dead.first_failed_at,
        error = %dead.error,
        "任务已耗尽重试次数并归档，需人工介入"
    );

    Ok(())
}

// ---------------------------------------------------------------------------
// DlqConsumer — 死信重投递循环
// ---------------------------------------------------------------------------

/// 死信消费者
///
/// 持续消费死信队列：
/// - 尚有预算且退避时间已到 -> 信封 attempt+1 后重投回任务队列
/// - 尚有预算但时间未到 -> 原样写回死信队列尾部，等待下一轮
/// - 预算耗尽 -> 归档到 dead_jobs
pub struct DlqConsumer {
    consumer: KafkaConsumer,
    producer: KafkaProducer,
    pool: PgPool,
}

impl DlqConsumer {
    /// 创建死信消费者
    ///
    /// 使用 ".dlq" 后缀作为独立消费组，与任务消费者互不干扰。
    pub fn new(
        config: &crate::config::KafkaConfig,
        producer: KafkaProducer,
        pool: PgPool,
    ) -> Result<Self, RewardError> {
        let consumer = KafkaConsumer::new(config, Some("dlq"))?;
        consumer.subscribe(&[topics::DEAD_LETTER])?;

        info!(topic = topics::DEAD_LETTER, "死信消费者已创建");

        Ok(Self {
            consumer,
            producer,
            pool,
        })
    }

    /// 启动死信消费循环
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let producer = self.producer.clone();
        let pool = self.pool.clone();

        self.consumer
            .start(shutdown, move |msg| {
                let producer = producer.clone();
                let pool = pool.clone();
                async move { handle_dead_letter(&msg, &producer, &pool).await }
            })
            .await;

        info!("死信消费循环已退出");
    }
}

/// 处理单条死信消息
async fn handle_dead_letter(
    msg: &ConsumerMessage,
    producer: &KafkaProducer,
    pool: &PgPool,
) -> Result<(), RewardError> {
    let dead: DeadLetterJob = msg.deserialize_payload()?;

    if !dead.should_retry() {
        return archive_dead(pool, &dead).await;
    }

    let now = Utc::now();
    if dead.is_due(now) {
        let retried = dead.job.redelivered(dead.retry_count + 1);

        info!(
            job_id = %retried.job_id,
            kind = %retried.kind,
            attempt = retried.attempt,
            max_retries = dead.max_retries,
            "重投递死信任务回任务队列"
        );

        producer
            .send_json(topics::REWARD_JOBS, &retried.user_id, &retried)
            .await?;

        return Ok(());
    }

    // 重投递时间未到：原样写回死信队列尾部，等待下一轮检查
    debug!(
        job_id = %dead.job.job_id,
        next_retry_at = ?dead.next_retry_at,
        "死信任务退避时间未到，写回队列尾部"
    );
    producer
        .send_json(topics::DEAD_LETTER, &dead.job.user_id, &dead)
        .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, EventType};
    use crate::jobs::JobKind;
    use std::time::Duration;

    fn sample_job(attempt: u32) -> JobEnvelope {
        let event = EventPayload::new(
            EventType::SessionLogged,
            "user-001",
            serde_json::json!({"sessionId": "sess-1"}),
            "test",
        );
        let job = JobEnvelope::new(JobKind::CreditSessionReward, event);
        job.redelivered(attempt)
    }

    fn test_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_dead_letter_from_first_failure() {
        let job = sample_job(0);
        let dead = DeadLetterJob::from_failed(&job, "数据库超时", &test_policy(3));

        assert_eq!(dead.retry_count, 0);
        assert_eq!(dead.max_retries, 3);
        assert_eq!(dead.error, "数据库超时");
        assert!(dead.should_retry());
        // 首次失败安排了下一次重投
        assert!(dead.next_retry_at.is_some());
        assert_eq!(dead.first_failed_at, dead.last_failed_at);
    }

    #[test]
    fn test_dead_letter_exhausted_budget() {
        // attempt 已达 max_retries：不再安排重投
        let job = sample_job(3);
        let dead = DeadLetterJob::from_failed(&job, "持续失败", &test_policy(3));

        assert_eq!(dead.retry_count, 3);
        assert!(!dead.should_retry());
        assert!(dead.next_retry_at.is_none());
    }

    #[test]
    fn test_retry_chain_counts_exactly_max_attempts() {
        // 模拟一个永远失败的处理器：首次执行 + 每轮重投递，
        // 验证恰好经历 max_retries 次重试后进入归档分支
        let policy = test_policy(3);
        let mut job = sample_job(0);
        let mut retries_delivered = 0;

        loop {
            let dead = DeadLetterJob::from_failed(&job, "always fails", &policy);
            if !dead.should_retry() {
                break;
            }
            // 死信消费者重投递：attempt + 1
            job = dead.job.redelivered(dead.retry_count + 1);
            retries_delivered += 1;
        }

        assert_eq!(retries_delivered, 3);
        // 任务身份全程不变
        assert_eq!(job.attempt, 3);
    }

    #[test]
    fn test_terminal_dead_letter_never_retries() {
        let job = sample_job(1);
        let dead = DeadLetterJob::terminal(&job, "坏负载");

        assert!(!dead.should_retry());
        assert!(dead.next_retry_at.is_none());
        assert_eq!(dead.retry_count, 1);
    }

    #[test]
    fn test_is_due() {
        let job = sample_job(0);
        let dead = DeadLetterJob::from_failed(&job, "err", &test_policy(3));

        let before = dead.next_retry_at.unwrap() - chrono::Duration::milliseconds(500);
        let after = dead.next_retry_at.unwrap() + chrono::Duration::milliseconds(500);

        assert!(!dead.is_due(before));
        assert!(dead.is_due(after));

        // 预算耗尽的死信永远不到期
        let exhausted = DeadLetterJob::from_failed(&sample_job(3), "err", &test_policy(3));
        assert!(!exhausted.is_due(after));
    }

    #[test]
    fn test_dead_letter_serialization() {
        let job = sample_job(1);
        let dead = DeadLetterJob::from_failed(&job, "broker 不可达", &test_policy(5));

        let json = serde_json::to_string(&dead).unwrap();
        assert!(json.contains("retryCount"));
        assert!(json.contains("maxRetries"));
        assert!(json.contains("nextRetryAt"));

        let back: DeadLetterJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job.job_id, job.job_id);
        assert_eq!(back.retry_count, 1);
        assert_eq!(back.max_retries, 5);
    }
}
