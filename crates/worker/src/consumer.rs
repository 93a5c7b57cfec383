//! 任务消费与分发
//!
//! 从任务队列消费 `JobEnvelope`，按种类路由到处理器。每个任务种类
//! 持有独立的 Semaphore 并发上限：高吞吐的记账种类可以调大，
//! 带锁的评估种类保持小并发。处理器在持有许可的独立任务里执行，
//! 消费循环本身永不阻塞在业务逻辑上。
//!
//! 失败路径：
//! - 可重试错误 -> 死信队列（退避重投递，预算耗尽后归档）
//! - 不可重试错误 -> 直接归档（坏消息重试不会变好）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;
use tokio::sync::{Semaphore, watch};
use tracing::{error, info, warn};

use reward_shared::dlq::{DeadLetterJob, DlqProducer, archive_dead};
use reward_shared::error::RewardError;
use reward_shared::jobs::{JobEnvelope, JobKind};
use reward_shared::kafka::{ConsumerMessage, KafkaConsumer};

use crate::handlers::JobHandler;

// ---------------------------------------------------------------------------
// HandlerRegistry — 任务种类到处理器的注册表
// ---------------------------------------------------------------------------

struct HandlerEntry {
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
}

/// 处理器注册表
///
/// 每个任务种类注册一个处理器和它的并发上限。
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<JobKind, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器
    pub fn register(&mut self, handler: Arc<dyn JobHandler>, concurrency: usize) {
        let kind = handler.kind();
        info!(kind = %kind, concurrency, "任务处理器已注册");
        self.entries.insert(
            kind,
            HandlerEntry {
                handler,
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// JobWorker — 消费循环
// ---------------------------------------------------------------------------

/// 任务 Worker
pub struct JobWorker {
    registry: Arc<HandlerRegistry>,
    dlq: DlqProducer,
    pool: PgPool,
}

impl JobWorker {
    pub fn new(registry: Arc<HandlerRegistry>, dlq: DlqProducer, pool: PgPool) -> Self {
        Self {
            registry,
            dlq,
            pool,
        }
    }

    /// 启动消费循环，直到收到关闭信号
    ///
    /// 队列承诺 at-least-once：消费偏移自动提交，进程崩溃造成的
    /// 重复投递由处理器幂等性（台账短路）消化。
    pub async fn run(self, consumer: KafkaConsumer, shutdown: watch::Receiver<bool>) {
        let registry = self.registry.clone();
        let dlq = self.dlq.clone();
        let pool = self.pool.clone();

        consumer
            .start(shutdown, move |msg| {
                let registry = registry.clone();
                let dlq = dlq.clone();
                let pool = pool.clone();
                async move { dispatch(&registry, &dlq, &pool, &msg).await }
            })
            .await;

        info!("任务 Worker 已停止");
    }
}

/// 路由单条消息
///
/// 获取该种类的并发许可后在独立任务里执行处理器；
/// 许可在任务结束时随 drop 归还。
async fn dispatch(
    registry: &HandlerRegistry,
    dlq: &DlqProducer,
    pool: &PgPool,
    msg: &ConsumerMessage,
) -> Result<(), RewardError> {
    let envelope: JobEnvelope = msg.deserialize_payload().map_err(|e| {
        // 信封本身不可解析：无法归档成结构化死信，日志就是它的遗言
        error!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            error = %e,
            "任务信封反序列化失败，消息被跳过"
        );
        e
    })?;

    let Some(entry) = registry.entries.get(&envelope.kind) else {
        warn!(
            job_id = %envelope.job_id,
            kind = %envelope.kind,
            "没有注册该任务种类的处理器，消息被跳过"
        );
        return Ok(());
    };

    let permit = entry
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| RewardError::Internal(format!("并发许可获取失败: {e}")))?;

    let handler = entry.handler.clone();
    let dlq = dlq.clone();
    let pool = pool.clone();

    tokio::spawn(async move {
        let _permit = permit;
        process_job(handler, envelope, dlq, pool).await;
    });

    Ok(())
}

/// 执行单个任务并处理失败路径
async fn process_job(
    handler: Arc<dyn JobHandler>,
    envelope: JobEnvelope,
    dlq: DlqProducer,
    pool: PgPool,
) {
    let kind = envelope.kind;
    let start = Instant::now();

    let result = handler.handle(&envelope).await;

    metrics::histogram!("reward_job_duration_seconds", "kind" => kind.as_str())
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            metrics::counter!("reward_jobs_processed_total", "kind" => kind.as_str())
                .increment(1);
        }
        Err(e) if e.is_retryable() => {
            metrics::counter!("reward_jobs_failed_total", "kind" => kind.as_str()).increment(1);
            warn!(
                job_id = %envelope.job_id,
                kind = %kind,
                attempt = envelope.attempt,
                error = %e,
                "任务处理失败，送入死信队列等待重投递"
            );

            if let Err(park_err) = dlq.park(&envelope, &e.to_string()).await {
                // 连死信队列都写不进：只剩日志这一条出路
                error!(
                    job_id = %envelope.job_id,
                    kind = %kind,
                    error = %park_err,
                    "任务写入死信队列失败"
                );
            }
        }
        Err(e) => {
            metrics::counter!("reward_jobs_failed_total", "kind" => kind.as_str()).increment(1);
            error!(
                job_id = %envelope.job_id,
                kind = %kind,
                error = %e,
                "任务处理失败且不可重试，直接归档"
            );

            let dead = DeadLetterJob::terminal(&envelope, &e.to_string());
            if let Err(archive_err) = archive_dead(&pool, &dead).await {
                error!(
                    job_id = %envelope.job_id,
                    error = %archive_err,
                    "死信归档失败"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reward_shared::error::Result;
    use reward_shared::events::{EventPayload, EventType};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// 可配置并发观测的测试处理器
    struct ProbeHandler {
        kind: JobKind,
        in_flight: Arc<AtomicU32>,
        max_in_flight: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for ProbeHandler {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn handle(&self, _job: &JobEnvelope) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_envelope(kind: JobKind) -> JobEnvelope {
        let event = EventPayload::new(
            EventType::SessionLogged,
            "user-001",
            serde_json::json!({"sessionId": "s-1"}),
            "test",
        );
        JobEnvelope::new(kind, event)
    }

    #[test]
    fn test_registry_registration() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(
            Arc::new(ProbeHandler {
                kind: JobKind::EvaluateTrophies,
                in_flight: Arc::new(AtomicU32::new(0)),
                max_in_flight: Arc::new(AtomicU32::new(0)),
            }),
            4,
        );

        assert_eq!(registry.len(), 1);
        assert!(registry.entries.contains_key(&JobKind::EvaluateTrophies));
    }

    #[tokio::test]
    async fn test_per_kind_concurrency_bound() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_in_flight = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register(
            Arc::new(ProbeHandler {
                kind: JobKind::CreditSessionReward,
                in_flight: in_flight.clone(),
                max_in_flight: max_in_flight.clone(),
            }),
            2,
        );

        // 直接用注册表里的许可与处理器模拟 8 条并发投递
        let entry = registry.entries.get(&JobKind::CreditSessionReward).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let permit = entry.permits.clone().acquire_owned().await.unwrap();
            let handler = entry.handler.clone();
            let envelope = sample_envelope(JobKind::CreditSessionReward);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                handler.handle(&envelope).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 并发上限 2 从未被突破
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_concurrency_floor_is_one() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            Arc::new(ProbeHandler {
                kind: JobKind::EvaluateTrophies,
                in_flight: Arc::new(AtomicU32::new(0)),
                max_in_flight: Arc::new(AtomicU32::new(0)),
            }),
            0,
        );

        let entry = registry.entries.get(&JobKind::EvaluateTrophies).unwrap();
        // 配置为 0 时至少保留 1 个许可，该种类不会饿死
        assert_eq!(entry.permits.available_permits(), 1);
    }
}
