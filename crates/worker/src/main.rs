//! 奖励 Worker 服务入口
//!
//! 装配顺序：配置 -> 可观测性 -> 存储 -> 引擎服务 -> 事件总线 ->
//! 任务消费循环 + 死信循环 -> 等待关闭信号。

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use reward_engine::lock::{LockConfig, LockManager};
use reward_engine::repository::{PgDefinitionStore, PgGrantStore, PgMetricSource};
use reward_engine::{FamilyRegistry, Ledger, ProgressionService, RewardService};
use reward_shared::config::AppConfig;
use reward_shared::database::Database;
use reward_shared::dlq::{DlqConsumer, DlqProducer};
use reward_shared::events::EventBus;
use reward_shared::i18n::Translator;
use reward_shared::kafka::{KafkaConsumer, KafkaProducer, topics};
use reward_shared::observability;
use reward_shared::retry::RetryPolicy;

use reward_worker::{Enqueuer, GrantAnnouncer, HandlerRegistry, JobWorker, build_handlers};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置
    let config = AppConfig::load("reward-worker").unwrap_or_else(|e| {
        eprintln!("配置加载失败，使用默认配置: {e}");
        AppConfig::default()
    });

    // 2. 初始化可观测性
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(environment = %config.environment, "reward-worker 启动中...");

    // 3. 数据库连接与迁移
    let db = Database::connect(&config.database).await?;
    db.health_check().await?;
    db.run_migrations().await?;
    let pool = db.pool().clone();
    info!("数据库已就绪");

    // 4. Redis（锁的首选后端；不可用时锁自动降级到数据库）
    let redis_client = match redis::Client::open(config.redis.url.clone()) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "Redis 客户端创建失败，用户锁将只使用数据库后备");
            None
        }
    };

    // 5. 仓储
    let grants = Arc::new(PgGrantStore::new(pool.clone()));
    let definitions = Arc::new(PgDefinitionStore::new(pool.clone()));
    let metrics_source = Arc::new(PgMetricSource::new(pool.clone()));
    info!("仓储已初始化");

    // 6. 事件总线与引擎服务
    let bus = Arc::new(EventBus::new());
    let ledger = Arc::new(Ledger::new(grants.clone(), bus.clone()));
    let lock = Arc::new(LockManager::new(
        redis_client,
        pool.clone(),
        LockConfig::default(),
    ));
    let registry = FamilyRegistry::standard();

    let rewards = Arc::new(RewardService::new(
        definitions.clone(),
        grants.clone(),
        metrics_source.clone(),
        ledger.clone(),
        lock,
        registry.clone(),
    ));
    let progression = Arc::new(ProgressionService::new(
        definitions,
        grants,
        metrics_source,
        ledger,
        registry,
    ));

    // 7. 队列生产者 + 入队器（总线上唯一的持久化监听器）
    let producer = KafkaProducer::new(&config.kafka)?;
    let retry_policy = RetryPolicy::from_worker_config(&config.worker);
    bus.subscribe(Arc::new(Enqueuer::new(
        producer.clone(),
        retry_policy.clone(),
    )))
    .await;

    // 8. 发放播报（审计日志；词表由运营侧静态导出，这里装默认词表）
    let translator = Arc::new(Translator::new(config.i18n.default_locale.clone()));
    bus.subscribe(Arc::new(GrantAnnouncer::new(
        translator,
        config.i18n.default_locale.clone(),
    )))
    .await;

    // 9. 处理器注册：每个任务种类一个处理器 + 独立并发上限
    let mut handler_registry = HandlerRegistry::new();
    for handler in build_handlers(rewards, progression) {
        let concurrency = config.worker.concurrency_for(handler.kind().as_str());
        handler_registry.register(handler, concurrency);
    }
    let handler_registry = Arc::new(handler_registry);

    // 10. 关闭信号
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 11. 任务消费循环
    let job_consumer = KafkaConsumer::new(&config.kafka, Some("jobs"))?;
    job_consumer.subscribe(&[topics::REWARD_JOBS])?;
    let dlq_producer = DlqProducer::new(producer.clone(), retry_policy);
    let worker = JobWorker::new(handler_registry, dlq_producer, pool.clone());
    let worker_handle = tokio::spawn(worker.run(job_consumer, shutdown_rx.clone()));

    // 12. 死信重投递循环
    let dlq_consumer = DlqConsumer::new(&config.kafka, producer, pool)?;
    let dlq_handle = tokio::spawn(dlq_consumer.run(shutdown_rx));

    info!("reward-worker 已启动，等待任务");

    // 13. 等待 Ctrl-C 后优雅关闭
    signal::ctrl_c().await?;
    info!("收到关闭信号，正在退出...");
    let _ = shutdown_tx.send(true);

    let _ = worker_handle.await;
    let _ = dlq_handle.await;
    db.close().await;

    info!("reward-worker 已退出");
    Ok(())
}
