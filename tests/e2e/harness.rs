//! 端到端测试装配
//!
//! 用 FIFO 内存队列替换 Kafka，其余组件（事件总线、入队路由表、
//! 处理器、台账、锁）与线上同一份代码。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use reward_engine::lock::{LockConfig, LockManager};
use reward_engine::repository::MemoryStore;
use reward_engine::{FamilyRegistry, Ledger, ProgressionService, RewardService};
use reward_shared::error::RewardError;
use reward_shared::events::{EventBus, EventListener, EventPayload, EventType};
use reward_shared::jobs::{JobEnvelope, JobKind};
use reward_worker::handlers::JobHandler;
use reward_worker::{build_handlers, jobs_for_event};

/// 进程内任务队列：入队器的测试替身
///
/// 复用线上的路由表，把任务压进 FIFO 队列而不是 Kafka。
struct QueueListener {
    queue: Arc<Mutex<VecDeque<JobEnvelope>>>,
}

#[async_trait]
impl EventListener for QueueListener {
    fn name(&self) -> &'static str {
        "test-queue"
    }

    fn wants(&self, event_type: &EventType) -> bool {
        !jobs_for_event(*event_type).is_empty()
    }

    async fn on_event(&self, event: &EventPayload) -> Result<(), RewardError> {
        let mut queue = self.queue.lock().unwrap();
        for &kind in jobs_for_event(event.event_type) {
            queue.push_back(JobEnvelope::new(kind, event.clone()));
        }
        Ok(())
    }
}

/// 端到端流水线
pub struct Pipeline {
    pub store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    queue: Arc<Mutex<VecDeque<JobEnvelope>>>,
}

impl Pipeline {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(Ledger::new(store.clone(), bus.clone()));
        let lock = Arc::new(LockManager::in_memory(LockConfig::default()));
        let registry = FamilyRegistry::standard();

        let rewards = Arc::new(RewardService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ledger.clone(),
            lock,
            registry.clone(),
        ));
        let progression = Arc::new(ProgressionService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ledger,
            registry,
        ));

        let handlers = build_handlers(rewards, progression)
            .into_iter()
            .map(|h| (h.kind(), h))
            .collect();

        let pipeline = Self {
            store,
            bus,
            handlers,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        };

        pipeline
            .bus
            .subscribe(Arc::new(QueueListener {
                queue: pipeline.queue.clone(),
            }))
            .await;

        pipeline
    }

    /// 发布一个活动事件（外部领域服务的替身）
    pub async fn publish(&self, event_type: EventType, user_id: &str, data: serde_json::Value) {
        self.bus
            .publish(&EventPayload::new(event_type, user_id, data, "e2e"))
            .await;
    }

    /// 顺序消费队列直到排空
    ///
    /// 处理器内发布的级联事件会同步追加到队尾，循环自然覆盖整条级联。
    pub async fn drain(&self) {
        loop {
            let next = self.queue.lock().unwrap().pop_front();
            let Some(job) = next else { break };

            let handler = self
                .handlers
                .get(&job.kind)
                .unwrap_or_else(|| panic!("任务种类 {} 没有处理器", job.kind));

            handler.handle(&job).await.expect("任务处理失败");
        }
    }
}
