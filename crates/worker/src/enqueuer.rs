//! 入队器 — 同步事件到异步任务的唯一桥梁
//!
//! 作为事件总线上唯一做持久化动作的监听器，把每个事件按静态路由表
//! 转换成一个或多个任务信封写入任务队列。入队失败带短重试并记录
//! 日志与指标，永远不会让触发事件的用户动作失败——入队成功的任务
//! 才是持久化的意图记录。
//!
//! 路由表同时定义了级联图：每一跳消费的事件名与它产出的事件名
//! 不同，图在构造上无环（见 `jobs_for_event` / `produced_events`
//! 与配套测试）。

use async_trait::async_trait;
use tracing::{debug, error};

use reward_shared::error::RewardError;
use reward_shared::events::{EventListener, EventPayload, EventType};
use reward_shared::jobs::{JobEnvelope, JobKind};
use reward_shared::kafka::{KafkaProducer, topics};
use reward_shared::retry::{RetryPolicy, retry_with_policy};

/// 事件 -> 任务种类 的静态路由表
///
/// 新增级联跳时同步维护 `produced_events`，无环测试会兜底。
pub fn jobs_for_event(event_type: EventType) -> &'static [JobKind] {
    match event_type {
        // 活动事件：记账 +（捐赠）阶段复查
        EventType::SessionLogged => &[JobKind::CreditSessionReward],
        EventType::DonationMade => &[
            JobKind::CreditDonationReward,
            JobKind::EvaluateMembershipStage,
        ],
        EventType::PostReacted => &[JobKind::CreditSocialReward],
        EventType::StreakExtended => &[JobKind::CreditStreakReward],

        // 发放事件：积分入账驱动目标等级与会员等级复查
        EventType::BonusGranted => &[
            JobKind::EvaluateGoalLevels,
            JobKind::EvaluateMembershipLevel,
        ],
        EventType::GoalLevelGranted => &[JobKind::EvaluateTrophies],
        EventType::LevelGranted => &[JobKind::EvaluateMembershipStage],
        // 阶段晋升：阶段自身的奖励金记账 + 依赖阶段数的奖杯复查
        EventType::StageGranted => &[JobKind::CreditStageBonus, JobKind::EvaluateTrophies],
        EventType::StreakGranted => &[JobKind::EvaluateTrophies],
        EventType::SocialGranted => &[JobKind::EvaluateTrophies],

        // 终点事件：不再派生任务
        EventType::StageBonusCredited | EventType::TrophyGranted => &[],
    }
}

/// 任务种类 -> 它的处理器可能发布的事件
///
/// 与各处理器的实际发放路径一一对应，只用于级联图的无环校验。
pub fn produced_events(kind: JobKind) -> &'static [EventType] {
    match kind {
        JobKind::CreditSessionReward | JobKind::CreditDonationReward => {
            &[EventType::BonusGranted]
        }
        JobKind::CreditSocialReward => &[EventType::SocialGranted],
        JobKind::CreditStreakReward => &[EventType::StreakGranted],
        JobKind::CreditStageBonus => &[EventType::StageBonusCredited],
        JobKind::EvaluateGoalLevels => &[EventType::GoalLevelGranted],
        JobKind::EvaluateMembershipLevel => &[EventType::LevelGranted],
        JobKind::EvaluateMembershipStage => &[EventType::StageGranted],
        JobKind::EvaluateTrophies => &[EventType::TrophyGranted],
    }
}

/// 入队器
pub struct Enqueuer {
    producer: KafkaProducer,
    policy: RetryPolicy,
}

impl Enqueuer {
    pub fn new(producer: KafkaProducer, policy: RetryPolicy) -> Self {
        Self { producer, policy }
    }
}

#[async_trait]
impl EventListener for Enqueuer {
    fn name(&self) -> &'static str {
        "enqueuer"
    }

    fn wants(&self, event_type: &EventType) -> bool {
        !jobs_for_event(*event_type).is_empty()
    }

    async fn on_event(&self, event: &EventPayload) -> Result<(), RewardError> {
        for &kind in jobs_for_event(event.event_type) {
            let envelope = JobEnvelope::new(kind, event.clone());

            let result = retry_with_policy(
                &self.policy,
                "enqueue_job",
                |e| e.is_retryable(),
                || {
                    self.producer
                        .send_json(topics::REWARD_JOBS, &envelope.user_id, &envelope)
                },
            )
            .await;

            match result {
                Ok(_) => {
                    metrics::counter!("reward_events_enqueued_total", "kind" => kind.as_str())
                        .increment(1);
                    debug!(
                        job_id = %envelope.job_id,
                        kind = %kind,
                        event_id = %event.event_id,
                        "任务已入队"
                    );
                }
                Err(e) => {
                    // 入队失败不向发布方传播：用户动作已经成功，
                    // 这里只能靠日志与指标暴露丢失的意图
                    error!(
                        kind = %kind,
                        event_id = %event.event_id,
                        user_id = %event.user_id,
                        error = %e,
                        "任务入队失败，重试已耗尽"
                    );
                }
            }
        }

        Ok(())
    }
}
