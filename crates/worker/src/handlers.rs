//! 任务处理器
//!
//! 每个任务种类一个处理器，一一对应。处理器是薄适配层：
//! 解析任务携带的事件负载，调用引擎服务完成评估与发放。
//! 所有处理器都是幂等的——台账的重复发放短路保证重投递安全。
//!
//! 负载解析失败返回不可重试错误（坏消息重试多少次都不会变好），
//! 存储/锁错误原样上抛走死信退避通道。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use reward_engine::progression::AdvanceOutcome;
use reward_engine::{ProgressionService, RewardService};
use reward_shared::error::{Result, RewardError};
use reward_shared::jobs::{JobEnvelope, JobKind};

/// 任务处理器接口
///
/// `kind` 与处理器一一对应，Worker 据此路由并施加每种类的并发上限。
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn handle(&self, job: &JobEnvelope) -> Result<()>;
}

/// 解析事件负载，失败映射为不可重试错误
fn parse_payload<T: serde::de::DeserializeOwned>(job: &JobEnvelope) -> Result<T> {
    serde_json::from_value::<T>(job.event.data.clone()).map_err(|e| {
        RewardError::Serialization(format!(
            "任务 {} 的事件负载解析失败: {e}",
            job.job_id
        ))
    })
}

// ---------------------------------------------------------------------------
// 记账类处理器
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    session_id: String,
}

/// 练习完成 -> 固定奖励金
pub struct CreditSessionReward {
    rewards: Arc<RewardService>,
}

#[async_trait]
impl JobHandler for CreditSessionReward {
    fn kind(&self) -> JobKind {
        JobKind::CreditSessionReward
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        let payload: SessionPayload = parse_payload(job)?;
        self.rewards
            .credit_activity(
                &job.user_id,
                "toolkit-session",
                &format!("session:{}", payload.session_id),
                Some(&job.event),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DonationPayload {
    donation_id: String,
}

/// 捐赠完成 -> 固定奖励金
pub struct CreditDonationReward {
    rewards: Arc<RewardService>,
}

#[async_trait]
impl JobHandler for CreditDonationReward {
    fn kind(&self) -> JobKind {
        JobKind::CreditDonationReward
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        let payload: DonationPayload = parse_payload(job)?;
        self.rewards
            .credit_activity(
                &job.user_id,
                "donation",
                &format!("donation:{}", payload.donation_id),
                Some(&job.event),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionPayload {
    reaction_id: String,
}

/// 帖子获得互动 -> 社交奖励
pub struct CreditSocialReward {
    rewards: Arc<RewardService>,
}

#[async_trait]
impl JobHandler for CreditSocialReward {
    fn kind(&self) -> JobKind {
        JobKind::CreditSocialReward
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        let payload: ReactionPayload = parse_payload(job)?;
        self.rewards
            .credit_activity(
                &job.user_id,
                "post-reaction",
                &format!("reaction:{}", payload.reaction_id),
                Some(&job.event),
            )
            .await?;
        Ok(())
    }
}

/// 连续打卡天数变化 -> 复查里程碑
pub struct CreditStreakReward {
    rewards: Arc<RewardService>,
}

#[async_trait]
impl JobHandler for CreditStreakReward {
    fn kind(&self) -> JobKind {
        JobKind::CreditStreakReward
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        self.rewards
            .evaluate_streaks(&job.user_id, Some(&job.event))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StagePayload {
    tier_id: i64,
}

/// 阶段晋升 -> 阶段奖励金记账
pub struct CreditStageBonus {
    rewards: Arc<RewardService>,
}

#[async_trait]
impl JobHandler for CreditStageBonus {
    fn kind(&self) -> JobKind {
        JobKind::CreditStageBonus
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        let payload: StagePayload = parse_payload(job)?;
        self.rewards
            .credit_stage_bonus(&job.user_id, payload.tier_id, Some(&job.event))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 评估类处理器
// ---------------------------------------------------------------------------

/// 积分变动 -> 复查目标等级
pub struct EvaluateGoalLevels {
    rewards: Arc<RewardService>,
}

#[async_trait]
impl JobHandler for EvaluateGoalLevels {
    fn kind(&self) -> JobKind {
        JobKind::EvaluateGoalLevels
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        self.rewards
            .evaluate_goal_levels(&job.user_id, Some(&job.event))
            .await?;
        Ok(())
    }
}

/// 积分变动 -> 尝试推进会员等级
///
/// 一次积分跳变可能连续解锁多级，循环推进到不能再进为止
/// （循环上界是档位总数，台账唯一约束保证单向）。
pub struct EvaluateMembershipLevel {
    progression: Arc<ProgressionService>,
}

#[async_trait]
impl JobHandler for EvaluateMembershipLevel {
    fn kind(&self) -> JobKind {
        JobKind::EvaluateMembershipLevel
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        loop {
            match self
                .progression
                .advance_level(&job.user_id, Some(&job.event))
                .await?
            {
                AdvanceOutcome::Advanced { .. } => continue,
                _ => return Ok(()),
            }
        }
    }
}

/// 等级/捐赠变动 -> 尝试推进会员阶段
pub struct EvaluateMembershipStage {
    progression: Arc<ProgressionService>,
}

#[async_trait]
impl JobHandler for EvaluateMembershipStage {
    fn kind(&self) -> JobKind {
        JobKind::EvaluateMembershipStage
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        loop {
            match self
                .progression
                .advance_stage(&job.user_id, Some(&job.event))
                .await?
            {
                AdvanceOutcome::Advanced { .. } => continue,
                AdvanceOutcome::NotEligible { sequence, failing } => {
                    // 条件未满足是结构化结果而非错误：记录驱动进度展示的信息
                    info!(
                        user_id = %job.user_id,
                        sequence,
                        failing = ?failing,
                        "阶段晋升暂不满足条件"
                    );
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }
}

/// 聚合变动 -> 复查奖杯（持用户锁）
pub struct EvaluateTrophies {
    rewards: Arc<RewardService>,
}

#[async_trait]
impl JobHandler for EvaluateTrophies {
    fn kind(&self) -> JobKind {
        JobKind::EvaluateTrophies
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        self.rewards
            .evaluate_trophies(&job.user_id, Some(&job.event))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 装配
// ---------------------------------------------------------------------------

/// 构建全部处理器（每个任务种类恰好一个）
pub fn build_handlers(
    rewards: Arc<RewardService>,
    progression: Arc<ProgressionService>,
) -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(CreditSessionReward {
            rewards: rewards.clone(),
        }),
        Arc::new(CreditDonationReward {
            rewards: rewards.clone(),
        }),
        Arc::new(CreditSocialReward {
            rewards: rewards.clone(),
        }),
        Arc::new(CreditStreakReward {
            rewards: rewards.clone(),
        }),
        Arc::new(CreditStageBonus {
            rewards: rewards.clone(),
        }),
        Arc::new(EvaluateGoalLevels {
            rewards: rewards.clone(),
        }),
        Arc::new(EvaluateMembershipLevel {
            progression: progression.clone(),
        }),
        Arc::new(EvaluateMembershipStage { progression }),
        Arc::new(EvaluateTrophies { rewards }),
    ]
}
