//! 任务模型
//!
//! 定义持久化任务的信封格式与任务种类。任务是同步事件到异步奖励
//! 计算之间唯一的桥梁：入队器把事件包进 `JobEnvelope` 写入队列，
//! Worker 按种类路由到对应的处理器。
//!
//! 生命周期：enqueued -> processing -> completed | 经死信队列退避重试
//! （最多 max_attempts 次）-> dead（归档，绝不静默丢弃）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::EventPayload;

// ---------------------------------------------------------------------------
// JobKind — 任务种类
// ---------------------------------------------------------------------------

/// 任务种类枚举
///
/// 每个种类与一个处理器一一对应，并拥有独立的并发上限。
/// 新增奖励族时在此加一个种类，并在 Worker 的处理器注册表加一个条目。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    // 记账类任务 — 为单次活动发放固定奖励
    CreditSessionReward,
    CreditDonationReward,
    CreditSocialReward,
    CreditStreakReward,
    CreditStageBonus,

    // 评估类任务 — 重新评估某个奖励族的可发放档位
    EvaluateGoalLevels,
    EvaluateMembershipLevel,
    EvaluateMembershipStage,
    EvaluateTrophies,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreditSessionReward => "CREDIT_SESSION_REWARD",
            Self::CreditDonationReward => "CREDIT_DONATION_REWARD",
            Self::CreditSocialReward => "CREDIT_SOCIAL_REWARD",
            Self::CreditStreakReward => "CREDIT_STREAK_REWARD",
            Self::CreditStageBonus => "CREDIT_STAGE_BONUS",
            Self::EvaluateGoalLevels => "EVALUATE_GOAL_LEVELS",
            Self::EvaluateMembershipLevel => "EVALUATE_MEMBERSHIP_LEVEL",
            Self::EvaluateMembershipStage => "EVALUATE_MEMBERSHIP_STAGE",
            Self::EvaluateTrophies => "EVALUATE_TROPHIES",
        }
    }

    /// 全部任务种类，供 Worker 启动时逐一注册处理器
    pub fn all() -> &'static [JobKind] {
        &[
            Self::CreditSessionReward,
            Self::CreditDonationReward,
            Self::CreditSocialReward,
            Self::CreditStreakReward,
            Self::CreditStageBonus,
            Self::EvaluateGoalLevels,
            Self::EvaluateMembershipLevel,
            Self::EvaluateMembershipStage,
            Self::EvaluateTrophies,
        ]
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// JobEnvelope — 任务信封
// ---------------------------------------------------------------------------

/// 持久化任务信封
///
/// 内嵌完整的事件信封而不是裁剪后的字段，处理器因此总能拿到
/// 触发上下文（trace_id、业务 data）。`attempt` 记录该任务已被
/// 重新投递的次数，由死信重投递循环递增。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    /// 任务唯一标识（UUID v7）
    pub job_id: String,
    /// 任务种类，决定路由到哪个处理器
    pub kind: JobKind,
    /// 目标用户，冗余自事件信封，用作消息 key
    pub user_id: String,
    /// 触发该任务的事件
    pub event: EventPayload,
    /// 已重新投递次数（首次投递为 0）
    pub attempt: u32,
    /// 入队时间
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    /// 从事件构建任务
    pub fn new(kind: JobKind, event: EventPayload) -> Self {
        Self {
            job_id: Uuid::now_v7().to_string(),
            kind,
            user_id: event.user_id.clone(),
            event,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// 生成重投递副本
    ///
    /// 保留 job_id 与原始事件，只递增 attempt——同一个任务的所有
    /// 投递在日志里共享同一个 job_id，便于排查重试链路。
    pub fn redelivered(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    fn sample_event() -> EventPayload {
        EventPayload::new(
            EventType::SessionLogged,
            "user-001",
            serde_json::json!({"sessionId": "sess-1"}),
            "session-service",
        )
    }

    #[test]
    fn test_job_kind_as_str() {
        assert_eq!(JobKind::CreditSessionReward.as_str(), "CREDIT_SESSION_REWARD");
        assert_eq!(JobKind::EvaluateTrophies.as_str(), "EVALUATE_TROPHIES");
    }

    #[test]
    fn test_job_kind_all_is_exhaustive() {
        // as_str 两两不同，确保并发配置按名字索引不会撞车
        let all = JobKind::all();
        assert_eq!(all.len(), 9);
        let names: std::collections::HashSet<_> = all.iter().map(|k| k.as_str()).collect();
        assert_eq!(names.len(), all.len());
    }

    #[test]
    fn test_envelope_creation() {
        let event = sample_event();
        let job = JobEnvelope::new(JobKind::CreditSessionReward, event.clone());

        assert_eq!(job.kind, JobKind::CreditSessionReward);
        assert_eq!(job.user_id, "user-001");
        assert_eq!(job.event.event_id, event.event_id);
        assert_eq!(job.attempt, 0);
    }

    #[test]
    fn test_envelope_redelivery_keeps_identity() {
        let job = JobEnvelope::new(JobKind::EvaluateTrophies, sample_event());
        let retried = job.redelivered(2);

        assert_eq!(retried.job_id, job.job_id);
        assert_eq!(retried.event.event_id, job.event.event_id);
        assert_eq!(retried.attempt, 2);
        // 原信封不变
        assert_eq!(job.attempt, 0);
    }

    #[test]
    fn test_envelope_serialization() {
        let job = JobEnvelope::new(JobKind::CreditDonationReward, sample_event());
        let json = serde_json::to_string(&job).unwrap();

        assert!(json.contains("jobId"));
        assert!(json.contains("CREDIT_DONATION_REWARD"));
        assert!(json.contains("enqueuedAt"));

        let back: JobEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.kind, JobKind::CreditDonationReward);
    }
}
