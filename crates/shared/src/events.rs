//! 领域事件模型与进程内事件总线
//!
//! 定义激励引擎中所有事件的统一信封格式、事件类型分类，以及
//! 同步的进程内事件总线。总线只负责在触发调用返回前把事件分发给
//! 所有已注册的监听器；监听器唯一的持久化动作是入队一个任务，
//! 任何奖励计算都不允许发生在总线的同步路径上。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RewardError;

// ---------------------------------------------------------------------------
// EventType — 事件类型枚举
// ---------------------------------------------------------------------------

/// 事件类型枚举
///
/// 分为两大类：活动事件由外部领域服务在用户动作完成时发布；
/// 发放事件由台账在成功写入发放记录后发布，用于驱动级联任务。
/// 级联路由表保证每一跳消费的事件名与它产出的事件名不同，
/// 因此事件图在构造上就是无环的。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // 活动类事件 — 外部领域服务发布，schema 归属于它们
    SessionLogged,
    DonationMade,
    PostReacted,
    StreakExtended,

    // 发放类事件 — 台账在发放成功后发布
    BonusGranted,
    TrophyGranted,
    GoalLevelGranted,
    LevelGranted,
    StageGranted,
    StageBonusCredited,
    StreakGranted,
    SocialGranted,
}

impl EventType {
    /// 活动类事件来自引擎外部，是奖励流水线的入口
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            Self::SessionLogged | Self::DonationMade | Self::PostReacted | Self::StreakExtended
        )
    }

    /// 发放类事件由台账发布，驱动级联的后续跳
    pub fn is_granted(&self) -> bool {
        !self.is_activity()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionLogged => "SESSION_LOGGED",
            Self::DonationMade => "DONATION_MADE",
            Self::PostReacted => "POST_REACTED",
            Self::StreakExtended => "STREAK_EXTENDED",
            Self::BonusGranted => "BONUS_GRANTED",
            Self::TrophyGranted => "TROPHY_GRANTED",
            Self::GoalLevelGranted => "GOAL_LEVEL_GRANTED",
            Self::LevelGranted => "LEVEL_GRANTED",
            Self::StageGranted => "STAGE_GRANTED",
            Self::StageBonusCredited => "STAGE_BONUS_CREDITED",
            Self::StreakGranted => "STREAK_GRANTED",
            Self::SocialGranted => "SOCIAL_GRANTED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EventPayload — 通用事件信封
// ---------------------------------------------------------------------------

/// 通用事件信封
///
/// 所有进入激励引擎的事件都包装在此信封中：
/// - `event_id`（UUID v7）时间有序，适合作为消息 key 与追溯标识
/// - `data` 以 JSON 承载不同事件类型的业务数据（session_id、days 等），
///   避免为每种事件定义独立消息结构
/// - `trace_id` 串联一次活动触发的整条级联链路
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// 事件唯一标识（UUID v7）
    pub event_id: String,
    /// 事件类型
    pub event_type: EventType,
    /// 触发事件的用户 ID
    pub user_id: String,
    /// 事件发生时间
    pub timestamp: DateTime<Utc>,
    /// 事件业务数据（JSON 对象，不同事件类型携带不同字段）
    pub data: serde_json::Value,
    /// 事件来源（活动服务名或 "reward-engine"）
    pub source: String,
    /// 追踪 ID
    pub trace_id: Option<String>,
}

impl EventPayload {
    /// 构建新事件，自动生成 UUID v7 作为 event_id 并记录当前时间
    pub fn new(
        event_type: EventType,
        user_id: impl Into<String>,
        data: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            event_type,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            data,
            source: source.into(),
            trace_id: None,
        }
    }

    /// 继承上游事件的追踪上下文
    ///
    /// 级联发布时调用，使整条链路共享同一个 trace_id。
    /// 上游没有 trace_id 时退化为上游的 event_id，保证链路仍可拼接。
    pub fn caused_by(mut self, parent: &EventPayload) -> Self {
        self.trace_id = parent
            .trace_id
            .clone()
            .or_else(|| Some(parent.event_id.clone()));
        self
    }
}

// ---------------------------------------------------------------------------
// EventListener / EventBus — 进程内同步分发
// ---------------------------------------------------------------------------

/// 事件监听器
///
/// 监听器在发布方的调用栈内同步执行，因此实现必须足够轻：
/// 入队、打点、写日志。奖励计算放在任务处理器里。
#[async_trait]
pub trait EventListener: Send + Sync {
    /// 监听器名称，用于日志定位
    fn name(&self) -> &'static str;

    /// 是否关心该类型的事件
    fn wants(&self, event_type: &EventType) -> bool;

    /// 处理事件。返回错误只会被总线记录，不会传播给发布方。
    async fn on_event(&self, event: &EventPayload) -> Result<(), RewardError>;
}

/// 进程内事件总线
///
/// `publish` 同步分发：所有匹配的监听器执行完毕后才返回。
/// 监听器失败只记录日志，不中断其余监听器，也永远不会让
/// 触发事件的用户动作失败——入队后的任务才是持久化的意图记录。
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册监听器
    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) {
        let mut guard = self.listeners.write().await;
        debug!(listener = listener.name(), "事件监听器已注册");
        guard.push(listener);
    }

    /// 同步发布事件
    ///
    /// 返回成功执行的监听器数量。此方法不返回错误：
    /// 分发失败属于引擎内部问题，由日志与指标暴露。
    pub async fn publish(&self, event: &EventPayload) -> usize {
        let listeners = self.listeners.read().await;
        let mut dispatched = 0;

        for listener in listeners.iter() {
            if !listener.wants(&event.event_type) {
                continue;
            }

            match listener.on_event(event).await {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    warn!(
                        listener = listener.name(),
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        error = %e,
                        "事件监听器执行失败，不影响其余监听器与发布方"
                    );
                }
            }
        }

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            dispatched,
            "事件已分发"
        );

        dispatched
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
