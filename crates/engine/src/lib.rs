//! 奖励发放引擎
//!
//! 健康应用的激励子系统核心：响应各类活动事件，为用户发放奖杯、
//! 奖励金、会员等级/阶段、目标等级与连续打卡奖励，保证每个奖励
//! 恰好发放一次，且发放过程永不阻塞触发它的用户动作。
//!
//! 分层（自下而上）：
//! - `repository` — 台账、积分余额、成就定义、累计指标的存取抽象
//! - `evaluator` — 纯函数的累计阈值资格评估
//! - `ledger` — 幂等发放台账（单一事实来源）
//! - `lock` — 按用户串行化"评估-发放"的建议锁
//! - `progression` — 会员等级/阶段的有序状态机
//! - `rewards` — 各奖励族的"评估 + 发放"编排
//! - `registry` — 奖励族注册表（族 -> 发放事件/指标的查找表）

pub mod evaluator;
pub mod ledger;
pub mod lock;
pub mod models;
pub mod progression;
pub mod registry;
pub mod repository;
pub mod rewards;

pub use evaluator::{claimable_tiers, progress_percent};
pub use ledger::{GrantRequest, Ledger};
pub use lock::{LockConfig, LockManager, user_lock_key};
pub use models::{
    AchievementDefinition, GrantOutcome, GrantRecord, MetricKind, NewGrant, ProgressionTier,
    RewardFamily,
};
pub use progression::{AdvanceOutcome, ProgressionService, StagePredicate, current_sequence};
pub use registry::FamilyRegistry;
pub use rewards::RewardService;
