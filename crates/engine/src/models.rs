//! 奖励引擎领域模型
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化。
//! 成就定义与进度档位由运营后台维护，对本引擎只读；
//! 发放记录只增不改，是整个引擎唯一的事实来源。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RewardFamily — 奖励族
// ---------------------------------------------------------------------------

/// 奖励族
///
/// 封闭的标签联合：每个族在 `FamilyRegistry` 注册一次，
/// 映射到它的发放事件与评估方式。新增族只需加一个变体和一条注册，
/// 不允许在业务代码里按族写分支链。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum RewardFamily {
    /// 奖杯 — 基于累计指标的成就，评估需要聚合再读，发放前后持用户锁
    Trophy,
    /// 奖励金 — 单次活动的固定积分奖励
    Bonus,
    /// 会员等级 — 有序进度族，按积分推进
    Level,
    /// 会员阶段 — 有序进度族，多谓词门控（积分/捐赠/账龄/等级前置）
    Stage,
    /// 目标等级 — 按积分余额解锁的目标档位
    GoalLevel,
    /// 连续打卡 — 按连续天数里程碑发放
    Streak,
    /// 社交互动 — 帖子被互动等社交行为的奖励
    SocialAction,
}

impl RewardFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trophy => "trophy",
            Self::Bonus => "bonus",
            Self::Level => "level",
            Self::Stage => "stage",
            Self::GoalLevel => "goal_level",
            Self::Streak => "streak",
            Self::SocialAction => "social_action",
        }
    }
}

impl std::fmt::Display for RewardFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MetricKind — 累计指标类型
// ---------------------------------------------------------------------------

/// 累计指标类型
///
/// 派生的用户维度数值（计数/求和），不冗余存储——
/// 唯一的例外是积分余额，它作为热点聚合在存储层原地累加。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum MetricKind {
    /// 积分余额（唯一原地累加的聚合）
    PointsBalance,
    /// 已完成的练习次数
    SessionCount,
    /// 捐赠次数
    DonationCount,
    /// 帖子获得的互动次数
    ReactionCount,
    /// 已获得的会员阶段数
    StageCount,
    /// 当前连续打卡天数
    StreakLength,
    /// 账号注册至今的月数
    AccountAgeMonths,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PointsBalance => "points_balance",
            Self::SessionCount => "session_count",
            Self::DonationCount => "donation_count",
            Self::ReactionCount => "reaction_count",
            Self::StageCount => "stage_count",
            Self::StreakLength => "streak_length",
            Self::AccountAgeMonths => "account_age_months",
        }
    }
}

// ---------------------------------------------------------------------------
// AchievementDefinition — 成就定义
// ---------------------------------------------------------------------------

/// 成就定义
///
/// 运营后台维护的只读参考数据。`code` 是稳定的业务标识
/// （如 "toolkit-session"），记账类任务按 code 查找单次活动的
/// 奖励定义；评估类任务按族批量拉取。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AchievementDefinition {
    pub id: i64,
    pub code: String,
    pub family: RewardFamily,
    /// 资格评估所依据的指标
    pub metric: MetricKind,
    /// 解锁阈值（族内按累计阈值语义解释）
    pub threshold: i64,
    /// 发放时记入积分余额的数额
    pub award_points: i64,
    /// 展示文案的本地化 key
    pub title_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AchievementDefinition {
    /// 便捷构造（测试与种子数据用；线上数据来自运营后台）
    pub fn new(
        id: i64,
        code: impl Into<String>,
        family: RewardFamily,
        metric: MetricKind,
        threshold: i64,
        award_points: i64,
    ) -> Self {
        let code = code.into();
        let now = Utc::now();
        Self {
            title_key: format!("{}.{}.title", family.as_str(), code),
            id,
            code,
            family,
            metric,
            threshold,
            award_points,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressionTier — 进度档位
// ---------------------------------------------------------------------------

/// 进度档位
///
/// 属于有序的进度族（等级/阶段），按 `sequence` 排列。
/// 用户的当前档位永远不落库——它是该族发放记录中最大 sequence
/// 的查询期推导值。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProgressionTier {
    pub id: i64,
    pub family: RewardFamily,
    /// 族内序号，从 1 开始，推进不可跳级
    pub sequence: i32,
    /// 积分阈值（族内累计）
    pub threshold: i64,
    /// 阶段要求的捐赠次数（等级档位为 0）
    pub required_donations: i64,
    /// 阶段要求的账龄月数（等级档位为 0）
    pub required_months: i64,
    /// 发放时记入的数额；阶段的奖励金由级联任务单独记账
    pub award_points: i64,
    pub title_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressionTier {
    /// 便捷构造（测试与种子数据用）
    pub fn new(id: i64, family: RewardFamily, sequence: i32, threshold: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            family,
            sequence,
            threshold,
            required_donations: 0,
            required_months: 0,
            award_points: 0,
            title_key: format!("{}.{sequence}.title", family.as_str()),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_requirements(mut self, donations: i64, months: i64) -> Self {
        self.required_donations = donations;
        self.required_months = months;
        self
    }

    pub fn with_award(mut self, points: i64) -> Self {
        self.award_points = points;
        self
    }
}

// ---------------------------------------------------------------------------
// GrantRecord — 发放记录
// ---------------------------------------------------------------------------

/// 发放记录
///
/// 台账行：一个用户、一个奖励族、一个业务引用恰好对应一行。
/// (user_id, family, reference) 上的唯一约束是幂等性的最终防线；
/// 记录创建后不更新、不删除。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GrantRecord {
    pub id: i64,
    pub user_id: String,
    pub family: RewardFamily,
    /// 族内自然键：成就/档位 id、"session:{id}" 之类的活动引用
    pub reference: String,
    /// 发放时记入积分余额的数额
    pub magnitude: i64,
    pub granted_at: DateTime<Utc>,
}

/// 待写入的发放记录
#[derive(Debug, Clone)]
pub struct NewGrant {
    pub user_id: String,
    pub family: RewardFamily,
    pub reference: String,
    pub magnitude: i64,
}

/// 存储层写入结果
///
/// `Conflict` 表示唯一约束拦下了并发的重复写入——
/// 对台账而言这不是错误，而是幂等契约在起作用。
#[derive(Debug)]
pub enum GrantInsert {
    Inserted(GrantRecord),
    Conflict,
}

/// 台账发放结果
#[derive(Debug)]
pub enum GrantOutcome {
    /// 本次调用完成了发放
    Granted(GrantRecord),
    /// 该奖励此前已发放，本次调用无副作用
    AlreadyGranted,
}

impl GrantOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

// ---------------------------------------------------------------------------
// TierLike — 资格评估的统一视图
// ---------------------------------------------------------------------------

/// 可参与累计阈值评估的档位视图
///
/// 成就定义与进度档位都实现此 trait，评估器因此只写一份。
pub trait TierLike {
    /// 台账自然键中的 reference 部分
    fn grant_reference(&self) -> String;
    /// 解锁阈值
    fn unlock_threshold(&self) -> i64;
}

impl TierLike for AchievementDefinition {
    fn grant_reference(&self) -> String {
        self.id.to_string()
    }

    fn unlock_threshold(&self) -> i64 {
        self.threshold
    }
}

impl TierLike for ProgressionTier {
    fn grant_reference(&self) -> String {
        self.id.to_string()
    }

    fn unlock_threshold(&self) -> i64 {
        self.threshold
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
