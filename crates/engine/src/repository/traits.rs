//! 仓储 Trait 定义
//!
//! 定义仓储接口，便于服务层依赖抽象而非具体实现，支持 mock 测试。

use async_trait::async_trait;

use reward_shared::error::Result;

use crate::models::{
    AchievementDefinition, GrantInsert, GrantRecord, MetricKind, NewGrant, ProgressionTier,
    RewardFamily,
};

/// 台账仓储接口
///
/// 台账是唯一的事实来源：发放行只增不改，
/// (user_id, family, reference) 上的唯一约束封死并发重复写入。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// 按自然键查找已有的发放记录
    async fn find(
        &self,
        user_id: &str,
        family: RewardFamily,
        reference: &str,
    ) -> Result<Option<GrantRecord>>;

    /// 原子写入：插入发放行并按 magnitude 累加积分余额
    ///
    /// 两个写动作在同一事务里提交，任务在两者之间崩溃不会留下
    /// "有记录无积分"的半成品状态。唯一约束冲突返回 `Conflict`。
    async fn insert_with_credit(&self, grant: NewGrant) -> Result<GrantInsert>;

    /// 列出用户在某族的全部发放记录
    async fn list_family(&self, user_id: &str, family: RewardFamily) -> Result<Vec<GrantRecord>>;
}

/// 积分余额存取接口
///
/// 余额是引擎唯一的热点可变聚合。只暴露原子累加与带守卫的扣减，
/// 业务逻辑里不允许出现"读-改-写"。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// 原子累加，返回新余额
    async fn credit(&self, user_id: &str, amount: i64) -> Result<i64>;

    /// 带守卫的扣减：余额足够时扣减并返回 true，否则不动返回 false
    async fn try_debit(&self, user_id: &str, amount: i64) -> Result<bool>;

    /// 查询当前余额（无记录视为 0）
    async fn balance(&self, user_id: &str) -> Result<i64>;
}

/// 成就定义/进度档位仓储接口
///
/// 参考数据由运营后台维护，对引擎只读。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// 按族列出启用中的成就定义，按阈值升序
    async fn achievements_by_family(
        &self,
        family: RewardFamily,
    ) -> Result<Vec<AchievementDefinition>>;

    /// 按业务 code 查找启用中的成就定义
    async fn achievement_by_code(&self, code: &str) -> Result<Option<AchievementDefinition>>;

    /// 按族列出启用中的进度档位，按 sequence 升序
    async fn tiers_by_family(&self, family: RewardFamily) -> Result<Vec<ProgressionTier>>;

    /// 按 id 查找进度档位
    async fn tier_by_id(&self, id: i64) -> Result<Option<ProgressionTier>>;
}

/// 累计指标读取接口
///
/// 指标是查询期派生值；活动域表的 schema 归各活动服务所有，
/// 本引擎只读聚合。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn metric_value(&self, user_id: &str, metric: MetricKind) -> Result<i64>;
}
