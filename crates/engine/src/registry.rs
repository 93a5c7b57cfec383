//! 奖励族注册表
//!
//! 族 -> (发放事件, 进度指标) 的封闭查找表。所有按族分派的行为
//! 都从这里查询，业务代码里不出现按族展开的条件链；
//! 新增奖励族 = 在 `standard()` 里加一条注册。

use std::collections::HashMap;

use reward_shared::events::EventType;

use crate::models::{MetricKind, RewardFamily};

/// 注册表条目
#[derive(Debug, Clone)]
pub struct FamilyEntry {
    /// 发放成功后台账发布的事件类型
    ///
    /// 每个族的发放事件各不相同，级联路由按事件名消费——
    /// 这是级联图无环的前提。
    pub announce: EventType,
    /// 进度族的资格指标；记账类族按定义自带的指标评估，此处为 None
    pub metric: Option<MetricKind>,
}

/// 奖励族注册表
#[derive(Debug, Clone)]
pub struct FamilyRegistry {
    entries: HashMap<RewardFamily, FamilyEntry>,
}

impl FamilyRegistry {
    /// 标准注册表：全部七个奖励族各登记一次
    pub fn standard() -> Self {
        let mut entries = HashMap::new();

        entries.insert(
            RewardFamily::Trophy,
            FamilyEntry {
                announce: EventType::TrophyGranted,
                metric: None,
            },
        );
        entries.insert(
            RewardFamily::Bonus,
            FamilyEntry {
                announce: EventType::BonusGranted,
                metric: None,
            },
        );
        entries.insert(
            RewardFamily::Level,
            FamilyEntry {
                announce: EventType::LevelGranted,
                metric: Some(MetricKind::PointsBalance),
            },
        );
        entries.insert(
            RewardFamily::Stage,
            FamilyEntry {
                announce: EventType::StageGranted,
                metric: Some(MetricKind::PointsBalance),
            },
        );
        entries.insert(
            RewardFamily::GoalLevel,
            FamilyEntry {
                announce: EventType::GoalLevelGranted,
                metric: Some(MetricKind::PointsBalance),
            },
        );
        entries.insert(
            RewardFamily::Streak,
            FamilyEntry {
                announce: EventType::StreakGranted,
                metric: Some(MetricKind::StreakLength),
            },
        );
        entries.insert(
            RewardFamily::SocialAction,
            FamilyEntry {
                announce: EventType::SocialGranted,
                metric: Some(MetricKind::ReactionCount),
            },
        );

        Self { entries }
    }

    /// 查询族的发放事件类型
    pub fn announce_for(&self, family: RewardFamily) -> EventType {
        self.entries
            .get(&family)
            .map(|e| e.announce)
            // standard() 覆盖了所有变体，此分支只在自定义注册表漏登记时触发
            .unwrap_or(EventType::BonusGranted)
    }

    /// 查询进度族的资格指标
    pub fn metric_for(&self, family: RewardFamily) -> Option<MetricKind> {
        self.entries.get(&family).and_then(|e| e.metric)
    }
}

impl Default for FamilyRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
