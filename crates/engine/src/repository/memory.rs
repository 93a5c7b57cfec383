//! 进程内存仓储实现
//!
//! 供单元测试与端到端场景测试使用，同时适用于无外部存储的演示
//! 部署。与 PostgreSQL 实现遵守同一套契约：发放行的自然键唯一、
//! 插入与积分累加对并发调用表现为原子。

use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use reward_shared::error::Result;

use super::traits::{BalanceStore, DefinitionStore, GrantStore, MetricSource};
use crate::models::{
    AchievementDefinition, GrantInsert, GrantRecord, MetricKind, NewGrant, ProgressionTier,
    RewardFamily,
};

type GrantKey = (String, RewardFamily, String);

/// 进程内存仓储
///
/// 一个结构体同时实现四个仓储 trait，测试里只需要装配一份。
#[derive(Default)]
pub struct MemoryStore {
    grants: DashMap<GrantKey, GrantRecord>,
    balances: DashMap<String, i64>,
    metrics: DashMap<(String, MetricKind), i64>,
    achievements: RwLock<Vec<AchievementDefinition>>,
    tiers: RwLock<Vec<ProgressionTier>>,
    next_grant_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_grant_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// 登记一条成就定义（测试数据装配）
    pub fn add_achievement(&self, def: AchievementDefinition) {
        self.achievements.write().unwrap().push(def);
    }

    /// 登记一个进度档位（测试数据装配）
    pub fn add_tier(&self, tier: ProgressionTier) {
        self.tiers.write().unwrap().push(tier);
    }

    /// 设置某个派生指标的值（活动域在测试里的替身）
    pub fn set_metric(&self, user_id: &str, metric: MetricKind, value: i64) {
        self.metrics.insert((user_id.to_string(), metric), value);
    }

    /// 全部发放记录数（断言用）
    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn find(
        &self,
        user_id: &str,
        family: RewardFamily,
        reference: &str,
    ) -> Result<Option<GrantRecord>> {
        let key = (user_id.to_string(), family, reference.to_string());
        Ok(self.grants.get(&key).map(|r| r.clone()))
    }

    async fn insert_with_credit(&self, grant: NewGrant) -> Result<GrantInsert> {
        let key = (
            grant.user_id.clone(),
            grant.family,
            grant.reference.clone(),
        );

        // entry 持有分片锁，并发的同键插入在此串行化，
        // 与数据库唯一约束的裁决语义一致
        match self.grants.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(GrantInsert::Conflict),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let record = GrantRecord {
                    id: self.next_grant_id.fetch_add(1, Ordering::SeqCst),
                    user_id: grant.user_id.clone(),
                    family: grant.family,
                    reference: grant.reference.clone(),
                    magnitude: grant.magnitude,
                    granted_at: Utc::now(),
                };
                vacant.insert(record.clone());

                if grant.magnitude != 0 {
                    *self.balances.entry(grant.user_id).or_insert(0) += grant.magnitude;
                }

                Ok(GrantInsert::Inserted(record))
            }
        }
    }

    async fn list_family(&self, user_id: &str, family: RewardFamily) -> Result<Vec<GrantRecord>> {
        let mut records: Vec<GrantRecord> = self
            .grants
            .iter()
            .filter(|entry| {
                let (uid, fam, _) = entry.key();
                uid == user_id && *fam == family
            })
            .map(|entry| entry.value().clone())
            .collect();

        records.sort_by_key(|r| r.id);
        Ok(records)
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn credit(&self, user_id: &str, amount: i64) -> Result<i64> {
        let mut entry = self.balances.entry(user_id.to_string()).or_insert(0);
        *entry += amount;
        Ok(*entry)
    }

    async fn try_debit(&self, user_id: &str, amount: i64) -> Result<bool> {
        let mut entry = self.balances.entry(user_id.to_string()).or_insert(0);
        if *entry >= amount {
            *entry -= amount;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn balance(&self, user_id: &str) -> Result<i64> {
        Ok(self.balances.get(user_id).map(|b| *b).unwrap_or(0))
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn achievements_by_family(
        &self,
        family: RewardFamily,
    ) -> Result<Vec<AchievementDefinition>> {
        let mut defs: Vec<AchievementDefinition> = self
            .achievements
            .read()
            .unwrap()
            .iter()
            .filter(|d| d.family == family && d.active)
            .cloned()
            .collect();
        defs.sort_by_key(|d| d.threshold);
        Ok(defs)
    }

    async fn achievement_by_code(&self, code: &str) -> Result<Option<AchievementDefinition>> {
        Ok(self
            .achievements
            .read()
            .unwrap()
            .iter()
            .find(|d| d.code == code && d.active)
            .cloned())
    }

    async fn tiers_by_family(&self, family: RewardFamily) -> Result<Vec<ProgressionTier>> {
        let mut tiers: Vec<ProgressionTier> = self
            .tiers
            .read()
            .unwrap()
            .iter()
            .filter(|t| t.family == family && t.active)
            .cloned()
            .collect();
        tiers.sort_by_key(|t| t.sequence);
        Ok(tiers)
    }

    async fn tier_by_id(&self, id: i64) -> Result<Option<ProgressionTier>> {
        Ok(self
            .tiers
            .read()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }
}

#[async_trait]
impl MetricSource for MemoryStore {
    async fn metric_value(&self, user_id: &str, metric: MetricKind) -> Result<i64> {
        match metric {
            // 积分余额与阶段数从自身状态推导，与线上实现一致
            MetricKind::PointsBalance => self.balance(user_id).await,
            MetricKind::StageCount => Ok(self
                .list_family(user_id, RewardFamily::Stage)
                .await?
                .len() as i64),
            _ => Ok(self
                .metrics
                .get(&(user_id.to_string(), metric))
                .map(|v| *v)
                .unwrap_or(0)),
        }
    }
}

/// 测试装配辅助：常用的定义集合
impl MemoryStore {
    /// 装入一组带累计阈值的目标等级定义
    pub fn seed_goal_levels(&self, thresholds_and_awards: &[(i64, i64)]) {
        for (i, (threshold, award)) in thresholds_and_awards.iter().enumerate() {
            self.add_achievement(AchievementDefinition::new(
                (i + 1) as i64,
                format!("goal-{}", i + 1),
                RewardFamily::GoalLevel,
                MetricKind::PointsBalance,
                *threshold,
                *award,
            ));
        }
    }
}
