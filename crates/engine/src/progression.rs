//! 会员进度状态机（等级 / 阶段）
//!
//! 状态即档位序号：用户的当前档位从不落库，永远是该族发放记录中
//! 最大 sequence 的查询期推导值。推进只考察下一个序号的档位——
//! 不可跳级、不可重复、不可回退，单向性由台账的唯一约束兜底。
//!
//! 阶段晋升是多谓词门控：积分资格、捐赠次数、账龄、同序号的
//! 等级前置（跨族依赖）必须同时成立。任一谓词不满足时返回列明
//! 失败谓词的结构化结果（驱动进度展示），不发放也不报错。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use reward_shared::error::Result;
use reward_shared::events::EventPayload;

use crate::evaluator::claimable_tiers;
use crate::ledger::{GrantRequest, Ledger};
use crate::models::{
    GrantOutcome, GrantRecord, MetricKind, ProgressionTier, RewardFamily, TierLike,
};
use crate::registry::FamilyRegistry;
use crate::repository::{DefinitionStore, GrantStore, MetricSource};

// ---------------------------------------------------------------------------
// 推导与结果类型
// ---------------------------------------------------------------------------

/// 从发放记录推导当前档位序号
///
/// 返回该族已获得档位中最大的 sequence；一个档位都没有时为 None。
/// 这是"当前档位"的唯一权威定义，任何地方都不允许缓存它。
pub fn current_sequence(
    tiers: &[ProgressionTier],
    granted_refs: &HashSet<String>,
) -> Option<i32> {
    tiers
        .iter()
        .filter(|t| granted_refs.contains(&t.grant_reference()))
        .map(|t| t.sequence)
        .max()
}

/// 阶段晋升谓词
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagePredicate {
    /// 积分余额满足累计阈值资格
    Points,
    /// 捐赠次数达到档位要求
    Donations,
    /// 账龄月数达到档位要求
    AccountAge,
    /// 已持有同序号的会员等级（跨族前置）
    LevelPrerequisite,
}

/// 推进尝试的结果
#[derive(Debug)]
pub enum AdvanceOutcome {
    /// 晋升成功
    Advanced {
        tier: ProgressionTier,
        record: GrantRecord,
    },
    /// 下一档位存在但谓词未全部满足；failing 按固定顺序列出失败项
    NotEligible {
        sequence: i32,
        failing: Vec<StagePredicate>,
    },
    /// 并发竞争者抢先完成了同一档位的晋升，本次为幂等空操作
    AlreadyHeld { sequence: i32 },
    /// 所有档位都已获得
    Completed,
    /// 该族没有配置档位
    NoTiers,
}

// ---------------------------------------------------------------------------
// ProgressionService
// ---------------------------------------------------------------------------

/// 进度状态机服务
pub struct ProgressionService {
    definitions: Arc<dyn DefinitionStore>,
    grants: Arc<dyn GrantStore>,
    metrics: Arc<dyn MetricSource>,
    ledger: Arc<Ledger>,
    registry: FamilyRegistry,
}

impl ProgressionService {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        grants: Arc<dyn GrantStore>,
        metrics: Arc<dyn MetricSource>,
        ledger: Arc<Ledger>,
        registry: FamilyRegistry,
    ) -> Self {
        Self {
            definitions,
            grants,
            metrics,
            ledger,
            registry,
        }
    }

    /// 尝试把用户推进到下一个会员等级
    ///
    /// 等级的门槛只有积分资格（累计阈值语义）。
    #[instrument(skip(self, cause), fields(user_id))]
    pub async fn advance_level(
        &self,
        user_id: &str,
        cause: Option<&EventPayload>,
    ) -> Result<AdvanceOutcome> {
        let tiers = self
            .definitions
            .tiers_by_family(RewardFamily::Level)
            .await?;
        if tiers.is_empty() {
            return Ok(AdvanceOutcome::NoTiers);
        }

        let granted = self.granted_refs(user_id, RewardFamily::Level).await?;
        let Some(next) = next_tier(&tiers, &granted) else {
            return Ok(AdvanceOutcome::Completed);
        };

        let balance = self
            .metrics
            .metric_value(user_id, MetricKind::PointsBalance)
            .await?;
        let claimable = claimable_tiers(&tiers, &granted, balance);
        let points_ok = claimable
            .iter()
            .any(|t| t.grant_reference() == next.grant_reference());

        if !points_ok {
            return Ok(AdvanceOutcome::NotEligible {
                sequence: next.sequence,
                failing: vec![StagePredicate::Points],
            });
        }

        // 等级的奖励金随发放原子记账
        let request = GrantRequest::new(
            user_id,
            RewardFamily::Level,
            next.grant_reference(),
            next.award_points,
            self.registry.announce_for(RewardFamily::Level),
        )
        .with_detail(serde_json::json!({
            "sequence": next.sequence,
            "tierId": next.id,
            "titleKey": next.title_key,
        }));

        self.finish_advance(user_id, next, request, cause).await
    }

    /// 尝试把用户推进到下一个会员阶段
    ///
    /// 四个谓词必须同时成立；失败时逐项列出，驱动进度展示。
    /// 晋升成功后发布阶段事件，级联出阶段奖励金记账与奖杯重评估
    /// 两个独立任务。
    #[instrument(skip(self, cause), fields(user_id))]
    pub async fn advance_stage(
        &self,
        user_id: &str,
        cause: Option<&EventPayload>,
    ) -> Result<AdvanceOutcome> {
        let tiers = self
            .definitions
            .tiers_by_family(RewardFamily::Stage)
            .await?;
        if tiers.is_empty() {
            return Ok(AdvanceOutcome::NoTiers);
        }

        let granted = self.granted_refs(user_id, RewardFamily::Stage).await?;
        let Some(next) = next_tier(&tiers, &granted) else {
            return Ok(AdvanceOutcome::Completed);
        };

        let failing = self.check_stage_predicates(user_id, &tiers, &granted, next).await?;

        if !failing.is_empty() {
            info!(
                user_id,
                sequence = next.sequence,
                failing = ?failing,
                "阶段晋升条件未全部满足"
            );
            return Ok(AdvanceOutcome::NotEligible {
                sequence: next.sequence,
                failing,
            });
        }

        // 阶段发放记录数额为 0：奖励金由级联的记账任务单独入账，
        // detail 里带上档位信息供该任务使用
        let request = GrantRequest::new(
            user_id,
            RewardFamily::Stage,
            next.grant_reference(),
            0,
            self.registry.announce_for(RewardFamily::Stage),
        )
        .with_detail(serde_json::json!({
            "sequence": next.sequence,
            "tierId": next.id,
            "awardPoints": next.award_points,
            "titleKey": next.title_key,
        }));

        self.finish_advance(user_id, next, request, cause).await
    }

    /// 阶段晋升进度报告（展示用）
    ///
    /// 返回下一档位各谓词的满足情况，不发放任何东西。
    pub async fn stage_progress(&self, user_id: &str) -> Result<AdvanceOutcome> {
        // 进度展示复用晋升检查的谓词逻辑，但绝不发放——
        // advance_stage 的发放路径只由 Worker 的任务触发
        let tiers = self
            .definitions
            .tiers_by_family(RewardFamily::Stage)
            .await?;
        if tiers.is_empty() {
            return Ok(AdvanceOutcome::NoTiers);
        }

        let granted = self.granted_refs(user_id, RewardFamily::Stage).await?;
        let Some(next) = next_tier(&tiers, &granted) else {
            return Ok(AdvanceOutcome::Completed);
        };

        let failing = self.check_stage_predicates(user_id, &tiers, &granted, next).await?;

        Ok(AdvanceOutcome::NotEligible {
            sequence: next.sequence,
            failing,
        })
    }

    // ==================== 私有方法 ====================

    /// 逐项检查阶段晋升谓词，返回失败项（固定顺序）
    async fn check_stage_predicates(
        &self,
        user_id: &str,
        tiers: &[ProgressionTier],
        granted: &HashSet<String>,
        next: &ProgressionTier,
    ) -> Result<Vec<StagePredicate>> {
        let mut failing = Vec::new();

        // (a) 积分资格：阶段阈值同样是族内累计语义
        let balance = self
            .metrics
            .metric_value(user_id, MetricKind::PointsBalance)
            .await?;
        let claimable = claimable_tiers(tiers, granted, balance);
        if !claimable
            .iter()
            .any(|t| t.grant_reference() == next.grant_reference())
        {
            failing.push(StagePredicate::Points);
        }

        // (b) 捐赠次数
        let donations = self
            .metrics
            .metric_value(user_id, MetricKind::DonationCount)
            .await?;
        if donations < next.required_donations {
            failing.push(StagePredicate::Donations);
        }

        // (c) 账龄月数
        let age_months = self
            .metrics
            .metric_value(user_id, MetricKind::AccountAgeMonths)
            .await?;
        if age_months < next.required_months {
            failing.push(StagePredicate::AccountAge);
        }

        // (d) 跨族前置：持有同序号的会员等级
        if !self.holds_level(user_id, next.sequence).await? {
            failing.push(StagePredicate::LevelPrerequisite);
        }

        Ok(failing)
    }

    async fn granted_refs(
        &self,
        user_id: &str,
        family: RewardFamily,
    ) -> Result<HashSet<String>> {
        Ok(self
            .grants
            .list_family(user_id, family)
            .await?
            .into_iter()
            .map(|r| r.reference)
            .collect())
    }

    /// 用户是否持有不低于指定序号的会员等级
    async fn holds_level(&self, user_id: &str, sequence: i32) -> Result<bool> {
        let level_tiers = self
            .definitions
            .tiers_by_family(RewardFamily::Level)
            .await?;
        let level_granted = self.granted_refs(user_id, RewardFamily::Level).await?;

        Ok(current_sequence(&level_tiers, &level_granted)
            .is_some_and(|current| current >= sequence))
    }

    async fn finish_advance(
        &self,
        user_id: &str,
        tier: &ProgressionTier,
        request: GrantRequest,
        cause: Option<&EventPayload>,
    ) -> Result<AdvanceOutcome> {
        match self.ledger.grant(request, cause).await? {
            GrantOutcome::Granted(record) => {
                info!(
                    user_id,
                    family = %tier.family,
                    sequence = tier.sequence,
                    "进度晋升成功"
                );
                Ok(AdvanceOutcome::Advanced {
                    tier: tier.clone(),
                    record,
                })
            }
            // 并发竞争者刚刚完成了同一档位的晋升：幂等空操作
            GrantOutcome::AlreadyGranted => Ok(AdvanceOutcome::AlreadyHeld {
                sequence: tier.sequence,
            }),
        }
    }
}

/// 下一个待获得的档位
///
/// 档位按 sequence 升序，取第一个未获得的。配合台账唯一约束，
/// 推进天然单向且不可跳级。
fn next_tier<'a>(
    tiers: &'a [ProgressionTier],
    granted_refs: &HashSet<String>,
) -> Option<&'a ProgressionTier> {
    tiers
        .iter()
        .find(|t| !granted_refs.contains(&t.grant_reference()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{BalanceStore, MemoryStore};
    use reward_shared::events::EventBus;

    fn build_service(store: Arc<MemoryStore>) -> ProgressionService {
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(Ledger::new(store.clone(), bus));

        ProgressionService::new(
            store.clone(),
            store.clone(),
            store,
            ledger,
            FamilyRegistry::standard(),
        )
    }

    /// 两级等级 + 两级阶段的标准测试配置
    fn seed_progression(store: &MemoryStore) {
        store.add_tier(ProgressionTier::new(101, RewardFamily::Level, 1, 10).with_award(5));
        store.add_tier(ProgressionTier::new(102, RewardFamily::Level, 2, 50).with_award(10));

        store.add_tier(
            ProgressionTier::new(201, RewardFamily::Stage, 1, 10)
                .with_requirements(1, 1)
                .with_award(20),
        );
        store.add_tier(
            ProgressionTier::new(202, RewardFamily::Stage, 2, 50)
                .with_requirements(3, 6)
                .with_award(40),
        );
    }

    #[test]
    fn test_current_sequence_derivation() {
        let tiers = vec![
            ProgressionTier::new(1, RewardFamily::Level, 1, 10),
            ProgressionTier::new(2, RewardFamily::Level, 2, 20),
            ProgressionTier::new(3, RewardFamily::Level, 3, 30),
        ];

        assert_eq!(current_sequence(&tiers, &HashSet::new()), None);

        let granted = HashSet::from(["1".to_string(), "2".to_string()]);
        assert_eq!(current_sequence(&tiers, &granted), Some(2));
    }

    #[tokio::test]
    async fn test_level_advances_on_points() {
        let store = Arc::new(MemoryStore::new());
        seed_progression(&store);
        store.credit("user-001", 15).await.unwrap();

        let service = build_service(store.clone());
        let outcome = service.advance_level("user-001", None).await.unwrap();

        match outcome {
            AdvanceOutcome::Advanced { tier, record } => {
                assert_eq!(tier.sequence, 1);
                // 等级奖励金随发放入账
                assert_eq!(record.magnitude, 5);
            }
            other => panic!("expected Advanced, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_level_not_eligible_reports_points() {
        let store = Arc::new(MemoryStore::new());
        seed_progression(&store);
        store.credit("user-001", 3).await.unwrap();

        let service = build_service(store);
        let outcome = service.advance_level("user-001", None).await.unwrap();

        match outcome {
            AdvanceOutcome::NotEligible { sequence, failing } => {
                assert_eq!(sequence, 1);
                assert_eq!(failing, vec![StagePredicate::Points]);
            }
            other => panic!("expected NotEligible, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stage_blocked_without_level_prerequisite() {
        let store = Arc::new(MemoryStore::new());
        seed_progression(&store);

        // 积分、捐赠、账龄全部达标，但没有等级前置
        store.credit("user-001", 100).await.unwrap();
        store.set_metric("user-001", MetricKind::DonationCount, 5);
        store.set_metric("user-001", MetricKind::AccountAgeMonths, 12);

        let service = build_service(store.clone());
        let outcome = service.advance_stage("user-001", None).await.unwrap();

        match outcome {
            AdvanceOutcome::NotEligible { sequence, failing } => {
                assert_eq!(sequence, 1);
                // 唯一失败的谓词是跨族的等级前置
                assert_eq!(failing, vec![StagePredicate::LevelPrerequisite]);
            }
            other => panic!("expected NotEligible, got {other:?}"),
        }

        // 补上缺失的谓词后晋升成功
        service.advance_level("user-001", None).await.unwrap();
        let outcome = service.advance_stage("user-001", None).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Advanced { .. }));
    }

    #[tokio::test]
    async fn test_stage_reports_all_failing_predicates() {
        let store = Arc::new(MemoryStore::new());
        seed_progression(&store);

        let service = build_service(store);
        let outcome = service.advance_stage("user-001", None).await.unwrap();

        match outcome {
            AdvanceOutcome::NotEligible { failing, .. } => {
                assert_eq!(
                    failing,
                    vec![
                        StagePredicate::Points,
                        StagePredicate::Donations,
                        StagePredicate::AccountAge,
                        StagePredicate::LevelPrerequisite,
                    ]
                );
            }
            other => panic!("expected NotEligible, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stage_grant_has_zero_magnitude() {
        let store = Arc::new(MemoryStore::new());
        seed_progression(&store);

        store.credit("user-001", 100).await.unwrap();
        store.set_metric("user-001", MetricKind::DonationCount, 5);
        store.set_metric("user-001", MetricKind::AccountAgeMonths, 12);

        let service = build_service(store.clone());
        service.advance_level("user-001", None).await.unwrap();

        let before = store.balance("user-001").await.unwrap();
        let outcome = service.advance_stage("user-001", None).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Advanced { .. }));

        // 阶段发放记录本身不入账，奖励金由级联任务单独记
        assert_eq!(store.balance("user-001").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_no_tier_skipping() {
        let store = Arc::new(MemoryStore::new());
        seed_progression(&store);
        // 积分足够直接到第 2 级
        store.credit("user-001", 1000).await.unwrap();

        let service = build_service(store.clone());

        // 第一次推进只到第 1 级
        let first = service.advance_level("user-001", None).await.unwrap();
        match first {
            AdvanceOutcome::Advanced { tier, .. } => assert_eq!(tier.sequence, 1),
            other => panic!("expected Advanced, got {other:?}"),
        }

        // 再推进一次才到第 2 级
        let second = service.advance_level("user-001", None).await.unwrap();
        match second {
            AdvanceOutcome::Advanced { tier, .. } => assert_eq!(tier.sequence, 2),
            other => panic!("expected Advanced, got {other:?}"),
        }

        // 档位用尽
        let third = service.advance_level("user-001", None).await.unwrap();
        assert!(matches!(third, AdvanceOutcome::Completed));
    }

    #[tokio::test]
    async fn test_no_tiers_configured() {
        let store = Arc::new(MemoryStore::new());
        let service = build_service(store);

        let outcome = service.advance_level("user-001", None).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::NoTiers));
    }
}
