//! 奖励族的评估与发放编排
//!
//! 把评估器、台账、锁与仓储装配成各奖励族的完整发放流程：
//! - 记账类族（奖励金/社交互动）：一次活动 -> 一条固定数额的发放
//! - 评估类族（奖杯/目标等级/连续打卡）：按累计指标重新评估可
//!   领取的档位并逐个发放
//!
//! 奖杯的资格依赖聚合再读，评估-发放全程持用户锁；其余族的并发
//! 竞争由台账的唯一约束收口，不需要锁。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use reward_shared::error::Result;
use reward_shared::events::{EventPayload, EventType};

use crate::evaluator::claimable_tiers;
use crate::ledger::{GrantRequest, Ledger};
use crate::lock::LockManager;
use crate::models::{GrantOutcome, GrantRecord, MetricKind, RewardFamily, TierLike};
use crate::registry::FamilyRegistry;
use crate::repository::{DefinitionStore, GrantStore, MetricSource};

/// 奖励发放服务
pub struct RewardService {
    definitions: Arc<dyn DefinitionStore>,
    grants: Arc<dyn GrantStore>,
    metrics: Arc<dyn MetricSource>,
    ledger: Arc<Ledger>,
    lock: Arc<LockManager>,
    registry: FamilyRegistry,
}

impl RewardService {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        grants: Arc<dyn GrantStore>,
        metrics: Arc<dyn MetricSource>,
        ledger: Arc<Ledger>,
        lock: Arc<LockManager>,
        registry: FamilyRegistry,
    ) -> Self {
        Self {
            definitions,
            grants,
            metrics,
            ledger,
            lock,
            registry,
        }
    }

    /// 为单次活动记一笔固定奖励
    ///
    /// `code` 定位成就定义（如 "toolkit-session"），`reference` 是活动
    /// 的业务引用（如 "session:{id}"），构成台账自然键的 reference 部分。
    /// 定义缺失按规范是记日志的空操作，返回 `Ok(None)` 而不是错误——
    /// 配置问题不应该让任务反复重试。
    #[instrument(skip(self, cause), fields(user_id, code))]
    pub async fn credit_activity(
        &self,
        user_id: &str,
        code: &str,
        reference: &str,
        cause: Option<&EventPayload>,
    ) -> Result<Option<GrantOutcome>> {
        let Some(def) = self.definitions.achievement_by_code(code).await? else {
            warn!(user_id, code, "成就定义缺失，跳过本次记账");
            return Ok(None);
        };

        let request = GrantRequest::new(
            user_id,
            def.family,
            reference,
            def.award_points,
            self.registry.announce_for(def.family),
        )
        .with_detail(serde_json::json!({
            "code": def.code,
            "titleKey": def.title_key,
        }));

        let outcome = self.ledger.grant(request, cause).await?;
        Ok(Some(outcome))
    }

    /// 为阶段晋升记一笔奖励金
    ///
    /// 阶段发放记录本身数额为 0，奖励金由本任务单独记账。
    /// 发放事件覆盖为 `StageBonusCredited`：它与奖励金族默认的
    /// `BonusGranted` 不同名，级联图因此保持无环。
    #[instrument(skip(self, cause), fields(user_id, tier_id))]
    pub async fn credit_stage_bonus(
        &self,
        user_id: &str,
        tier_id: i64,
        cause: Option<&EventPayload>,
    ) -> Result<Option<GrantOutcome>> {
        let Some(tier) = self.definitions.tier_by_id(tier_id).await? else {
            warn!(user_id, tier_id, "阶段档位缺失，跳过奖励金记账");
            return Ok(None);
        };

        let request = GrantRequest::new(
            user_id,
            RewardFamily::Bonus,
            format!("stage-bonus:{tier_id}"),
            tier.award_points,
            EventType::StageBonusCredited,
        )
        .with_detail(serde_json::json!({
            "stageSequence": tier.sequence,
            "titleKey": tier.title_key,
        }));

        let outcome = self.ledger.grant(request, cause).await?;
        Ok(Some(outcome))
    }

    /// 重新评估并发放用户可领取的奖杯
    ///
    /// 整个评估-发放区间持用户锁：奖杯资格来自聚合再读，
    /// 同一用户并发的两次评估必须串行，否则两边都会把同一个
    /// 奖杯判为可发放。锁在收尾区释放，获取超时按可重试错误上抛。
    pub async fn evaluate_trophies(
        &self,
        user_id: &str,
        cause: Option<&EventPayload>,
    ) -> Result<Vec<GrantRecord>> {
        self.lock
            .with_user_lock(user_id, || {
                self.evaluate_family(user_id, RewardFamily::Trophy, cause)
            })
            .await
    }

    /// 重新评估并发放用户可领取的目标等级
    pub async fn evaluate_goal_levels(
        &self,
        user_id: &str,
        cause: Option<&EventPayload>,
    ) -> Result<Vec<GrantRecord>> {
        self.evaluate_family(user_id, RewardFamily::GoalLevel, cause)
            .await
    }

    /// 重新评估并发放用户可领取的连续打卡里程碑
    pub async fn evaluate_streaks(
        &self,
        user_id: &str,
        cause: Option<&EventPayload>,
    ) -> Result<Vec<GrantRecord>> {
        self.evaluate_family(user_id, RewardFamily::Streak, cause)
            .await
    }

    /// 评估一个族内新可领取的档位并逐个发放
    ///
    /// 定义按其资格指标分组：同指标的档位之间适用累计阈值语义，
    /// 不同指标互不影响。返回本次实际新发放的记录。
    #[instrument(skip(self, cause), fields(user_id, family = %family))]
    async fn evaluate_family(
        &self,
        user_id: &str,
        family: RewardFamily,
        cause: Option<&EventPayload>,
    ) -> Result<Vec<GrantRecord>> {
        let defs = self.definitions.achievements_by_family(family).await?;
        if defs.is_empty() {
            return Ok(Vec::new());
        }

        let granted: HashSet<String> = self
            .grants
            .list_family(user_id, family)
            .await?
            .into_iter()
            .map(|r| r.reference)
            .collect();

        let mut by_metric: HashMap<MetricKind, Vec<_>> = HashMap::new();
        for def in &defs {
            by_metric.entry(def.metric).or_default().push(def.clone());
        }

        let announce = self.registry.announce_for(family);
        let mut newly_granted = Vec::new();

        for (metric, group) in by_metric {
            let value = self.metrics.metric_value(user_id, metric).await?;
            let claimable = claimable_tiers(&group, &granted, value);

            for def in claimable {
                let request = GrantRequest::new(
                    user_id,
                    family,
                    def.grant_reference(),
                    def.award_points,
                    announce,
                )
                .with_detail(serde_json::json!({
                    "code": def.code,
                    "titleKey": def.title_key,
                }));

                // AlreadyGranted 正常跳过：重投递的任务会走到这里
                if let GrantOutcome::Granted(record) = self.ledger.grant(request, cause).await? {
                    newly_granted.push(record);
                }
            }
        }

        if !newly_granted.is_empty() {
            info!(
                user_id,
                family = %family,
                count = newly_granted.len(),
                "族内评估发放完成"
            );
        }

        Ok(newly_granted)
    }
}
