//! 幂等发放台账
//!
//! 发放的单一事实来源。契约：同一 (user, family, reference) 的发放
//! 恰好成功一次，后续调用返回 `AlreadyGranted` 且无任何副作用。
//!
//! 先查后插不是原子的；竞争由存储层的唯一约束收口——插入被约束
//! 拦下时同样按 `AlreadyGranted` 处理。发放行写入与积分累加在
//! 存储层同一事务内完成，发放成功后在进程内总线发布该族的发放
//! 事件，驱动级联任务。

use std::sync::Arc;

use tracing::{info, instrument};

use reward_shared::error::Result;
use reward_shared::events::{EventBus, EventPayload, EventType};

use crate::models::{GrantInsert, GrantOutcome, NewGrant, RewardFamily};
use crate::repository::GrantStore;

/// 发放请求
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub user_id: String,
    pub family: RewardFamily,
    /// 族内自然键（成就/档位 id 或活动引用）
    pub reference: String,
    /// 记入积分余额的数额
    pub magnitude: i64,
    /// 发放成功后发布的事件类型（通常取自 FamilyRegistry，
    /// 级联记账任务可覆盖以保持级联图无环）
    pub announce: EventType,
    /// 附加到发放事件 data 的业务字段
    pub detail: serde_json::Value,
}

impl GrantRequest {
    pub fn new(
        user_id: impl Into<String>,
        family: RewardFamily,
        reference: impl Into<String>,
        magnitude: i64,
        announce: EventType,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            family,
            reference: reference.into(),
            magnitude,
            announce,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// 幂等发放台账
pub struct Ledger {
    grants: Arc<dyn GrantStore>,
    bus: Arc<EventBus>,
}

impl Ledger {
    pub fn new(grants: Arc<dyn GrantStore>, bus: Arc<EventBus>) -> Self {
        Self { grants, bus }
    }

    /// 发放一个奖励
    ///
    /// 流程：查台账 -> 原子写入（发放行 + 积分累加）-> 发布发放事件。
    /// `cause` 是触发本次发放的上游事件，用于把 trace 串到级联链路上。
    /// 存储失败原样上抛（调用方的任务会被重试）；重复发放是正常的
    /// 可记录空操作，不是错误。
    #[instrument(
        skip(self, request, cause),
        fields(
            user_id = %request.user_id,
            family = %request.family,
            reference = %request.reference,
        )
    )]
    pub async fn grant(
        &self,
        request: GrantRequest,
        cause: Option<&EventPayload>,
    ) -> Result<GrantOutcome> {
        // 快路径：多数重复投递在这里短路，省一次写入往返
        if self
            .grants
            .find(&request.user_id, request.family, &request.reference)
            .await?
            .is_some()
        {
            self.note_duplicate(&request);
            return Ok(GrantOutcome::AlreadyGranted);
        }

        let inserted = self
            .grants
            .insert_with_credit(NewGrant {
                user_id: request.user_id.clone(),
                family: request.family,
                reference: request.reference.clone(),
                magnitude: request.magnitude,
            })
            .await?;

        let record = match inserted {
            // 慢路径：并发竞争者抢先写入，由唯一约束裁决
            GrantInsert::Conflict => {
                self.note_duplicate(&request);
                return Ok(GrantOutcome::AlreadyGranted);
            }
            GrantInsert::Inserted(record) => record,
        };

        metrics::counter!("reward_grants_total", "family" => request.family.as_str())
            .increment(1);

        info!(
            grant_id = record.id,
            magnitude = record.magnitude,
            "奖励发放成功"
        );

        // 发放事件：信封元数据 + 请求附带的业务字段合并到同一层级
        let mut data = serde_json::json!({
            "family": request.family,
            "reference": request.reference,
            "magnitude": request.magnitude,
            "grantId": record.id,
        });
        if let (serde_json::Value::Object(map), serde_json::Value::Object(detail)) =
            (&mut data, &request.detail)
        {
            for (key, value) in detail {
                map.insert(key.clone(), value.clone());
            }
        }

        let mut event = EventPayload::new(
            request.announce,
            request.user_id.clone(),
            data,
            "reward-engine",
        );
        if let Some(cause) = cause {
            event = event.caused_by(cause);
        }

        // 总线对发布方永不抛错：监听器失败只记日志
        self.bus.publish(&event).await;

        Ok(GrantOutcome::Granted(record))
    }

    fn note_duplicate(&self, request: &GrantRequest) {
        metrics::counter!(
            "reward_grants_duplicate_total",
            "family" => request.family.as_str()
        )
        .increment(1);

        info!("奖励已发放过，本次调用为幂等空操作");
    }
}
