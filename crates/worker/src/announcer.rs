//! 发放播报监听器
//!
//! 订阅所有发放事件，把 title_key 解析成默认语言的可读文案写进
//! 结构化日志，作为发放的审计轨迹。下游的推送/站内信系统消费的是
//! 队列里的发放事件，不依赖这里；翻译失败也只会回退到 key 本身，
//! 永远不影响发放路径。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use reward_shared::error::RewardError;
use reward_shared::events::{EventListener, EventPayload, EventType};
use reward_shared::i18n::Translator;

/// 发放播报器
pub struct GrantAnnouncer {
    translator: Arc<Translator>,
    locale: String,
}

impl GrantAnnouncer {
    pub fn new(translator: Arc<Translator>, locale: impl Into<String>) -> Self {
        Self {
            translator,
            locale: locale.into(),
        }
    }
}

#[async_trait]
impl EventListener for GrantAnnouncer {
    fn name(&self) -> &'static str {
        "grant-announcer"
    }

    fn wants(&self, event_type: &EventType) -> bool {
        event_type.is_granted()
    }

    async fn on_event(&self, event: &EventPayload) -> Result<(), RewardError> {
        let title = event
            .data
            .get("titleKey")
            .and_then(|v| v.as_str())
            .map(|key| self.translator.translate(key, &self.locale));

        info!(
            user_id = %event.user_id,
            event_type = %event.event_type,
            reference = %event.data.get("reference").and_then(|v| v.as_str()).unwrap_or(""),
            magnitude = event.data.get("magnitude").and_then(|v| v.as_i64()).unwrap_or(0),
            title = title.as_deref().unwrap_or(""),
            "奖励已发放"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn translator() -> Arc<Translator> {
        Arc::new(Translator::new("en").with_catalog(
            "en",
            HashMap::from([(
                "trophy.ten-sessions.title".to_string(),
                "Ten Sessions".to_string(),
            )]),
        ))
    }

    #[test]
    fn test_wants_only_granted_events() {
        let announcer = GrantAnnouncer::new(translator(), "en");

        assert!(announcer.wants(&EventType::TrophyGranted));
        assert!(announcer.wants(&EventType::StageBonusCredited));
        assert!(!announcer.wants(&EventType::SessionLogged));
    }

    #[tokio::test]
    async fn test_on_event_never_fails_on_missing_title() {
        let announcer = GrantAnnouncer::new(translator(), "en");

        // 没有 titleKey 的事件照常处理
        let event = EventPayload::new(
            EventType::BonusGranted,
            "user-001",
            serde_json::json!({"reference": "session:1", "magnitude": 5}),
            "reward-engine",
        );
        assert!(announcer.on_event(&event).await.is_ok());

        // 未知 titleKey 回退到 key 本身，同样不报错
        let event = EventPayload::new(
            EventType::TrophyGranted,
            "user-001",
            serde_json::json!({"titleKey": "trophy.unknown.title"}),
            "reward-engine",
        );
        assert!(announcer.on_event(&event).await.is_ok());
    }
}
