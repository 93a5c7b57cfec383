//! 统一错误处理模块
//!
//! 定义激励引擎共享的错误类型，使用 thiserror 提供良好的错误信息。
//!
//! 注意两类"看似错误"的情况不在此建模：
//! - 重复发放（AlreadyGranted）是幂等台账的正常返回值，见 `GrantOutcome`；
//! - 进度条件未满足是结构化的评估结果，见进度状态机的返回类型。
//! 它们都是业务上的预期路径，不应走错误通道。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum RewardError {
    // ==================== 存储错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== 队列错误 ====================
    #[error("消息队列错误: {0}")]
    Queue(String),

    // ==================== 并发控制错误 ====================
    #[error("获取用户锁超时: key={key}")]
    LockTimeout { key: i64 },

    // ==================== 通用错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, RewardError>;

impl RewardError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 可重试错误会被队列基础设施按退避策略重新投递；
    /// 锁超时视为瞬时存储故障，同样走重试通道。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Redis(_) | Self::Queue(_) | Self::LockTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = RewardError::NotFound {
            entity: "AchievementDefinition".to_string(),
            id: "42".to_string(),
        };
        assert_eq!(err.code(), "NOT_FOUND");

        let err = RewardError::LockTimeout { key: 12345 };
        assert_eq!(err.code(), "LOCK_TIMEOUT");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = RewardError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let lock_err = RewardError::LockTimeout { key: 1 };
        assert!(lock_err.is_retryable());

        let queue_err = RewardError::Queue("broker unreachable".to_string());
        assert!(queue_err.is_retryable());

        let not_found = RewardError::NotFound {
            entity: "AchievementDefinition".to_string(),
            id: "42".to_string(),
        };
        assert!(!not_found.is_retryable());

        let ser = RewardError::Serialization("bad payload".to_string());
        assert!(!ser.is_retryable());
    }
}
