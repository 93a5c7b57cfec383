//! 用户建议锁
//!
//! 按用户串行化"评估 -> 发放"的外部互斥原语。锁的 key 与它保护的
//! 行无关：由用户 ID 确定性地派生出一个数值 key。奖杯族的资格评估
//! 依赖聚合再读，同一用户的两个并发任务可能同时读到同一份聚合，
//! 锁把这对操作变成事实上的原子区间，而不需要跨语句的大事务。
//!
//! 实现为 Redis 优先（SET NX PX）、存储后备的两级结构，锁带 TTL，
//! 持有方崩溃后锁随 TTL 过期，不会留下死锁。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::Client as RedisClient;
use sqlx::PgPool;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use reward_shared::error::{Result, RewardError};

/// 从用户 ID 确定性派生锁的数值 key
///
/// 取 SHA-256 摘要前 8 字节按大端拼成 i64。同一用户永远得到同一个
/// key，不同用户的碰撞概率可以忽略。
pub fn user_lock_key(user_id: &str) -> i64 {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(user_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// 锁配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 锁超时时间：持有方崩溃后锁最迟在此之后自动释放
    pub ttl: Duration,
    /// 获取锁重试次数
    pub retry_count: u32,
    /// 重试间隔
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// 内存后备锁的持有状态
#[derive(Debug, Clone)]
struct MemoryLock {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// 后备存储：Redis 不可用时兜底的锁实现
enum FallbackStore {
    /// reward_locks 表 + TTL 清理
    Postgres(PgPool),
    /// 进程内存（测试与单机部署）
    Memory(Arc<DashMap<i64, MemoryLock>>),
}

/// 用户锁管理器
///
/// 优先使用 Redis 实现高性能互斥；Redis 操作失败时降级到后备存储。
/// Redis 明确报告锁被占用时不降级——那是真实的竞争，应当重试。
pub struct LockManager {
    redis: Option<RedisClient>,
    fallback: FallbackStore,
    config: LockConfig,
    /// 实例唯一标识，用于区分不同服务实例持有的锁
    instance_id: String,
}

impl LockManager {
    /// 创建锁管理器（线上形态：Redis 优先，数据库后备）
    pub fn new(redis: Option<RedisClient>, pool: PgPool, config: LockConfig) -> Self {
        Self {
            redis,
            fallback: FallbackStore::Postgres(pool),
            config,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// 创建纯内存锁管理器（测试与单机部署）
    pub fn in_memory(config: LockConfig) -> Self {
        Self {
            redis: None,
            fallback: FallbackStore::Memory(Arc::new(DashMap::new())),
            config,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// 获取锁
    ///
    /// 在重试预算内未获取到锁时返回 `LockTimeout`（可重试错误，
    /// 调用方的任务会被队列按退避重新投递）。
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn acquire(&self, key: i64) -> Result<LockGuard> {
        // owner 格式: instance_id:uuid，释放时校验归属防止误删他人的锁
        let owner = format!("{}:{}", self.instance_id, Uuid::new_v4());

        let mut attempt: u32 = 0;
        loop {
            if let Some(guard) = self.try_acquire_once(key, &owner).await? {
                return Ok(guard);
            }

            if attempt >= self.config.retry_count {
                metrics::counter!("reward_lock_timeouts_total").increment(1);
                return Err(RewardError::LockTimeout { key });
            }

            debug!(
                key,
                attempt,
                retry_delay_ms = self.config.retry_delay.as_millis() as u64,
                "锁被占用，等待后重试"
            );
            tokio::time::sleep(self.config.retry_delay).await;
            attempt += 1;
        }
    }

    /// 单次获取尝试
    async fn try_acquire_once(&self, key: i64, owner: &str) -> Result<Option<LockGuard>> {
        if let Some(ref client) = self.redis {
            match self.try_redis_lock(client, key, owner).await {
                Ok(true) => {
                    debug!(key, owner, "Redis 锁已获取");
                    return Ok(Some(LockGuard {
                        key,
                        owner: owner.to_string(),
                        backend: GuardBackend::Redis(client.clone()),
                        released: false,
                    }));
                }
                // 锁被真实占用：不降级，交给上层重试
                Ok(false) => return Ok(None),
                Err(e) => {
                    warn!(key, error = %e, "Redis 锁操作失败，降级到后备存储");
                }
            }
        }

        self.try_fallback_lock(key, owner).await
    }

    /// 尝试获取 Redis 锁
    ///
    /// SET key value NX PX：仅在 key 不存在时设置并带毫秒级过期，
    /// 单条命令完成"检查 + 占用 + 定时"三件事。
    async fn try_redis_lock(
        &self,
        client: &RedisClient,
        key: i64,
        owner: &str,
    ) -> std::result::Result<bool, String> {
        let lock_key = format!("reward:lock:{key}");
        let ttl_ms = self.config.ttl.as_millis() as u64;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| e.to_string())?;

        let result: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;

        // SET NX 成功返回 "OK"，失败返回 None
        Ok(result.is_some())
    }

    /// 尝试获取后备锁
    async fn try_fallback_lock(&self, key: i64, owner: &str) -> Result<Option<LockGuard>> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.ttl)
                .map_err(|e| RewardError::Internal(e.to_string()))?;

        match &self.fallback {
            FallbackStore::Postgres(pool) => {
                // 先清理过期锁，防止崩溃的持有方造成死锁
                sqlx::query(r#"DELETE FROM reward_locks WHERE lock_key = $1 AND expires_at < NOW()"#)
                    .bind(key)
                    .execute(pool)
                    .await?;

                let result = sqlx::query(
                    r#"
                    INSERT INTO reward_locks (lock_key, owner_id, expires_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (lock_key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(owner)
                .bind(expires_at)
                .execute(pool)
                .await?;

                if result.rows_affected() > 0 {
                    debug!(key, owner, "数据库锁已获取");
                    Ok(Some(LockGuard {
                        key,
                        owner: owner.to_string(),
                        backend: GuardBackend::Postgres(pool.clone()),
                        released: false,
                    }))
                } else {
                    Ok(None)
                }
            }
            FallbackStore::Memory(locks) => {
                let now = Utc::now();
                match locks.entry(key) {
                    dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                        if occupied.get().expires_at > now {
                            return Ok(None);
                        }
                        // 过期锁直接接管
                        occupied.insert(MemoryLock {
                            owner: owner.to_string(),
                            expires_at,
                        });
                    }
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        vacant.insert(MemoryLock {
                            owner: owner.to_string(),
                            expires_at,
                        });
                    }
                }
                Ok(Some(LockGuard {
                    key,
                    owner: owner.to_string(),
                    backend: GuardBackend::Memory(locks.clone()),
                    released: false,
                }))
            }
        }
    }

    /// 在用户锁内执行一段评估-发放逻辑
    ///
    /// 锁从 `f` 开始前持有到 `f` 结束后，无论成功失败都在收尾区释放；
    /// 释放失败只记日志（锁随 TTL 过期），不吞掉 `f` 的结果。
    pub async fn with_user_lock<T, F, Fut>(&self, user_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = user_lock_key(user_id);
        let guard = self.acquire(key).await?;

        let result = f().await;

        if let Err(release_err) = guard.release().await {
            warn!(
                key,
                error = %release_err,
                "释放用户锁失败，锁将在 TTL 后自动过期"
            );
        }

        result
    }
}

/// 锁守卫
///
/// 推荐通过 `release()` 显式释放；Drop 无法执行异步操作，
/// 未释放的守卫只能记录警告并依赖 TTL 过期。
pub struct LockGuard {
    key: i64,
    owner: String,
    backend: GuardBackend,
    released: bool,
}

enum GuardBackend {
    Redis(RedisClient),
    Postgres(PgPool),
    Memory(Arc<DashMap<i64, MemoryLock>>),
}

impl LockGuard {
    pub fn key(&self) -> i64 {
        self.key
    }

    /// 显式释放锁
    ///
    /// 释放前校验归属，避免删掉 TTL 过期后被他人接管的锁。
    #[instrument(skip(self), fields(key = self.key))]
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match &self.backend {
            GuardBackend::Redis(client) => {
                let lock_key = format!("reward:lock:{}", self.key);
                let mut conn = client.get_multiplexed_async_connection().await?;

                // Lua 脚本原子校验 owner 后删除，避免检查-删除竞态
                let script = r#"
                    if redis.call("get", KEYS[1]) == ARGV[1] then
                        return redis.call("del", KEYS[1])
                    else
                        return 0
                    end
                "#;

                let deleted: i32 = redis::Script::new(script)
                    .key(&lock_key)
                    .arg(&self.owner)
                    .invoke_async(&mut conn)
                    .await?;

                if deleted == 0 {
                    warn!(key = self.key, owner = %self.owner, "锁已过期或被其他持有方接管");
                } else {
                    debug!(key = self.key, "Redis 锁已释放");
                }
                Ok(())
            }
            GuardBackend::Postgres(pool) => {
                let result = sqlx::query(
                    r#"DELETE FROM reward_locks WHERE lock_key = $1 AND owner_id = $2"#,
                )
                .bind(self.key)
                .bind(&self.owner)
                .execute(pool)
                .await?;

                if result.rows_affected() == 0 {
                    warn!(key = self.key, owner = %self.owner, "锁已过期或被其他持有方接管");
                } else {
                    debug!(key = self.key, "数据库锁已释放");
                }
                Ok(())
            }
            GuardBackend::Memory(locks) => {
                locks.remove_if(&self.key, |_, lock| lock.owner == self.owner);
                Ok(())
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                key = self.key,
                owner = %self.owner,
                "LockGuard 未显式释放即被丢弃，锁将在 TTL 后自动过期"
            );
        }
    }
}
