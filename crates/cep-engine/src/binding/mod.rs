//! 分布式绑定
//!
//! 绑定之后远端存储是会话的权威副本：
//! - 每次提交的会话修改都在远端会话锁内写穿到远端
//! - 版本号变化说明其他进程修改过会话，本地副本需要重新加载
//! - 定时器存放在远端，按触发时间原子领取，同一个定时器只会被一个进程触发

pub mod memory;
pub mod redis_store;

use crate::error::{EngineError, Result};
use crate::session::StoredSession;
use crate::timers::Timer;
use cep_shared::config::RedisConfig;
use cep_shared::retry::{RetryPolicy, retry_blocking};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// 远端状态存储
#[cfg_attr(test, mockall::automock)]
pub trait StateStore: Send + Sync {
    /// 读取会话快照及其版本号
    fn load_session(&self, ruleset: &str, sid: &str) -> Result<Option<(StoredSession, u64)>>;

    /// 会话当前版本号，不存在时为 0
    fn session_version(&self, ruleset: &str, sid: &str) -> Result<u64>;

    /// 写入会话快照，返回新的版本号
    fn save_session(&self, ruleset: &str, session: &StoredSession) -> Result<u64>;

    /// 尝试获取锁，锁已被持有时返回 false
    fn try_lock(&self, resource: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// 只有 owner 匹配时才释放锁
    fn unlock(&self, resource: &str, owner: &str) -> Result<bool>;

    /// 设置定时器，同一会话同名定时器被替换
    fn schedule_timer(&self, ruleset: &str, timer: &Timer) -> Result<()>;

    /// 放回已领取但未处理的定时器，同名定时器已被重新设置时不覆盖，返回是否放回
    fn restore_timer(&self, ruleset: &str, timer: &Timer) -> Result<bool>;

    /// 原子领取到期的定时器
    fn claim_due_timers(&self, ruleset: &str, now_ms: u64, limit: usize) -> Result<Vec<Timer>>;
}

/// 会话锁配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 锁过期时间，持有者崩溃后锁自动释放
    pub ttl: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            retry_count: 50,
            retry_delay: Duration::from_millis(10),
        }
    }
}

impl LockConfig {
    /// 锁竞争按固定间隔重试
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_count, self.retry_delay)
    }
}

impl From<&RedisConfig> for LockConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.lock_ttl_ms),
            retry_count: config.lock_retry_count,
            retry_delay: Duration::from_millis(config.lock_retry_delay_ms),
        }
    }
}

/// 规则集与远端存储之间的绑定
#[derive(Clone)]
pub struct Binding {
    store: Arc<dyn StateStore>,
    ruleset: String,
    /// 实例唯一标识，用于区分不同进程持有的锁
    instance_id: String,
    config: LockConfig,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("ruleset", &self.ruleset)
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Binding {
    pub fn new(store: Arc<dyn StateStore>, ruleset: &str, config: LockConfig) -> Self {
        Self {
            store,
            ruleset: ruleset.to_string(),
            instance_id: Uuid::new_v4().to_string(),
            config,
        }
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn ruleset(&self) -> &str {
        &self.ruleset
    }

    pub fn load(&self, sid: &str) -> Result<Option<(StoredSession, u64)>> {
        self.store.load_session(&self.ruleset, sid)
    }

    pub fn version(&self, sid: &str) -> Result<u64> {
        self.store.session_version(&self.ruleset, sid)
    }

    pub fn save(&self, session: &StoredSession) -> Result<u64> {
        self.store.save_session(&self.ruleset, session)
    }

    pub fn schedule_timer(&self, timer: &Timer) -> Result<()> {
        self.store.schedule_timer(&self.ruleset, timer)
    }

    pub fn restore_timer(&self, timer: &Timer) -> Result<bool> {
        self.store.restore_timer(&self.ruleset, timer)
    }

    pub fn claim_due_timers(&self, now_ms: u64, limit: usize) -> Result<Vec<Timer>> {
        self.store.claim_due_timers(&self.ruleset, now_ms, limit)
    }

    /// 获取会话锁，重试次数用尽时返回 `LockTimeout`，存储错误直接返回
    pub fn lock_session(&self, sid: &str) -> Result<SessionLock> {
        let resource = format!("{}:{}", self.ruleset, sid);
        // owner 格式: instance_id:uuid
        let owner = format!("{}:{}", self.instance_id, Uuid::new_v4());

        retry_blocking(
            &self.config.retry_policy(),
            "lock_session",
            |e: &EngineError| matches!(e, EngineError::LockTimeout { .. }),
            |attempt| {
                if !self.store.try_lock(&resource, &owner, self.config.ttl)? {
                    return Err(EngineError::LockTimeout {
                        resource: resource.clone(),
                    });
                }
                debug!(resource = %resource, attempt, "会话锁已获取");
                Ok(SessionLock {
                    store: Arc::clone(&self.store),
                    resource: resource.clone(),
                    owner: owner.clone(),
                })
            },
        )
    }
}

/// 会话锁守卫，Drop 时释放
pub struct SessionLock {
    store: Arc<dyn StateStore>,
    resource: String,
    owner: String,
}

impl SessionLock {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        match self.store.unlock(&self.resource, &self.owner) {
            Ok(true) => debug!(resource = %self.resource, "会话锁已释放"),
            // 锁已过期或被其他实例持有，锁最终会通过 TTL 过期
            Ok(false) => warn!(
                resource = %self.resource,
                owner = %self.owner,
                "Lock was already released or owned by another client"
            ),
            Err(e) => warn!(resource = %self.resource, error = %e, "释放会话锁失败"),
        }
    }
}
