//! Redis 状态存储
//!
//! Key 布局：
//! - `{prefix}:{ruleset}:session:{sid}`    会话快照（JSON）
//! - `{prefix}:{ruleset}:version:{sid}`    会话版本号
//! - `{prefix}:lock:{resource}`            会话锁（SET NX PX）
//! - `{prefix}:{ruleset}:timers`           定时器有序集合，score 为触发时间
//! - `{prefix}:{ruleset}:timer_payloads`   定时器内容，field 与有序集合成员相同
//!
//! 引擎是同步的，这里使用同步连接，读写超时由配置决定。

use super::StateStore;
use crate::error::{EngineError, Result};
use crate::session::StoredSession;
use crate::timers::{Timer, duration_ms};
use cep_shared::config::RedisConfig;
use parking_lot::Mutex;
use redis::{Client, Connection};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 写入快照并递增版本号
const SAVE_SESSION_SCRIPT: &str = r#"
redis.call("SET", KEYS[1], ARGV[1])
return redis.call("INCR", KEYS[2])
"#;

/// 只有当锁的 owner 匹配时才删除
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// 取出到期定时器并删除，整个脚本原子执行
const CLAIM_TIMERS_SCRIPT: &str = r#"
local members = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, ARGV[2])
local claimed = {}
for _, member in ipairs(members) do
    redis.call("ZREM", KEYS[1], member)
    local payload = redis.call("HGET", KEYS[2], member)
    redis.call("HDEL", KEYS[2], member)
    if payload then
        table.insert(claimed, payload)
    end
end
return claimed
"#;

/// 定时器不存在时才放回，已被重新设置的同名定时器保持不变
const RESTORE_TIMER_SCRIPT: &str = r#"
if redis.call("ZSCORE", KEYS[1], ARGV[2]) then
    return 0
end
redis.call("ZADD", KEYS[1], ARGV[1], ARGV[2])
redis.call("HSET", KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

pub struct RedisStore {
    client: Client,
    password: Option<String>,
    timeout: Duration,
    prefix: String,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// 连接 Redis，地址不可达或认证失败时返回 `Connection`
    pub fn connect(config: &RedisConfig) -> Result<Self> {
        let url = format!("redis://{}:{}/", config.host, config.port);
        let client = Client::open(url.as_str())
            .map_err(|e| EngineError::Connection(format!("{}: {}", url, e)))?;

        let store = Self {
            client,
            password: config.password.clone().filter(|p| !p.is_empty()),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            prefix: config.key_prefix.clone(),
            conn: Mutex::new(None),
        };

        let conn = store.open_connection()?;
        *store.conn.lock() = Some(conn);
        info!(host = %config.host, port = config.port, "Redis state store connected");
        Ok(store)
    }

    fn open_connection(&self) -> Result<Connection> {
        let mut conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        conn.set_read_timeout(Some(self.timeout))
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        conn.set_write_timeout(Some(self.timeout))
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        if let Some(password) = &self.password {
            redis::cmd("AUTH")
                .arg(password)
                .query::<String>(&mut conn)
                .map_err(|e| EngineError::Connection(format!("认证失败: {}", e)))?;
        }

        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(conn)
    }

    /// 在共享连接上执行命令，连接断开后下次调用重新建立
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            debug!("重新建立 Redis 连接");
            *guard = Some(self.open_connection()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(EngineError::Internal("Redis 连接不可用".to_string()));
        };

        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    warn!(error = %e, "Redis 连接异常，丢弃当前连接");
                    *guard = None;
                }
                Err(EngineError::Redis(e))
            }
        }
    }

    fn session_key(&self, ruleset: &str, sid: &str) -> String {
        format!("{}:{}:session:{}", self.prefix, ruleset, sid)
    }

    fn version_key(&self, ruleset: &str, sid: &str) -> String {
        format!("{}:{}:version:{}", self.prefix, ruleset, sid)
    }

    fn lock_key(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }

    fn timers_key(&self, ruleset: &str) -> String {
        format!("{}:{}:timers", self.prefix, ruleset)
    }

    fn timer_payloads_key(&self, ruleset: &str) -> String {
        format!("{}:{}:timer_payloads", self.prefix, ruleset)
    }

    fn timer_member(timer: &Timer) -> Result<String> {
        serde_json::to_string(&(&timer.sid, &timer.name))
            .map_err(|e| EngineError::Internal(format!("定时器序列化失败: {}", e)))
    }
}

impl StateStore for RedisStore {
    fn load_session(&self, ruleset: &str, sid: &str) -> Result<Option<(StoredSession, u64)>> {
        let session_key = self.session_key(ruleset, sid);
        let version_key = self.version_key(ruleset, sid);
        let (data, version): (Option<String>, Option<u64>) = self.with_conn(|conn| {
            redis::cmd("MGET")
                .arg(&session_key)
                .arg(&version_key)
                .query(conn)
        })?;

        let Some(data) = data else {
            return Ok(None);
        };
        let session: StoredSession = serde_json::from_str(&data)
            .map_err(|e| EngineError::Corrupted(format!("{}: {}", session_key, e)))?;
        Ok(Some((session, version.unwrap_or(0))))
    }

    fn session_version(&self, ruleset: &str, sid: &str) -> Result<u64> {
        let key = self.version_key(ruleset, sid);
        let version: Option<u64> = self.with_conn(|conn| redis::cmd("GET").arg(&key).query(conn))?;
        Ok(version.unwrap_or(0))
    }

    fn save_session(&self, ruleset: &str, session: &StoredSession) -> Result<u64> {
        let data = serde_json::to_string(session)
            .map_err(|e| EngineError::Internal(format!("会话序列化失败: {}", e)))?;
        let session_key = self.session_key(ruleset, &session.sid);
        let version_key = self.version_key(ruleset, &session.sid);

        self.with_conn(|conn| {
            redis::cmd("EVAL")
                .arg(SAVE_SESSION_SCRIPT)
                .arg(2)
                .arg(&session_key)
                .arg(&version_key)
                .arg(&data)
                .query(conn)
        })
    }

    fn try_lock(&self, resource: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let key = self.lock_key(resource);
        // PX 只接受有符号 64 位毫秒数
        let ttl_ms = duration_ms(ttl).clamp(1, i64::MAX as u64);
        // SET NX 成功时返回 "OK"，失败时返回 nil
        let result: Option<String> = self.with_conn(|conn| {
            redis::cmd("SET")
                .arg(&key)
                .arg(owner)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query(conn)
        })?;
        Ok(result.is_some())
    }

    fn unlock(&self, resource: &str, owner: &str) -> Result<bool> {
        let key = self.lock_key(resource);
        let deleted: i32 = self.with_conn(|conn| {
            redis::cmd("EVAL")
                .arg(UNLOCK_SCRIPT)
                .arg(1)
                .arg(&key)
                .arg(owner)
                .query(conn)
        })?;
        Ok(deleted > 0)
    }

    fn schedule_timer(&self, ruleset: &str, timer: &Timer) -> Result<()> {
        let member = Self::timer_member(timer)?;
        let payload = serde_json::to_string(timer)
            .map_err(|e| EngineError::Internal(format!("定时器序列化失败: {}", e)))?;
        let timers_key = self.timers_key(ruleset);
        let payloads_key = self.timer_payloads_key(ruleset);

        self.with_conn(|conn| {
            redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(&timers_key)
                .arg(timer.fire_at_ms)
                .arg(&member)
                .ignore()
                .cmd("HSET")
                .arg(&payloads_key)
                .arg(&member)
                .arg(&payload)
                .ignore()
                .query::<()>(conn)
        })
    }

    fn restore_timer(&self, ruleset: &str, timer: &Timer) -> Result<bool> {
        let member = Self::timer_member(timer)?;
        let payload = serde_json::to_string(timer)
            .map_err(|e| EngineError::Internal(format!("定时器序列化失败: {}", e)))?;
        let timers_key = self.timers_key(ruleset);
        let payloads_key = self.timer_payloads_key(ruleset);

        let added: i64 = self.with_conn(|conn| {
            redis::cmd("EVAL")
                .arg(RESTORE_TIMER_SCRIPT)
                .arg(2)
                .arg(&timers_key)
                .arg(&payloads_key)
                .arg(timer.fire_at_ms)
                .arg(&member)
                .arg(&payload)
                .query(conn)
        })?;
        Ok(added == 1)
    }

    fn claim_due_timers(&self, ruleset: &str, now_ms: u64, limit: usize) -> Result<Vec<Timer>> {
        let timers_key = self.timers_key(ruleset);
        let payloads_key = self.timer_payloads_key(ruleset);
        let claimed: Vec<String> = self.with_conn(|conn| {
            redis::cmd("EVAL")
                .arg(CLAIM_TIMERS_SCRIPT)
                .arg(2)
                .arg(&timers_key)
                .arg(&payloads_key)
                .arg(now_ms)
                .arg(limit)
                .query(conn)
        })?;

        claimed
            .iter()
            .map(|raw| {
                serde_json::from_str::<Timer>(raw)
                    .map_err(|e| EngineError::Corrupted(format!("{}: {}", payloads_key, e)))
            })
            .collect()
    }
}
