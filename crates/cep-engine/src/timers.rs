//! 定时器与时钟
//!
//! 引擎内部没有后台线程，定时器只在调用方执行 sweep 时触发。
//! 同一会话同名定时器重新设置时替换旧的定时器。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 时长换算为毫秒，超出 u64 时取 u64::MAX
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// 时间来源（毫秒时间戳）
pub trait Clock: Send + Sync + Debug {
    fn now_ms(&self) -> u64;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// 手动推进的时钟，用于确定性测试与回放
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub sid: String,
    pub name: String,
    pub fire_at_ms: u64,
    #[serde(default)]
    pub payload: Value,
}

impl Timer {
    /// 定时器触发时断言的事件：payload 加上 `$timer` 字段
    pub fn event(&self) -> Value {
        let mut event = match &self.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        event.insert("$timer".to_string(), Value::String(self.name.clone()));
        Value::Object(event)
    }
}

type TimerKey = (u64, u64);

#[derive(Debug, Default)]
struct ScheduleInner {
    seq: u64,
    due: BTreeMap<TimerKey, Timer>,
    by_name: HashMap<(String, String), TimerKey>,
}

/// 本地定时器表（未绑定远端存储时使用）
#[derive(Debug, Default)]
pub struct TimerSchedule {
    inner: Mutex<ScheduleInner>,
}

impl TimerSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, timer: Timer) {
        let mut inner = self.inner.lock();
        let name_key = (timer.sid.clone(), timer.name.clone());
        if let Some(old) = inner.by_name.remove(&name_key) {
            inner.due.remove(&old);
        }

        inner.seq += 1;
        let key = (timer.fire_at_ms, inner.seq);
        inner.due.insert(key, timer);
        inner.by_name.insert(name_key, key);
    }

    /// 放回已取出但未处理的定时器，同名定时器已被重新设置时不覆盖
    pub fn restore(&self, timer: Timer) -> bool {
        let mut inner = self.inner.lock();
        let name_key = (timer.sid.clone(), timer.name.clone());
        if inner.by_name.contains_key(&name_key) {
            return false;
        }

        inner.seq += 1;
        let key = (timer.fire_at_ms, inner.seq);
        inner.due.insert(key, timer);
        inner.by_name.insert(name_key, key);
        true
    }

    /// 取出到期的定时器，按触发时间排序，最多 `limit` 个
    pub fn take_due(&self, now_ms: u64, limit: usize) -> Vec<Timer> {
        let mut inner = self.inner.lock();
        let keys: Vec<TimerKey> = inner
            .due
            .range(..=(now_ms, u64::MAX))
            .take(limit)
            .map(|(key, _)| *key)
            .collect();

        let mut fired = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(timer) = inner.due.remove(&key) {
                inner.by_name.remove(&(timer.sid.clone(), timer.name.clone()));
                fired.push(timer);
            }
        }
        fired
    }

    /// 取出全部定时器（绑定远端存储时迁移使用）
    pub fn drain_all(&self) -> Vec<Timer> {
        let mut inner = self.inner.lock();
        inner.by_name.clear();
        std::mem::take(&mut inner.due).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.due.clear();
        inner.by_name.clear();
    }
}
