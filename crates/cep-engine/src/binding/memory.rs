//! 进程内状态存储
//!
//! 与 Redis 存储语义一致，可在多个引擎实例之间共享，用于测试与单机部署。
//! `set_available(false)` 模拟远端不可达。

use super::StateStore;
use crate::error::{EngineError, Result};
use crate::session::StoredSession;
use crate::timers::Timer;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct MemoryState {
    available: bool,
    sessions: HashMap<(String, String), (StoredSession, u64)>,
    locks: HashMap<String, (String, Instant)>,
    /// ruleset -> (sid, name) -> timer
    timers: HashMap<String, BTreeMap<(String, String), Timer>>,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                available: true,
                ..Default::default()
            }),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn timer_count(&self, ruleset: &str) -> usize {
        self.state
            .lock()
            .timers
            .get(ruleset)
            .map_or(0, BTreeMap::len)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn check(state: &MemoryState) -> Result<()> {
        if state.available {
            Ok(())
        } else {
            Err(EngineError::Connection("内存存储不可用".to_string()))
        }
    }
}

impl StateStore for MemoryStore {
    fn load_session(&self, ruleset: &str, sid: &str) -> Result<Option<(StoredSession, u64)>> {
        let state = self.state.lock();
        Self::check(&state)?;
        Ok(state
            .sessions
            .get(&(ruleset.to_string(), sid.to_string()))
            .cloned())
    }

    fn session_version(&self, ruleset: &str, sid: &str) -> Result<u64> {
        let state = self.state.lock();
        Self::check(&state)?;
        Ok(state
            .sessions
            .get(&(ruleset.to_string(), sid.to_string()))
            .map_or(0, |(_, version)| *version))
    }

    fn save_session(&self, ruleset: &str, session: &StoredSession) -> Result<u64> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        let key = (ruleset.to_string(), session.sid.clone());
        let version = state.sessions.get(&key).map_or(0, |(_, v)| *v) + 1;
        state.sessions.insert(key, (session.clone(), version));
        Ok(version)
    }

    fn try_lock(&self, resource: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        let now = Instant::now();
        if let Some((_, expires_at)) = state.locks.get(resource) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state
            .locks
            .insert(resource.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    fn unlock(&self, resource: &str, owner: &str) -> Result<bool> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        match state.locks.get(resource) {
            Some((holder, _)) if holder == owner => {
                state.locks.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn schedule_timer(&self, ruleset: &str, timer: &Timer) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        state
            .timers
            .entry(ruleset.to_string())
            .or_default()
            .insert((timer.sid.clone(), timer.name.clone()), timer.clone());
        Ok(())
    }

    fn restore_timer(&self, ruleset: &str, timer: &Timer) -> Result<bool> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        let timers = state.timers.entry(ruleset.to_string()).or_default();
        let key = (timer.sid.clone(), timer.name.clone());
        if timers.contains_key(&key) {
            return Ok(false);
        }
        timers.insert(key, timer.clone());
        Ok(true)
    }

    fn claim_due_timers(&self, ruleset: &str, now_ms: u64, limit: usize) -> Result<Vec<Timer>> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        let Some(timers) = state.timers.get_mut(ruleset) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<((String, String), u64)> = timers
            .iter()
            .filter(|(_, t)| t.fire_at_ms <= now_ms)
            .map(|(key, t)| (key.clone(), t.fire_at_ms))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due.truncate(limit);

        Ok(due
            .into_iter()
            .filter_map(|(key, _)| timers.remove(&key))
            .collect())
    }
}
