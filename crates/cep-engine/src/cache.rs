//! 有界会话缓存
//!
//! - 按 LRU 淘汰，容量满时淘汰最久未使用且当前没有被调用方占用的会话
//! - 同一 sid 的修改在会话槽位锁内串行执行，不同 sid 互不阻塞
//! - 只读访问不创建会话，也不会触发淘汰
//! - 未绑定：淘汰即丢弃会话
//! - 已绑定：每次提交都在远端会话锁内写穿，淘汰只释放内存；
//!   修改先作用于副本，远端写入成功后才替换本地会话

use crate::binding::Binding;
use crate::error::Result;
use crate::network::Network;
use crate::session::Session;
use cep_shared::observability::metrics;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct SlotInner {
    session: Option<Session>,
    /// 槽位已从索引中移除，持有旧 Arc 的调用方需要重新获取
    evicted: bool,
}

#[derive(Debug, Default)]
struct SessionSlot {
    inner: Mutex<SlotInner>,
}

#[derive(Debug, Default)]
struct CacheIndex {
    tick: u64,
    entries: HashMap<String, (Arc<SessionSlot>, u64)>,
    /// 最近使用时间 -> sid
    order: BTreeMap<u64, String>,
}

impl CacheIndex {
    /// 只更新已有槽位的使用时间
    fn touch_existing(&mut self, sid: &str) -> Option<Arc<SessionSlot>> {
        if self.entries.contains_key(sid) {
            Some(self.touch(sid))
        } else {
            None
        }
    }

    fn touch(&mut self, sid: &str) -> Arc<SessionSlot> {
        self.tick += 1;
        let tick = self.tick;

        if let Some((slot, last)) = self.entries.get_mut(sid) {
            self.order.remove(&*last);
            *last = tick;
            self.order.insert(tick, sid.to_string());
            return Arc::clone(slot);
        }

        let slot = Arc::new(SessionSlot::default());
        self.entries
            .insert(sid.to_string(), (Arc::clone(&slot), tick));
        self.order.insert(tick, sid.to_string());
        slot
    }
}

#[derive(Debug)]
pub struct SessionCache {
    ruleset: String,
    capacity: usize,
    index: Mutex<CacheIndex>,
}

impl SessionCache {
    pub fn new(ruleset: &str, capacity: usize) -> Self {
        Self {
            ruleset: ruleset.to_string(),
            capacity,
            index: Mutex::new(CacheIndex::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resident_count(&self) -> usize {
        self.index.lock().entries.len()
    }

    /// 在 sid 的会话上执行 `f`，会话不存在时创建（已绑定时先从远端加载）
    pub fn with_session<R>(
        &self,
        sid: &str,
        binding: Option<&Binding>,
        network: &Network,
        f: impl FnOnce(&mut Session) -> Result<R>,
    ) -> Result<R> {
        loop {
            let slot = self.index.lock().touch(sid);
            let mut inner = slot.inner.lock();
            if inner.evicted {
                continue;
            }

            let result = match binding {
                None => {
                    let session = inner
                        .session
                        .get_or_insert_with(|| Session::new(network, sid));
                    f(session)
                }
                Some(binding) => Self::write_through(&mut inner, sid, binding, network, f),
            };
            drop(inner);

            self.evict_over_capacity(sid, binding.is_some());
            return result;
        }
    }

    /// 只读访问 sid 的会话，会话不存在时返回 None
    ///
    /// 未常驻的会话不会被放入缓存：未绑定时视为不存在，已绑定时直接读取远端快照。
    pub fn read_session<R>(
        &self,
        sid: &str,
        binding: Option<&Binding>,
        network: &Network,
        f: impl FnOnce(&Session) -> R,
    ) -> Result<Option<R>> {
        loop {
            let Some(slot) = self.index.lock().touch_existing(sid) else {
                let Some(binding) = binding else {
                    return Ok(None);
                };
                return Ok(binding
                    .load(sid)?
                    .map(|(stored, version)| f(&Session::restore(network, stored, version))));
            };

            let mut inner = slot.inner.lock();
            if inner.evicted {
                continue;
            }
            return match binding {
                None => Ok(inner.session.as_ref().map(f)),
                Some(binding) => {
                    Self::write_through(&mut inner, sid, binding, network, |s| Ok(f(&*s))).map(Some)
                }
            };
        }
    }

    fn write_through<R>(
        inner: &mut SlotInner,
        sid: &str,
        binding: &Binding,
        network: &Network,
        f: impl FnOnce(&mut Session) -> Result<R>,
    ) -> Result<R> {
        let _lock = binding.lock_session(sid)?;
        let remote_version = binding.version(sid)?;

        let mut working = match inner.session.as_ref() {
            Some(session) if session.version == remote_version => session.clone(),
            _ => match binding.load(sid)? {
                Some((stored, version)) => {
                    debug!(sid, version, "从远端加载会话");
                    Session::restore(network, stored, version)
                }
                None => Session::new(network, sid),
            },
        };

        let result = f(&mut working)?;
        if working.dirty {
            working.version = binding.save(&working.snapshot())?;
            working.dirty = false;
        }
        inner.session = Some(working);
        Ok(result)
    }

    /// 淘汰超出容量的会话，跳过当前 sid 和正在被占用的会话
    fn evict_over_capacity(&self, current: &str, bound: bool) {
        let mut index = self.index.lock();
        if index.entries.len() > self.capacity {
            let candidates: Vec<(u64, String)> = index
                .order
                .iter()
                .filter(|(_, sid)| sid.as_str() != current)
                .map(|(tick, sid)| (*tick, sid.clone()))
                .collect();

            for (tick, sid) in candidates {
                if index.entries.len() <= self.capacity {
                    break;
                }
                let Some((slot, _)) = index.entries.get(&sid) else {
                    continue;
                };
                let Some(mut inner) = slot.inner.try_lock() else {
                    continue;
                };

                inner.evicted = true;
                let session = inner.session.take();
                drop(inner);
                index.entries.remove(&sid);
                index.order.remove(&tick);

                let facts = session.as_ref().map_or(0, Session::fact_count);
                if !bound && facts > 0 {
                    warn!(ruleset = %self.ruleset, sid = %sid, facts, "会话被淘汰，事实已丢弃");
                } else {
                    debug!(ruleset = %self.ruleset, sid = %sid, "会话被淘汰");
                }
                metrics::record_session_eviction(&self.ruleset, bound);
            }
        }
        metrics::set_resident_sessions(&self.ruleset, index.entries.len());
    }

    /// 将所有常驻会话写入远端（绑定时调用）
    pub fn flush_all(&self, binding: &Binding) -> Result<usize> {
        let slots: Vec<Arc<SessionSlot>> = self
            .index
            .lock()
            .entries
            .values()
            .map(|(slot, _)| Arc::clone(slot))
            .collect();

        let mut flushed = 0;
        for slot in slots {
            let mut inner = slot.inner.lock();
            if inner.evicted {
                continue;
            }
            let Some(session) = inner.session.as_mut() else {
                continue;
            };
            let _lock = binding.lock_session(session.sid())?;
            session.version = binding.save(&session.snapshot())?;
            session.dirty = false;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// 丢弃所有常驻会话
    pub fn clear(&self) {
        let mut index = self.index.lock();
        for (slot, _) in index.entries.values() {
            let mut inner = slot.inner.lock();
            inner.evicted = true;
            inner.session = None;
        }
        index.entries.clear();
        index.order.clear();
        metrics::set_resident_sessions(&self.ruleset, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{LockConfig, MockStateStore, StateStore};
    use crate::binding::memory::MemoryStore;
    use crate::compiler::RulesetCompiler;
    use crate::error::EngineError;
    use serde_json::json;
    use std::time::Duration;

    fn network() -> Network {
        RulesetCompiler::compile_from_json(
            r#"{"hot": {"all": [{"source": "fact", "when": {"type": "condition", "field": "t", "operator": "gt", "value": 10}}]}}"#,
        )
        .unwrap()
    }

    fn binding(store: Arc<dyn StateStore>) -> Binding {
        Binding::new(
            store,
            "r",
            LockConfig {
                ttl: Duration::from_secs(1),
                retry_count: 1,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    fn facts(cache: &SessionCache, sid: &str, binding: Option<&Binding>, net: &Network) -> usize {
        cache
            .with_session(sid, binding, net, |s| Ok(s.fact_count()))
            .unwrap()
    }

    #[test]
    fn test_lru_eviction_discards_when_unbound() {
        let net = network();
        let cache = SessionCache::new("r", 2);
        for sid in ["a", "b"] {
            cache
                .with_session(sid, None, &net, |s| Ok(s.assert_fact(&net, json!({"t": 20}))))
                .unwrap();
        }
        // 访问 a，使 b 成为最久未使用
        assert_eq!(facts(&cache, "a", None, &net), 1);
        assert_eq!(facts(&cache, "c", None, &net), 0);

        assert_eq!(cache.resident_count(), 2);
        assert_eq!(facts(&cache, "a", None, &net), 1);
        // b 已被淘汰，重新创建后为空
        assert_eq!(facts(&cache, "b", None, &net), 0);
    }

    #[test]
    fn test_write_through_survives_eviction() {
        let net = network();
        let store = Arc::new(MemoryStore::new());
        let binding = binding(store.clone());
        let cache = SessionCache::new("r", 1);

        cache
            .with_session("a", Some(&binding), &net, |s| {
                Ok(s.assert_fact(&net, json!({"t": 20})))
            })
            .unwrap();
        assert_eq!(facts(&cache, "b", Some(&binding), &net), 0);
        assert_eq!(cache.resident_count(), 1);

        // a 从远端重新加载
        assert_eq!(facts(&cache, "a", Some(&binding), &net), 1);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_failed_remote_write_leaves_session_untouched() {
        let net = network();
        let store = Arc::new(MemoryStore::new());
        let binding = binding(store.clone());
        let cache = SessionCache::new("r", 4);

        cache
            .with_session("a", Some(&binding), &net, |s| {
                Ok(s.assert_fact(&net, json!({"t": 20})))
            })
            .unwrap();

        store.set_available(false);
        let err = cache
            .with_session("a", Some(&binding), &net, |s| {
                Ok(s.assert_fact(&net, json!({"t": 30})))
            })
            .unwrap_err();
        assert!(err.is_retryable());

        store.set_available(true);
        assert_eq!(facts(&cache, "a", Some(&binding), &net), 1);
    }

    #[test]
    fn test_save_error_from_mock_store() {
        let net = network();
        let mut store = MockStateStore::new();
        store.expect_try_lock().returning(|_, _, _| Ok(true));
        store.expect_unlock().returning(|_, _| Ok(true));
        store.expect_session_version().returning(|_, _| Ok(0));
        store.expect_load_session().returning(|_, _| Ok(None));
        store
            .expect_save_session()
            .times(1)
            .returning(|_, _| Err(EngineError::Connection("timeout".to_string())));

        let binding = binding(Arc::new(store));
        let cache = SessionCache::new("r", 4);
        let err = cache
            .with_session("a", Some(&binding), &net, |s| {
                Ok(s.assert_fact(&net, json!({"t": 20})))
            })
            .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
    }

    #[test]
    fn test_remote_change_is_reloaded() {
        let net = network();
        let store = Arc::new(MemoryStore::new());
        let first = SessionCache::new("r", 4);
        let second = SessionCache::new("r", 4);
        let b1 = binding(store.clone());
        let b2 = binding(store.clone());

        assert_eq!(facts(&first, "a", Some(&b1), &net), 0);
        second
            .with_session("a", Some(&b2), &net, |s| {
                Ok(s.assert_fact(&net, json!({"t": 20})))
            })
            .unwrap();
        assert_eq!(facts(&first, "a", Some(&b1), &net), 1);
    }

    #[test]
    fn test_flush_all_and_clear() {
        let net = network();
        let cache = SessionCache::new("r", 4);
        for sid in ["a", "b"] {
            cache
                .with_session(sid, None, &net, |s| Ok(s.assert_fact(&net, json!({"t": 20}))))
                .unwrap();
        }

        let store = Arc::new(MemoryStore::new());
        assert_eq!(cache.flush_all(&binding(store.clone())).unwrap(), 2);
        assert_eq!(store.session_count(), 2);

        cache.clear();
        assert_eq!(cache.resident_count(), 0);
    }
}
