//! 规则集：编译后的网络 + 会话缓存 + 动作队列 + 定时器
//!
//! 所有入口都以已解析的 JSON 文档为参数，字符串边界的解析由 [`crate::Engine`] 负责。
//! 传播产生的匹配在会话提交之后才进入动作队列。

use crate::actions::{AbandonPolicy, Abandoned, ActionQueue};
use crate::binding::Binding;
use crate::cache::SessionCache;
use crate::engine::ActionLease;
use crate::error::{EngineError, Result};
use crate::handle::ActionHandle;
use crate::network::{Activation, Network};
use crate::session::Session;
use crate::timers::{Clock, Timer, TimerSchedule, duration_ms};
use cep_shared::config::EngineConfig;
use cep_shared::observability::metrics;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// 规则集运行参数
#[derive(Debug, Clone)]
pub struct RulesetOptions {
    pub cache_capacity: usize,
    /// 动作租约超时，None 表示不超时
    pub lease_timeout: Option<Duration>,
    pub abandon_policy: AbandonPolicy,
    pub max_timers_per_sweep: usize,
}

impl RulesetOptions {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache_capacity,
            lease_timeout: None,
            abandon_policy: AbandonPolicy::default(),
            max_timers_per_sweep: 100,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let options = Self {
            cache_capacity: config.cache_capacity,
            lease_timeout: (config.lease_timeout_secs > 0)
                .then(|| Duration::from_secs(config.lease_timeout_secs)),
            abandon_policy: AbandonPolicy::parse(
                &config.abandon_policy,
                config.max_delivery_attempts,
            )?,
            max_timers_per_sweep: config.max_timers_per_sweep,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    pub fn with_abandon_policy(mut self, policy: AbandonPolicy) -> Self {
        self.abandon_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(EngineError::invalid_argument(
                "cache_capacity",
                "会话缓存容量必须大于 0",
            ));
        }
        if self.max_timers_per_sweep == 0 {
            return Err(EngineError::invalid_argument(
                "max_timers_per_sweep",
                "必须大于 0",
            ));
        }
        Ok(())
    }
}

/// 规则集统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulesetStats {
    pub name: String,
    pub rules: usize,
    pub alpha_nodes: usize,
    pub productions: usize,
    pub resident_sessions: usize,
    pub pending_actions: usize,
    pub leased_actions: usize,
    /// 本地定时器数（绑定后定时器存放在远端）
    pub local_timers: usize,
    pub bound: bool,
}

pub(crate) fn ensure_object(document: &Value) -> Result<()> {
    if document.is_object() {
        Ok(())
    } else {
        Err(EngineError::InvalidDocument(format!(
            "文档必须是 JSON 对象: {}",
            document
        )))
    }
}

pub struct Ruleset {
    name: String,
    network: Network,
    options: RulesetOptions,
    sessions: SessionCache,
    actions: ActionQueue,
    timers: TimerSchedule,
    binding: RwLock<Option<Binding>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Ruleset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ruleset")
            .field("name", &self.name)
            .field("rules", &self.network.rule_count())
            .field("options", &self.options)
            .finish()
    }
}

impl Ruleset {
    pub fn new(
        name: &str,
        network: Network,
        options: RulesetOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            name: name.to_string(),
            sessions: SessionCache::new(name, options.cache_capacity),
            actions: ActionQueue::new(name, options.lease_timeout, options.abandon_policy),
            timers: TimerSchedule::new(),
            binding: RwLock::new(None),
            network,
            options,
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn options(&self) -> &RulesetOptions {
        &self.options
    }

    pub fn is_bound(&self) -> bool {
        self.binding.read().is_some()
    }

    /// 在会话上执行一次修改，提交后把产生的匹配加入动作队列
    fn mutate<R>(
        &self,
        sid: &str,
        f: impl FnOnce(&Network, &mut Session) -> (R, Vec<Activation>),
    ) -> Result<R> {
        let binding = self.binding.read_recursive();
        let (result, activations) =
            self.sessions
                .with_session(sid, binding.as_ref(), &self.network, |session| {
                    Ok(f(&self.network, session))
                })?;
        self.actions.enqueue(sid, &self.network, activations)?;
        Ok(result)
    }

    fn record(&self, kind: &str, handled: bool, started: Instant) {
        metrics::record_assertion(&self.name, kind, handled, started.elapsed().as_secs_f64());
    }

    #[instrument(skip(self, event), fields(ruleset = %self.name))]
    pub fn assert_event(&self, sid: &str, event: Value) -> Result<bool> {
        ensure_object(&event)?;
        let started = Instant::now();
        let handled = self.mutate(sid, |network, session| {
            let p = session.assert_event(network, event);
            (p.handled, p.activations)
        })?;
        self.record("event", handled, started);
        debug!(handled, "事件已处理");
        Ok(handled)
    }

    #[instrument(skip(self, events), fields(ruleset = %self.name, count = events.len()))]
    pub fn assert_events(&self, sid: &str, events: Vec<Value>) -> Result<Vec<bool>> {
        events.iter().try_for_each(ensure_object)?;
        let started = Instant::now();
        let outcomes = self.mutate(sid, |network, session| {
            let mut outcomes = Vec::with_capacity(events.len());
            let mut activations = Vec::new();
            for event in events {
                let p = session.assert_event(network, event);
                outcomes.push(p.handled);
                activations.extend(p.activations);
            }
            (outcomes, activations)
        })?;
        self.record("event", outcomes.iter().any(|h| *h), started);
        Ok(outcomes)
    }

    #[instrument(skip(self, fact), fields(ruleset = %self.name))]
    pub fn assert_fact(&self, sid: &str, fact: Value) -> Result<bool> {
        ensure_object(&fact)?;
        let started = Instant::now();
        let handled = self.mutate(sid, |network, session| {
            let p = session.assert_fact(network, fact);
            (p.handled, p.activations)
        })?;
        self.record("fact", handled, started);
        debug!(handled, "事实已断言");
        Ok(handled)
    }

    #[instrument(skip(self, facts), fields(ruleset = %self.name, count = facts.len()))]
    pub fn assert_facts(&self, sid: &str, facts: Vec<Value>) -> Result<Vec<bool>> {
        facts.iter().try_for_each(ensure_object)?;
        let started = Instant::now();
        let outcomes = self.mutate(sid, |network, session| {
            let mut outcomes = Vec::with_capacity(facts.len());
            let mut activations = Vec::new();
            for fact in facts {
                let p = session.assert_fact(network, fact);
                outcomes.push(p.handled);
                activations.extend(p.activations);
            }
            (outcomes, activations)
        })?;
        self.record("fact", outcomes.iter().any(|h| *h), started);
        Ok(outcomes)
    }

    /// 撤回事实，事实不存在时返回 false
    #[instrument(skip(self, fact), fields(ruleset = %self.name))]
    pub fn retract_fact(&self, sid: &str, fact: Value) -> Result<bool> {
        ensure_object(&fact)?;
        let started = Instant::now();
        let removed = self.mutate(sid, |_, session| (session.retract_fact(&fact), Vec::new()))?;
        self.record("retract", removed, started);
        Ok(removed)
    }

    #[instrument(skip(self, facts), fields(ruleset = %self.name, count = facts.len()))]
    pub fn retract_facts(&self, sid: &str, facts: Vec<Value>) -> Result<Vec<bool>> {
        facts.iter().try_for_each(ensure_object)?;
        let started = Instant::now();
        let outcomes = self.mutate(sid, |_, session| {
            let outcomes: Vec<bool> = facts.iter().map(|f| session.retract_fact(f)).collect();
            (outcomes, Vec::new())
        })?;
        self.record("retract", outcomes.iter().any(|h| *h), started);
        Ok(outcomes)
    }

    /// 合并会话状态并重新参与匹配
    #[instrument(skip(self, state), fields(ruleset = %self.name))]
    pub fn assert_state(&self, sid: &str, state: Value) -> Result<bool> {
        let Value::Object(patch) = state else {
            return Err(EngineError::InvalidDocument("状态必须是 JSON 对象".to_string()));
        };
        let started = Instant::now();
        let handled = self.mutate(sid, |network, session| {
            let p = session.merge_state(network, patch);
            (p.handled, p.activations)
        })?;
        self.record("state", handled, started);
        Ok(handled)
    }

    /// 会话状态，会话不存在时返回只含 sid 的初始状态
    pub fn get_state(&self, sid: &str) -> Result<Value> {
        let binding = self.binding.read_recursive();
        let state = self
            .sessions
            .read_session(sid, binding.as_ref(), &self.network, Session::state)?;
        Ok(state.unwrap_or_else(|| json!({ "sid": sid })))
    }

    pub fn facts(&self, sid: &str) -> Result<Vec<Value>> {
        let binding = self.binding.read_recursive();
        let facts = self
            .sessions
            .read_session(sid, binding.as_ref(), &self.network, Session::facts)?;
        Ok(facts.unwrap_or_default())
    }

    /// 租用一个待执行动作，没有可用动作时返回 None
    #[instrument(skip(self), fields(ruleset = %self.name))]
    pub fn start_action(&self) -> Result<Option<ActionLease>> {
        let Some((handle, record)) = self.actions.lease(self.clock.now_ms()) else {
            return Ok(None);
        };

        match self.get_state(&record.sid) {
            Ok(state) => {
                debug!(sid = %record.sid, rule = %record.rule, action = ?handle, "动作已租出");
                Ok(Some(ActionLease {
                    handle,
                    sid: record.sid,
                    rule: record.rule,
                    action: record.action,
                    state,
                    messages: Value::Object(record.messages),
                }))
            }
            Err(e) => {
                warn!(sid = %record.sid, error = %e, "读取会话状态失败，动作退回队列");
                self.actions.restore(handle);
                Err(e)
            }
        }
    }

    /// 完成动作：把结果状态合并回会话，失败时租约保持不变
    #[instrument(skip(self, state), fields(ruleset = %self.name))]
    pub fn complete_action(&self, handle: ActionHandle, state: Value) -> Result<()> {
        let Value::Object(patch) = state else {
            return Err(EngineError::InvalidDocument("状态必须是 JSON 对象".to_string()));
        };
        let record = self.actions.begin_complete(handle)?;

        let binding = self.binding.read_recursive();
        let applied = self
            .sessions
            .with_session(&record.sid, binding.as_ref(), &self.network, |session| {
                Ok(session.merge_state(&self.network, patch).activations)
            });

        match applied {
            Ok(activations) => {
                self.actions.finish_complete(handle);
                self.actions.enqueue(&record.sid, &self.network, activations)?;
                debug!(sid = %record.sid, rule = %record.rule, "动作已完成");
                Ok(())
            }
            Err(e) => {
                self.actions.revert_complete(handle);
                warn!(sid = %record.sid, error = %e, "写回动作结果失败，租约已恢复");
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(ruleset = %self.name))]
    pub fn abandon_action(&self, handle: ActionHandle) -> Result<Abandoned> {
        self.actions.abandon(handle)
    }

    /// 设置定时器，同一会话同名定时器被替换
    #[instrument(skip(self, payload), fields(ruleset = %self.name))]
    pub fn start_timer(&self, sid: &str, duration: Duration, name: &str, payload: Value) -> Result<()> {
        if name.is_empty() {
            return Err(EngineError::invalid_argument("name", "定时器名称不能为空"));
        }
        let timer = Timer {
            sid: sid.to_string(),
            name: name.to_string(),
            fire_at_ms: self
                .clock
                .now_ms()
                .saturating_add(duration_ms(duration)),
            payload,
        };

        let binding = self.binding.read_recursive();
        match binding.as_ref() {
            Some(binding) => binding.schedule_timer(&timer)?,
            None => self.timers.schedule(timer),
        }
        Ok(())
    }

    /// 触发到期的定时器，返回是否有定时器被触发
    #[instrument(skip(self), fields(ruleset = %self.name))]
    pub fn sweep_timers(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        let limit = self.options.max_timers_per_sweep;
        let binding = self.binding.read_recursive();

        let due = match binding.as_ref() {
            Some(binding) => binding.claim_due_timers(now, limit)?,
            None => self.timers.take_due(now, limit),
        };
        if due.is_empty() {
            return Ok(false);
        }

        let total = due.len();
        let mut pending = due.into_iter();
        while let Some(timer) = pending.next() {
            let fired = self.mutate(&timer.sid, |network, session| {
                let p = session.assert_event(network, timer.event());
                ((), p.activations)
            });

            if let Err(e) = fired {
                // 未处理的定时器放回，下次扫描重试；期间被重新设置的同名定时器优先
                warn!(sid = %timer.sid, timer = %timer.name, error = %e, "定时器触发失败");
                for timer in std::iter::once(timer).chain(pending) {
                    let restored = match binding.as_ref() {
                        Some(binding) => binding.restore_timer(&timer),
                        None => Ok(self.timers.restore(timer.clone())),
                    };
                    match restored {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(sid = %timer.sid, timer = %timer.name, "定时器已被重新设置，不再放回");
                        }
                        Err(e) => {
                            warn!(sid = %timer.sid, timer = %timer.name, error = %e, "定时器无法放回，已丢失");
                        }
                    }
                }
                return Err(e);
            }
        }

        metrics::record_timers_fired(&self.name, total);
        debug!(fired = total, "定时器已触发");
        Ok(true)
    }

    /// 绑定远端存储：写出常驻会话与本地定时器
    #[instrument(skip(self, binding), fields(ruleset = %self.name))]
    pub fn bind(&self, binding: Binding) -> Result<()> {
        let mut current = self.binding.write();
        let flushed = self.sessions.flush_all(&binding)?;

        let mut timers = self.timers.drain_all().into_iter();
        let mut migrated = 0;
        while let Some(timer) = timers.next() {
            if let Err(e) = binding.schedule_timer(&timer) {
                self.timers.schedule(timer);
                timers.for_each(|t| self.timers.schedule(t));
                return Err(e);
            }
            migrated += 1;
        }

        *current = Some(binding);
        info!(sessions = flushed, timers = migrated, "规则集已绑定远端存储");
        Ok(())
    }

    pub fn stats(&self) -> RulesetStats {
        RulesetStats {
            name: self.name.clone(),
            rules: self.network.rule_count(),
            alpha_nodes: self.network.alpha_count(),
            productions: self.network.production_count(),
            resident_sessions: self.sessions.resident_count(),
            pending_actions: self.actions.pending_count(),
            leased_actions: self.actions.leased_count(),
            local_timers: self.timers.len(),
            bound: self.is_bound(),
        }
    }

    /// 丢弃本地的会话、动作与定时器，远端数据不受影响
    pub fn clear(&self) {
        self.sessions.clear();
        self.actions.clear();
        self.timers.clear();
    }
}
