//! 引擎上下文：规则集注册表与字符串边界
//!
//! 所有对外操作都通过 `Engine` 完成，文档以 JSON 字符串传入传出。
//! 规则集句柄带代数校验，删除后旧句柄返回 `InvalidHandle`。
//! 每次调用在执行期间持有规则集的 `Arc`，删除时据此判断规则集是否正被使用。

use crate::binding::redis_store::RedisStore;
use crate::binding::{Binding, LockConfig, StateStore};
use crate::compiler::RulesetCompiler;
use crate::error::{EngineError, Result};
use crate::handle::{ActionHandle, Arena, RulesetHandle};
use crate::ruleset::{Ruleset, RulesetOptions, RulesetStats, ensure_object};
use crate::timers::{Clock, SystemClock};
use cep_shared::config::RedisConfig;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// 断言结果：未命中是正常结果，不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    NotHandled,
}

impl Outcome {
    pub fn is_handled(self) -> bool {
        self == Self::Handled
    }
}

impl From<bool> for Outcome {
    fn from(handled: bool) -> Self {
        if handled {
            Self::Handled
        } else {
            Self::NotHandled
        }
    }
}

/// 租出的动作
#[derive(Debug, Clone)]
pub struct ActionLease {
    pub handle: ActionHandle,
    pub sid: String,
    pub rule: String,
    pub action: String,
    /// 租出时的会话状态
    pub state: Value,
    /// 模式别名 -> 匹配的文档
    pub messages: Value,
}

impl ActionLease {
    pub fn state_document(&self) -> String {
        self.state.to_string()
    }

    pub fn messages_document(&self) -> String {
        self.messages.to_string()
    }
}

pub struct Engine {
    rulesets: RwLock<Arena<Arc<Ruleset>>>,
    names: DashMap<String, RulesetHandle>,
    clock: Arc<dyn Clock>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// 使用指定时钟（测试或回放时使用手动时钟）
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rulesets: RwLock::new(Arena::new()),
            names: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn ruleset_names(&self) -> Vec<String> {
        self.names.iter().map(|r| r.key().clone()).collect()
    }

    // ==================== 规则集管理 ====================

    #[instrument(skip(self, definition))]
    pub fn create_ruleset(
        &self,
        name: &str,
        definition: &str,
        cache_capacity: usize,
    ) -> Result<RulesetHandle> {
        self.create_ruleset_with_options(name, definition, RulesetOptions::new(cache_capacity))
    }

    #[instrument(skip(self, definition, options))]
    pub fn create_ruleset_with_options(
        &self,
        name: &str,
        definition: &str,
        options: RulesetOptions,
    ) -> Result<RulesetHandle> {
        if name.is_empty() {
            return Err(EngineError::invalid_argument("name", "规则集名称不能为空"));
        }
        let network = RulesetCompiler::compile_from_json(definition)?;
        let ruleset = Ruleset::new(name, network, options, Arc::clone(&self.clock))?;

        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => {
                warn!("规则集已存在: {}", name);
                Err(EngineError::DuplicateName {
                    name: name.to_string(),
                })
            }
            Entry::Vacant(entry) => {
                let rules = ruleset.network().rule_count();
                let key = self.rulesets.write().insert(Arc::new(ruleset))?;
                let handle = RulesetHandle(key);
                entry.insert(handle);
                info!(handle = %handle, rules, "规则集已创建: {}", name);
                Ok(handle)
            }
        }
    }

    /// 删除规则集，其他调用正在使用时返回 `Busy`
    #[instrument(skip(self))]
    pub fn delete_ruleset(&self, handle: RulesetHandle) -> Result<()> {
        let ruleset = {
            let mut rulesets = self.rulesets.write();
            let Some(ruleset) = rulesets.get(handle.0) else {
                return Err(EngineError::InvalidHandle(handle.to_string()));
            };
            if Arc::strong_count(ruleset) > 1 {
                return Err(EngineError::Busy {
                    name: ruleset.name().to_string(),
                });
            }
            rulesets
                .remove(handle.0)
                .ok_or_else(|| EngineError::InvalidHandle(handle.to_string()))?
        };

        self.names.remove_if(ruleset.name(), |_, h| *h == handle);
        ruleset.clear();
        info!("规则集已删除: {}", ruleset.name());
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<RulesetHandle> {
        self.names.get(name).map(|h| *h)
    }

    /// 取得规则集，调用方持有期间规则集不能被删除
    pub fn ruleset(&self, handle: RulesetHandle) -> Result<Arc<Ruleset>> {
        self.rulesets
            .read()
            .get(handle.0)
            .cloned()
            .ok_or_else(|| EngineError::InvalidHandle(handle.to_string()))
    }

    /// 绑定 Redis，地址不可达或认证失败时返回 `Connection`
    pub fn bind_ruleset(
        &self,
        handle: RulesetHandle,
        host: &str,
        port: u16,
        password: Option<&str>,
    ) -> Result<()> {
        let config = RedisConfig {
            host: host.to_string(),
            port,
            password: password.map(str::to_string),
            ..Default::default()
        };
        self.bind_ruleset_with_config(handle, &config)
    }

    #[instrument(skip(self, config), fields(host = %config.host, port = config.port))]
    pub fn bind_ruleset_with_config(&self, handle: RulesetHandle, config: &RedisConfig) -> Result<()> {
        let ruleset = self.ruleset(handle)?;
        let store = RedisStore::connect(config)?;
        ruleset.bind(Binding::new(
            Arc::new(store),
            ruleset.name(),
            LockConfig::from(config),
        ))
    }

    /// 绑定任意状态存储实现
    pub fn bind_ruleset_with(
        &self,
        handle: RulesetHandle,
        store: Arc<dyn StateStore>,
        lock: LockConfig,
    ) -> Result<()> {
        let ruleset = self.ruleset(handle)?;
        ruleset.bind(Binding::new(store, ruleset.name(), lock))
    }

    pub fn stats(&self, handle: RulesetHandle) -> Result<RulesetStats> {
        Ok(self.ruleset(handle)?.stats())
    }

    // ==================== 断言 ====================

    pub fn assert_event(&self, handle: RulesetHandle, sid: &str, document: &str) -> Result<Outcome> {
        let event = parse_document(document)?;
        let ruleset = self.ruleset(handle)?;
        ruleset.assert_event(sid, event).map(Outcome::from)
    }

    pub fn assert_events(
        &self,
        handle: RulesetHandle,
        sid: &str,
        documents: &str,
    ) -> Result<Vec<Outcome>> {
        let events = parse_batch(documents)?;
        let ruleset = self.ruleset(handle)?;
        Ok(into_outcomes(ruleset.assert_events(sid, events)?))
    }

    pub fn assert_fact(&self, handle: RulesetHandle, sid: &str, document: &str) -> Result<Outcome> {
        let fact = parse_document(document)?;
        let ruleset = self.ruleset(handle)?;
        ruleset.assert_fact(sid, fact).map(Outcome::from)
    }

    pub fn assert_facts(
        &self,
        handle: RulesetHandle,
        sid: &str,
        documents: &str,
    ) -> Result<Vec<Outcome>> {
        let facts = parse_batch(documents)?;
        let ruleset = self.ruleset(handle)?;
        Ok(into_outcomes(ruleset.assert_facts(sid, facts)?))
    }

    pub fn retract_fact(&self, handle: RulesetHandle, sid: &str, document: &str) -> Result<Outcome> {
        let fact = parse_document(document)?;
        let ruleset = self.ruleset(handle)?;
        ruleset.retract_fact(sid, fact).map(Outcome::from)
    }

    pub fn retract_facts(
        &self,
        handle: RulesetHandle,
        sid: &str,
        documents: &str,
    ) -> Result<Vec<Outcome>> {
        let facts = parse_batch(documents)?;
        let ruleset = self.ruleset(handle)?;
        Ok(into_outcomes(ruleset.retract_facts(sid, facts)?))
    }

    pub fn assert_state(&self, handle: RulesetHandle, sid: &str, document: &str) -> Result<Outcome> {
        let state = parse_document(document)?;
        let ruleset = self.ruleset(handle)?;
        ruleset.assert_state(sid, state).map(Outcome::from)
    }

    pub fn get_state(&self, handle: RulesetHandle, sid: &str) -> Result<String> {
        Ok(self.ruleset(handle)?.get_state(sid)?.to_string())
    }

    pub fn facts(&self, handle: RulesetHandle, sid: &str) -> Result<Vec<Value>> {
        self.ruleset(handle)?.facts(sid)
    }

    // ==================== 动作 ====================

    /// 租用一个动作，没有待执行动作时返回 None
    pub fn start_action(&self, handle: RulesetHandle) -> Result<Option<ActionLease>> {
        self.ruleset(handle)?.start_action()
    }

    pub fn complete_action(
        &self,
        handle: RulesetHandle,
        action: ActionHandle,
        document: &str,
    ) -> Result<()> {
        let state = parse_document(document)?;
        self.ruleset(handle)?.complete_action(action, state)
    }

    pub fn abandon_action(&self, handle: RulesetHandle, action: ActionHandle) -> Result<()> {
        self.ruleset(handle)?.abandon_action(action).map(|_| ())
    }

    // ==================== 定时器 ====================

    /// 设置定时器：文档中的 `$timer` 或 `name` 字段为定时器名称，其余字段作为触发事件的内容
    pub fn start_timer(
        &self,
        handle: RulesetHandle,
        sid: &str,
        duration_secs: u64,
        document: &str,
    ) -> Result<()> {
        let Value::Object(mut payload) = parse_document(document)? else {
            return Err(EngineError::InvalidDocument("定时器文档必须是 JSON 对象".to_string()));
        };
        let name = match payload.remove("$timer").or_else(|| payload.remove("name")) {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => {
                return Err(EngineError::InvalidDocument(
                    "定时器文档缺少名称（$timer 或 name）".to_string(),
                ));
            }
        };

        self.ruleset(handle)?.start_timer(
            sid,
            Duration::from_secs(duration_secs),
            &name,
            Value::Object(payload),
        )
    }

    pub fn sweep_timers(&self, handle: RulesetHandle) -> Result<bool> {
        self.ruleset(handle)?.sweep_timers()
    }
}

fn parse_document(document: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(document)
        .map_err(|e| EngineError::InvalidDocument(e.to_string()))?;
    ensure_object(&value)?;
    Ok(value)
}

/// 解析批量文档：任一文档无效时整批失败，不应用任何文档
fn parse_batch(documents: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(documents)
        .map_err(|e| EngineError::InvalidDocument(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(EngineError::InvalidDocument("批量文档必须是 JSON 数组".to_string()));
    };
    items.iter().try_for_each(ensure_object)?;
    Ok(items)
}

fn into_outcomes(handled: Vec<bool>) -> Vec<Outcome> {
    handled.into_iter().map(Outcome::from).collect()
}
