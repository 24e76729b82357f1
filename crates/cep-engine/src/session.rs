//! 会话：单个 sid 的工作内存、事实集合与状态
//!
//! 事实身份：文档有 `id` 字段时按 `id` 识别，否则按整个文档的规范 JSON 识别。
//! 相同身份、相同内容的重复断言不做任何事；内容不同则替换旧事实。
//!
//! 状态是一个 JSON 对象，初始为 `{"sid": <sid>}`，
//! 第一次被断言或被动作结果修改之后才参与匹配。

use crate::models::DocumentKind;
use crate::network::{Network, Propagation, WmeId, WorkingMemory};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 远端存储中的事实
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFact {
    pub id: WmeId,
    pub key: String,
    pub document: Value,
}

/// 远端存储中的会话快照
///
/// 只保存事实与状态，匹配记忆在加载时重建。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub sid: String,
    pub state: Map<String, Value>,
    #[serde(default)]
    pub state_active: bool,
    pub next_id: WmeId,
    pub facts: Vec<StoredFact>,
}

/// 计算事实身份
pub fn fact_key(fact: &Value) -> String {
    match fact.get("id") {
        Some(id) => format!("id:{}", id),
        // serde_json 的 Map 按键排序，Display 输出即规范形式
        None => format!("doc:{}", fact),
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    sid: String,
    state: Map<String, Value>,
    state_wme: Option<WmeId>,
    facts: BTreeMap<String, WmeId>,
    memory: WorkingMemory,
    /// 已知的远端版本号，未绑定时恒为 0
    pub(crate) version: u64,
    /// 自上次写入远端后是否有修改
    pub(crate) dirty: bool,
}

impl Session {
    pub fn new(network: &Network, sid: &str) -> Self {
        let mut state = Map::new();
        state.insert("sid".to_string(), Value::String(sid.to_string()));

        Self {
            sid: sid.to_string(),
            state,
            state_wme: None,
            facts: BTreeMap::new(),
            memory: WorkingMemory::new(network),
            version: 0,
            dirty: false,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// 当前状态文档
    pub fn state(&self) -> Value {
        Value::Object(self.state.clone())
    }

    /// 当前事实，按断言顺序
    pub fn facts(&self) -> Vec<Value> {
        let mut ids: Vec<WmeId> = self.facts.values().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.memory.document(id).cloned())
            .collect()
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    pub fn assert_event(&mut self, network: &Network, event: Value) -> Propagation {
        let (_, propagation) = self.memory.insert(network, DocumentKind::Event, event);
        propagation
    }

    pub fn assert_fact(&mut self, network: &Network, fact: Value) -> Propagation {
        let key = fact_key(&fact);
        if let Some(&existing) = self.facts.get(&key) {
            if self.memory.document(existing) == Some(&fact) {
                return Propagation::default();
            }
            self.memory.remove(existing);
        }

        let (id, propagation) = self.memory.insert(network, DocumentKind::Fact, fact);
        self.facts.insert(key, id);
        self.dirty = true;
        propagation
    }

    /// 撤回事实，事实不存在时返回 false
    pub fn retract_fact(&mut self, fact: &Value) -> bool {
        match self.facts.remove(&fact_key(fact)) {
            Some(id) => {
                self.memory.remove(id);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// 合并状态文档：值为 null 的键被删除，`sid` 不可修改
    ///
    /// 状态没有变化且已参与匹配时不重新传播。
    pub fn merge_state(&mut self, network: &Network, patch: Map<String, Value>) -> Propagation {
        let mut next = self.state.clone();
        for (key, value) in patch {
            if key == "sid" {
                continue;
            }
            if value.is_null() {
                next.remove(&key);
            } else {
                next.insert(key, value);
            }
        }

        if next == self.state && self.state_wme.is_some() {
            return Propagation::default();
        }

        self.state = next;
        self.dirty = true;
        if let Some(old) = self.state_wme.take() {
            self.memory.remove(old);
        }
        let (id, propagation) =
            self.memory
                .insert(network, DocumentKind::State, Value::Object(self.state.clone()));
        self.state_wme = Some(id);
        propagation
    }

    pub fn snapshot(&self) -> StoredSession {
        let mut facts: Vec<StoredFact> = self
            .facts
            .iter()
            .filter_map(|(key, &id)| {
                self.memory.document(id).map(|document| StoredFact {
                    id,
                    key: key.clone(),
                    document: document.clone(),
                })
            })
            .collect();
        facts.sort_by_key(|f| f.id);

        StoredSession {
            sid: self.sid.clone(),
            state: self.state.clone(),
            state_active: self.state_wme.is_some(),
            next_id: self.memory.next_id(),
            facts,
        }
    }

    /// 从快照重建会话，已有的完整匹配不会再次触发
    pub fn restore(network: &Network, stored: StoredSession, version: u64) -> Self {
        let mut session = Self::new(network, &stored.sid);

        for fact in stored.facts {
            session.memory.insert_with_id(
                network,
                fact.id,
                DocumentKind::Fact,
                fact.document,
                false,
            );
            session.facts.insert(fact.key, fact.id);
        }
        session.memory.advance_to(stored.next_id);

        session.state = stored.state;
        session
            .state
            .insert("sid".to_string(), Value::String(session.sid.clone()));
        if stored.state_active {
            let id = session.memory.next_id();
            session.memory.insert_with_id(
                network,
                id,
                DocumentKind::State,
                Value::Object(session.state.clone()),
                false,
            );
            session.state_wme = Some(id);
        }

        session.version = version;
        session
    }
}
