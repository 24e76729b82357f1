//! 规则集领域模型
//!
//! 规则集定义是一个以规则名为键的 JSON 对象，每条规则由若干模式组成：
//!
//! ```json
//! {
//!   "raise_alert": {
//!     "priority": 0,
//!     "action": "alert",
//!     "all": [
//!       {"alias": "m", "source": "fact",
//!        "when": {"type": "condition", "field": "temperature", "operator": "gt", "value": 100}}
//!     ]
//!   }
//! }
//! ```

use crate::operators::{LogicalOperator, Operator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// 规则集定义（按规则名排序）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RulesetDefinition {
    pub rules: BTreeMap<String, RuleDefinition>,
}

impl RulesetDefinition {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_rule(mut self, name: impl Into<String>, rule: RuleDefinition) -> Self {
        self.rules.insert(name.into(), rule);
        self
    }
}

/// 单条规则
///
/// `all` 与 `any` 必须且只能给出一个。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// 优先级，数值越小越先触发
    #[serde(default, alias = "pri")]
    pub priority: i32,
    /// 交给 worker 的动作名，缺省为规则名
    #[serde(default, alias = "run", skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<PatternDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<Vec<PatternDefinition>>,
}

impl RuleDefinition {
    pub fn all(patterns: Vec<PatternDefinition>) -> Self {
        Self {
            all: Some(patterns),
            ..Default::default()
        }
    }

    pub fn any(patterns: Vec<PatternDefinition>) -> Self {
        Self {
            any: Some(patterns),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

fn default_alias() -> String {
    "m".to_string()
}

/// 模式：对一类输入文档的约束
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternDefinition {
    /// 在动作消息中引用匹配文档的名字
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<RuleNode>,
}

impl PatternDefinition {
    pub fn new(alias: impl Into<String>, source: Source, when: Option<RuleNode>) -> Self {
        Self {
            alias: alias.into(),
            source,
            when,
        }
    }
}

/// 模式可以匹配的输入来源
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Fact,
    Event,
    State,
    /// 事实或事件
    #[default]
    Any,
}

impl Source {
    pub fn accepts(self, kind: DocumentKind) -> bool {
        match self {
            Self::Fact => kind == DocumentKind::Fact,
            Self::Event => kind == DocumentKind::Event,
            Self::State => kind == DocumentKind::State,
            Self::Any => matches!(kind, DocumentKind::Fact | DocumentKind::Event),
        }
    }
}

/// 输入文档的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// 单次匹配后丢弃
    Event,
    /// 持久保存直到撤回
    Fact,
    /// 会话状态
    State,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => write!(f, "event"),
            Self::Fact => write!(f, "fact"),
            Self::State => write!(f, "state"),
        }
    }
}

/// 规则节点（条件或逻辑组）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleNode {
    Condition(Condition),
    Group(LogicalGroup),
}

/// 条件节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Operand,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: Operand::Literal(value.into()),
        }
    }

    /// 与前序模式字段比较的条件，`reference` 形如 `alias.path`
    pub fn join(
        field: impl Into<String>,
        operator: Operator,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: Operand::Reference {
                reference: reference.into(),
            },
        }
    }
}

/// 条件的比较值：字面量或对前序模式的引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Reference {
        #[serde(rename = "$ref")]
        reference: String,
    },
    Literal(Value),
}

impl Default for Operand {
    fn default() -> Self {
        Self::Literal(Value::Null)
    }
}

/// 逻辑组节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalGroup {
    pub operator: LogicalOperator,
    pub children: Vec<RuleNode>,
}

impl LogicalGroup {
    pub fn new(operator: LogicalOperator, children: Vec<RuleNode>) -> Self {
        Self { operator, children }
    }

    pub fn and(children: Vec<RuleNode>) -> Self {
        Self::new(LogicalOperator::And, children)
    }

    pub fn or(children: Vec<RuleNode>) -> Self {
        Self::new(LogicalOperator::Or, children)
    }
}

/// 获取字段值（支持点号分隔的路径，如 "reading.temperature" 或 "items.0.name"）
///
/// 空路径返回文档本身。
pub fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }

    let mut current = data;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}
