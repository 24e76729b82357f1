//! 匹配网络与工作内存
//!
//! 网络由共享的 alpha 节点（单文档常量测试）和逐规则的 beta 链（从左到右的 join）组成。
//! 新增一个文档只沿命中的 alpha 节点传播，不会重新扫描整个规则集。
//!
//! 工作内存按会话独立维护：
//! - alpha 记忆：每个 alpha 节点命中的持久文档
//! - beta 记忆：每条产生式每一层的部分匹配（token）
//!
//! 完整匹配同样保存在 beta 记忆里，同一组文档只会触发一次。
//! 事件不进入任何记忆，只在自己的这一轮传播中与已有事实/状态 join。

use crate::evaluator::ConditionEvaluator;
use crate::models::{DocumentKind, Source, lookup};
use crate::operators::Operator;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// 工作内存元素 ID，会话内单调递增
pub type WmeId = u64;

/// 部分匹配：按模式顺序排列的 WME ID
pub type Token = Vec<WmeId>;

/// 编译后的匹配网络（创建后只读）
#[derive(Debug, Clone)]
pub struct Network {
    pub(crate) alphas: Vec<AlphaNode>,
    pub(crate) productions: Vec<Production>,
    /// alpha 节点 -> (产生式, 模式位置)
    pub(crate) successors: Vec<Vec<(usize, usize)>>,
    pub(crate) rule_count: usize,
}

impl Network {
    pub(crate) fn new(alphas: Vec<AlphaNode>, productions: Vec<Production>, rule_count: usize) -> Self {
        let mut successors = vec![Vec::new(); alphas.len()];
        for (p, production) in productions.iter().enumerate() {
            for (i, pattern) in production.patterns.iter().enumerate() {
                successors[pattern.alpha].push((p, i));
            }
        }

        Self {
            alphas,
            productions,
            successors,
            rule_count,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn alpha_count(&self) -> usize {
        self.alphas.len()
    }

    pub fn production_count(&self) -> usize {
        self.productions.len()
    }

    pub fn production(&self, index: usize) -> Option<&Production> {
        self.productions.get(index)
    }

    /// 文档命中的 alpha 节点
    fn matching_alphas(&self, kind: DocumentKind, document: &Value) -> Vec<usize> {
        self.alphas
            .iter()
            .enumerate()
            .filter(|(_, alpha)| alpha.matches(kind, document))
            .map(|(index, _)| index)
            .collect()
    }
}

/// alpha 节点：来源 + 常量测试
#[derive(Debug, Clone)]
pub struct AlphaNode {
    pub source: Source,
    pub test: Option<AlphaTest>,
}

impl AlphaNode {
    fn matches(&self, kind: DocumentKind, document: &Value) -> bool {
        self.source.accepts(kind) && self.test.as_ref().is_none_or(|test| test.matches(document))
    }
}

/// 常量测试树（短路求值）
#[derive(Debug, Clone)]
pub enum AlphaTest {
    Condition(CompiledCondition),
    All(Vec<AlphaTest>),
    Any(Vec<AlphaTest>),
}

impl AlphaTest {
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Self::Condition(cond) => cond.matches(document),
            Self::All(children) => children.iter().all(|c| c.matches(document)),
            Self::Any(children) => children.iter().any(|c| c.matches(document)),
        }
    }
}

/// 编译后的条件，regex 操作符预先构建正则
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    pub regex: Option<Regex>,
}

impl CompiledCondition {
    fn matches(&self, document: &Value) -> bool {
        let field = lookup(document, &self.field);
        let result = match &self.regex {
            Some(regex) => ConditionEvaluator::regex_match(field, regex),
            None => ConditionEvaluator::evaluate(field, self.operator, &self.value),
        };
        // 求值失败（类型不匹配等）按不匹配处理
        matches!(result, Ok(true))
    }
}

/// join 测试：本模式文档的 `field` 与第 `pattern` 个模式文档的 `path` 比较
#[derive(Debug, Clone)]
pub struct JoinTest {
    pub field: String,
    pub operator: Operator,
    pub pattern: usize,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct PatternNode {
    pub alias: String,
    pub alpha: usize,
    pub joins: Vec<JoinTest>,
}

/// 产生式：一条规则（any 规则每个分支一条）
#[derive(Debug, Clone)]
pub struct Production {
    pub rule: String,
    pub action: String,
    pub priority: i32,
    pub patterns: Vec<PatternNode>,
}

/// 一次完整匹配
#[derive(Debug, Clone)]
pub struct Activation {
    pub production: usize,
    /// 模式别名 -> 匹配的文档
    pub messages: Map<String, Value>,
}

/// 一次传播的结果
#[derive(Debug, Clone, Default)]
pub struct Propagation {
    /// 文档是否命中了至少一个模式
    pub handled: bool,
    /// 新产生的完整匹配，按优先级排序
    pub activations: Vec<Activation>,
}

#[derive(Debug, Clone)]
struct Wme {
    document: Value,
}

struct Pass {
    persist: bool,
    fire: bool,
    activations: Vec<Activation>,
}

/// 单个会话的工作内存
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    next_id: WmeId,
    wmes: BTreeMap<WmeId, Wme>,
    alpha: Vec<BTreeSet<WmeId>>,
    beta: Vec<Vec<BTreeSet<Token>>>,
}

impl WorkingMemory {
    pub fn new(network: &Network) -> Self {
        Self {
            next_id: 1,
            wmes: BTreeMap::new(),
            alpha: vec![BTreeSet::new(); network.alphas.len()],
            beta: network
                .productions
                .iter()
                .map(|p| vec![BTreeSet::new(); p.patterns.len()])
                .collect(),
        }
    }

    /// 下一个可分配的 ID
    pub fn next_id(&self) -> WmeId {
        self.next_id
    }

    /// 保证之后分配的 ID 不小于 `next_id`
    pub fn advance_to(&mut self, next_id: WmeId) {
        self.next_id = self.next_id.max(next_id);
    }

    pub fn document(&self, id: WmeId) -> Option<&Value> {
        self.wmes.get(&id).map(|w| &w.document)
    }

    /// 当前保存的部分匹配与完整匹配数量
    pub fn token_count(&self) -> usize {
        self.beta.iter().flatten().map(BTreeSet::len).sum()
    }

    /// 插入文档并传播，返回分配的 ID（事件的 ID 在传播结束后即失效）
    pub fn insert(
        &mut self,
        network: &Network,
        kind: DocumentKind,
        document: Value,
    ) -> (WmeId, Propagation) {
        let id = self.next_id;
        let propagation = self.insert_with_id(network, id, kind, document, true);
        (id, propagation)
    }

    /// 按指定 ID 插入（会话恢复时使用，`fire = false` 只重建记忆不产生匹配）
    pub fn insert_with_id(
        &mut self,
        network: &Network,
        id: WmeId,
        kind: DocumentKind,
        document: Value,
        fire: bool,
    ) -> Propagation {
        let persist = kind != DocumentKind::Event;
        let matched = network.matching_alphas(kind, &document);

        self.next_id = self.next_id.max(id.saturating_add(1));
        self.wmes.insert(id, Wme { document });
        if persist {
            for &alpha in &matched {
                self.alpha[alpha].insert(id);
            }
        }

        let mut pass = Pass {
            persist,
            fire,
            activations: Vec::new(),
        };
        for &alpha in &matched {
            for &(production, position) in &network.successors[alpha] {
                self.right_activate(network, production, position, id, &mut pass);
            }
        }

        if !persist {
            self.wmes.remove(&id);
        }

        let mut activations = pass.activations;
        activations.sort_by_key(|a| (network.productions[a.production].priority, a.production));

        Propagation {
            handled: !matched.is_empty(),
            activations,
        }
    }

    /// 移除文档及包含它的所有匹配
    pub fn remove(&mut self, id: WmeId) -> Option<Value> {
        let wme = self.wmes.remove(&id)?;
        for memory in &mut self.alpha {
            memory.remove(&id);
        }
        for memories in &mut self.beta {
            for memory in memories.iter_mut() {
                memory.retain(|token| !token.contains(&id));
            }
        }
        Some(wme.document)
    }

    /// 新文档从右侧进入第 `position` 个模式
    fn right_activate(
        &mut self,
        network: &Network,
        production: usize,
        position: usize,
        id: WmeId,
        pass: &mut Pass,
    ) {
        let parents: Vec<Token> = if position == 0 {
            vec![Vec::new()]
        } else {
            self.beta[production][position - 1]
                .iter()
                .filter(|token| !token.contains(&id))
                .cloned()
                .collect()
        };

        for parent in parents {
            if self.joins_pass(network, production, position, id, &parent) {
                let mut token = parent;
                token.push(id);
                self.extend(network, production, token, pass);
            }
        }
    }

    /// token 已匹配前 len 个模式，继续向右扩展
    fn extend(&mut self, network: &Network, production: usize, token: Token, pass: &mut Pass) {
        let depth = token.len();
        if pass.persist && !self.beta[production][depth - 1].insert(token.clone()) {
            return;
        }

        let rule = &network.productions[production];
        if depth == rule.patterns.len() {
            if pass.fire {
                pass.activations.push(Activation {
                    production,
                    messages: self.messages(rule, &token),
                });
            }
            return;
        }

        let candidates: Vec<WmeId> = self.alpha[rule.patterns[depth].alpha]
            .iter()
            .copied()
            .filter(|candidate| !token.contains(candidate))
            .collect();

        for candidate in candidates {
            if self.joins_pass(network, production, depth, candidate, &token) {
                let mut child = token.clone();
                child.push(candidate);
                self.extend(network, production, child, pass);
            }
        }
    }

    fn joins_pass(
        &self,
        network: &Network,
        production: usize,
        position: usize,
        id: WmeId,
        token: &[WmeId],
    ) -> bool {
        let pattern = &network.productions[production].patterns[position];
        if pattern.joins.is_empty() {
            return true;
        }
        let Some(document) = self.document(id) else {
            return false;
        };

        pattern.joins.iter().all(|join| {
            let expected = token
                .get(join.pattern)
                .and_then(|other| self.document(*other))
                .and_then(|other| lookup(other, &join.path));
            match expected {
                Some(expected) => matches!(
                    ConditionEvaluator::evaluate(lookup(document, &join.field), join.operator, expected),
                    Ok(true)
                ),
                None => false,
            }
        })
    }

    fn messages(&self, production: &Production, token: &[WmeId]) -> Map<String, Value> {
        production
            .patterns
            .iter()
            .zip(token)
            .filter_map(|(pattern, id)| {
                self.document(*id)
                    .map(|doc| (pattern.alias.clone(), doc.clone()))
            })
            .collect()
    }
}
