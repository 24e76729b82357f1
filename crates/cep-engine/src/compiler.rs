//! 规则集编译器
//!
//! 将 JSON 规则集定义校验并编译成匹配网络：
//! - 相同来源、相同常量条件的模式共享一个 alpha 节点
//! - 引用前序模式的条件（`{"$ref": "alias.path"}`）编译为 join 测试
//! - `any` 规则的每个分支编译为独立的产生式

use crate::error::{EngineError, Result};
use crate::models::{
    Condition, LogicalGroup, Operand, PatternDefinition, RuleDefinition, RuleNode,
    RulesetDefinition, Source,
};
use crate::network::{AlphaNode, AlphaTest, CompiledCondition, JoinTest, Network, PatternNode, Production};
use crate::operators::{LogicalOperator, Operator};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// 规则集编译器
#[derive(Default)]
pub struct RulesetCompiler {
    alphas: Vec<AlphaNode>,
    /// alpha 节点签名 -> 索引
    signatures: HashMap<String, usize>,
    productions: Vec<Production>,
}

impl RulesetCompiler {
    /// 从 JSON 字符串编译规则集
    pub fn compile_from_json(json: &str) -> Result<Network> {
        let definition: RulesetDefinition = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidDefinition(format!("JSON 解析失败: {}", e)))?;
        Self::compile(&definition)
    }

    /// 编译规则集
    pub fn compile(definition: &RulesetDefinition) -> Result<Network> {
        if definition.rules.is_empty() {
            return Err(invalid("规则集至少需要一条规则".to_string()));
        }

        let mut compiler = Self::default();
        for (name, rule) in &definition.rules {
            compiler.compile_rule(name, rule)?;
        }

        Ok(Network::new(
            compiler.alphas,
            compiler.productions,
            definition.rules.len(),
        ))
    }

    fn compile_rule(&mut self, name: &str, rule: &RuleDefinition) -> Result<()> {
        if name.is_empty() {
            return Err(invalid("规则名称不能为空".to_string()));
        }

        let action = rule.action.clone().unwrap_or_else(|| name.to_string());
        if action.is_empty() {
            return Err(invalid(format!("规则 '{}' 的动作名不能为空", name)));
        }

        match (&rule.all, &rule.any) {
            (Some(all), None) => {
                if all.is_empty() {
                    return Err(invalid(format!("规则 '{}' 的 all 不能为空", name)));
                }

                let mut patterns = Vec::with_capacity(all.len());
                for (i, pattern) in all.iter().enumerate() {
                    let path = format!("{}.all[{}]", name, i);
                    self.validate_alias(pattern, &all[..i], &path)?;

                    let earlier: Vec<&str> = all[..i].iter().map(|p| p.alias.as_str()).collect();
                    patterns.push(self.compile_pattern(pattern, &earlier, &path)?);
                }

                self.productions.push(Production {
                    rule: name.to_string(),
                    action,
                    priority: rule.priority,
                    patterns,
                });
            }
            (None, Some(any)) => {
                if any.is_empty() {
                    return Err(invalid(format!("规则 '{}' 的 any 不能为空", name)));
                }

                for (i, pattern) in any.iter().enumerate() {
                    let path = format!("{}.any[{}]", name, i);
                    self.validate_alias(pattern, &[], &path)?;

                    let node = self.compile_pattern(pattern, &[], &path)?;
                    self.productions.push(Production {
                        rule: name.to_string(),
                        action: action.clone(),
                        priority: rule.priority,
                        patterns: vec![node],
                    });
                }
            }
            _ => {
                return Err(invalid(format!(
                    "规则 '{}' 必须且只能包含 all 或 any 之一",
                    name
                )));
            }
        }

        Ok(())
    }

    /// 别名非空且在同一 all 列表内唯一
    fn validate_alias(
        &self,
        pattern: &PatternDefinition,
        earlier: &[PatternDefinition],
        path: &str,
    ) -> Result<()> {
        if pattern.alias.is_empty() || pattern.alias.contains('.') {
            return Err(invalid(format!(
                "模式 '{}' 的别名不能为空或包含 '.'",
                path
            )));
        }
        if earlier.iter().any(|p| p.alias == pattern.alias) {
            return Err(invalid(format!(
                "模式 '{}' 的别名 '{}' 重复",
                path, pattern.alias
            )));
        }
        Ok(())
    }

    fn compile_pattern(
        &mut self,
        pattern: &PatternDefinition,
        earlier: &[&str],
        path: &str,
    ) -> Result<PatternNode> {
        let (constant, joins) = match &pattern.when {
            None => (None, Vec::new()),
            Some(node) => self.split_joins(node, earlier, path)?,
        };

        let alpha = self.intern_alpha(pattern.source, constant)?;
        Ok(PatternNode {
            alias: pattern.alias.clone(),
            alpha,
            joins,
        })
    }

    /// 拆分顶层条件：引用前序模式的部分成为 join 测试，其余留在 alpha 节点
    fn split_joins(
        &self,
        node: &RuleNode,
        earlier: &[&str],
        path: &str,
    ) -> Result<(Option<RuleNode>, Vec<JoinTest>)> {
        match node {
            RuleNode::Condition(cond) if is_reference(cond) => {
                Ok((None, vec![self.compile_join(cond, earlier, path)?]))
            }
            RuleNode::Group(group) if group.operator == LogicalOperator::And => {
                if group.children.is_empty() {
                    return Err(invalid(format!("逻辑组 '{}' 不能为空", path)));
                }

                let mut constants = Vec::new();
                let mut joins = Vec::new();
                for (i, child) in group.children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    match child {
                        RuleNode::Condition(cond) if is_reference(cond) => {
                            joins.push(self.compile_join(cond, earlier, &child_path)?);
                        }
                        other => {
                            self.validate_node(other, &child_path)?;
                            constants.push(other.clone());
                        }
                    }
                }

                let constant = match constants.len() {
                    0 => None,
                    1 => constants.pop(),
                    _ => Some(RuleNode::Group(LogicalGroup::and(constants))),
                };
                Ok((constant, joins))
            }
            other => {
                self.validate_node(other, path)?;
                Ok((Some(other.clone()), Vec::new()))
            }
        }
    }

    fn compile_join(&self, cond: &Condition, earlier: &[&str], path: &str) -> Result<JoinTest> {
        let Operand::Reference { reference } = &cond.value else {
            return Err(invalid(format!("条件 '{}' 不是引用条件", path)));
        };
        if cond.field.is_empty() {
            return Err(invalid(format!("条件 '{}' 的字段不能为空", path)));
        }
        if cond.operator.is_unary() {
            return Err(invalid(format!(
                "条件 '{}' 的 {} 操作符不能引用其他模式",
                path, cond.operator
            )));
        }

        let (alias, field_path) = reference.split_once('.').unwrap_or((reference.as_str(), ""));
        let pattern = earlier.iter().position(|a| *a == alias).ok_or_else(|| {
            invalid(format!(
                "条件 '{}' 引用了未定义的前序模式 '{}'",
                path, alias
            ))
        })?;

        Ok(JoinTest {
            field: cond.field.clone(),
            operator: cond.operator,
            pattern,
            path: field_path.to_string(),
        })
    }

    /// 验证常量条件树
    fn validate_node(&self, node: &RuleNode, path: &str) -> Result<()> {
        match node {
            RuleNode::Condition(cond) => self.validate_condition(cond, path),
            RuleNode::Group(group) => {
                if group.children.is_empty() {
                    return Err(invalid(format!("逻辑组 '{}' 不能为空", path)));
                }

                for (i, child) in group.children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    self.validate_node(child, &child_path)?;
                }
                Ok(())
            }
        }
    }

    fn validate_condition(&self, cond: &Condition, path: &str) -> Result<()> {
        if cond.field.is_empty() {
            return Err(invalid(format!("条件 '{}' 的字段不能为空", path)));
        }

        match &cond.value {
            Operand::Reference { .. } => Err(invalid(format!(
                "条件 '{}' 中的引用只能出现在 all 模式的顶层条件或顶层 AND 组中",
                path
            ))),
            Operand::Literal(value) => self.validate_operator_value(cond.operator, value, path),
        }
    }

    /// 验证操作符和值的兼容性
    fn validate_operator_value(&self, operator: Operator, value: &Value, path: &str) -> Result<()> {
        match operator {
            Operator::Between => match value.as_array() {
                Some(arr) if arr.len() == 2 => Ok(()),
                Some(arr) => Err(invalid(format!(
                    "条件 '{}' 的 between 操作符需要 [min, max] 数组，当前有 {} 个元素",
                    path,
                    arr.len()
                ))),
                None => Err(invalid(format!(
                    "条件 '{}' 的 between 操作符需要 [min, max] 数组",
                    path
                ))),
            },
            op if op.expects_array() && !value.is_array() => Err(invalid(format!(
                "条件 '{}' 的 {} 操作符需要数组值",
                path, op
            ))),
            Operator::Regex => match value.as_str() {
                Some(pattern) => Regex::new(pattern).map(|_| ()).map_err(|e| {
                    invalid(format!("条件 '{}' 的正则表达式无效: {}", path, e))
                }),
                None => Err(invalid(format!(
                    "条件 '{}' 的 regex 操作符需要字符串值",
                    path
                ))),
            },
            _ => Ok(()),
        }
    }

    /// 按签名复用 alpha 节点
    fn intern_alpha(&mut self, source: Source, constant: Option<RuleNode>) -> Result<usize> {
        let signature = format!(
            "{:?}|{}",
            source,
            serde_json::to_string(&constant).map_err(|e| EngineError::Internal(e.to_string()))?
        );
        if let Some(&index) = self.signatures.get(&signature) {
            return Ok(index);
        }

        let test = constant.as_ref().map(compile_test).transpose()?;
        let index = self.alphas.len();
        self.alphas.push(AlphaNode { source, test });
        self.signatures.insert(signature, index);
        Ok(index)
    }
}

fn is_reference(cond: &Condition) -> bool {
    matches!(cond.value, Operand::Reference { .. })
}

fn compile_test(node: &RuleNode) -> Result<AlphaTest> {
    match node {
        RuleNode::Condition(cond) => {
            let Operand::Literal(value) = &cond.value else {
                return Err(EngineError::Internal(format!(
                    "常量测试中出现引用: {}",
                    cond.field
                )));
            };
            let regex = match (cond.operator, value.as_str()) {
                (Operator::Regex, Some(pattern)) => Some(
                    Regex::new(pattern).map_err(|e| invalid(format!("正则表达式无效: {}", e)))?,
                ),
                _ => None,
            };
            Ok(AlphaTest::Condition(CompiledCondition {
                field: cond.field.clone(),
                operator: cond.operator,
                value: value.clone(),
                regex,
            }))
        }
        RuleNode::Group(group) => {
            let children = group
                .children
                .iter()
                .map(compile_test)
                .collect::<Result<Vec<_>>>()?;
            Ok(match group.operator {
                LogicalOperator::And => AlphaTest::All(children),
                LogicalOperator::Or => AlphaTest::Any(children),
            })
        }
    }
}

fn invalid(message: String) -> EngineError {
    EngineError::InvalidDefinition(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ruleset_json() -> &'static str {
        r#"
        {
            "raise_alert": {
                "action": "alert",
                "all": [
                    {
                        "alias": "reading",
                        "source": "fact",
                        "when": {
                            "type": "group",
                            "operator": "AND",
                            "children": [
                                {"type": "condition", "field": "temperature", "operator": "gt", "value": 100},
                                {
                                    "type": "group",
                                    "operator": "OR",
                                    "children": [
                                        {"type": "condition", "field": "zone", "operator": "eq", "value": "A"},
                                        {"type": "condition", "field": "zone", "operator": "eq", "value": "B"}
                                    ]
                                }
                            ]
                        }
                    }
                ]
            },
            "log_reading": {
                "all": [
                    {
                        "alias": "reading",
                        "source": "fact",
                        "when": {
                            "type": "group",
                            "operator": "AND",
                            "children": [
                                {"type": "condition", "field": "temperature", "operator": "gt", "value": 100},
                                {
                                    "type": "group",
                                    "operator": "OR",
                                    "children": [
                                        {"type": "condition", "field": "zone", "operator": "eq", "value": "A"},
                                        {"type": "condition", "field": "zone", "operator": "eq", "value": "B"}
                                    ]
                                }
                            ]
                        }
                    }
                ]
            }
        }
        "#
    }

    #[test]
    fn test_compile_from_json_shares_alpha_nodes() {
        let network = RulesetCompiler::compile_from_json(sample_ruleset_json()).unwrap();

        assert_eq!(network.rule_count(), 2);
        assert_eq!(network.production_count(), 2);
        assert_eq!(network.alpha_count(), 1);

        // 规则按名称排序，动作名缺省为规则名
        assert_eq!(network.production(0).unwrap().rule, "log_reading");
        assert_eq!(network.production(0).unwrap().action, "log_reading");
        assert_eq!(network.production(1).unwrap().action, "alert");
    }

    #[test]
    fn test_any_expands_to_productions() {
        let json = r#"
        {
            "either": {
                "any": [
                    {"alias": "a", "when": {"type": "condition", "field": "x", "operator": "eq", "value": 1}},
                    {"alias": "b", "when": {"type": "condition", "field": "y", "operator": "eq", "value": 2}}
                ]
            }
        }
        "#;
        let network = RulesetCompiler::compile_from_json(json).unwrap();
        assert_eq!(network.rule_count(), 1);
        assert_eq!(network.production_count(), 2);
        assert_eq!(network.alpha_count(), 2);
    }

    #[test]
    fn test_join_reference_compiled() {
        let json = r#"
        {
            "pair": {
                "all": [
                    {"alias": "first", "source": "fact"},
                    {"alias": "second", "source": "fact",
                     "when": {"type": "condition", "field": "owner", "operator": "eq", "value": {"$ref": "first.id"}}}
                ]
            }
        }
        "#;
        let network = RulesetCompiler::compile_from_json(json).unwrap();
        let production = network.production(0).unwrap();

        // 两个模式都没有常量条件，共享同一个 alpha 节点
        assert_eq!(network.alpha_count(), 1);
        let join = &production.patterns[1].joins[0];
        assert_eq!(join.pattern, 0);
        assert_eq!(join.path, "id");
        assert_eq!(join.field, "owner");
    }

    #[test]
    fn test_validate_empty_ruleset() {
        let result = RulesetCompiler::compile_from_json("{}");
        assert!(matches!(result, Err(EngineError::InvalidDefinition(_))));
    }

    #[test]
    fn test_validate_all_and_any_exclusive() {
        let json = r#"{"r": {"all": [{}], "any": [{}]}}"#;
        let err = RulesetCompiler::compile_from_json(json).unwrap_err();
        assert!(err.to_string().contains("必须且只能包含"));

        let json = r#"{"r": {"priority": 1}}"#;
        assert!(RulesetCompiler::compile_from_json(json).is_err());
    }

    #[test]
    fn test_validate_duplicate_alias() {
        let json = r#"{"r": {"all": [{"alias": "m"}, {"alias": "m"}]}}"#;
        let err = RulesetCompiler::compile_from_json(json).unwrap_err();
        assert!(err.to_string().contains("重复"));
    }

    #[test]
    fn test_validate_forward_reference() {
        let json = r#"
        {
            "r": {
                "all": [
                    {"alias": "a", "when": {"type": "condition", "field": "x", "operator": "eq", "value": {"$ref": "b.x"}}},
                    {"alias": "b"}
                ]
            }
        }
        "#;
        let err = RulesetCompiler::compile_from_json(json).unwrap_err();
        assert!(err.to_string().contains("未定义的前序模式"));
    }

    #[test]
    fn test_validate_nested_reference() {
        let json = r#"
        {
            "r": {
                "all": [
                    {"alias": "a"},
                    {"alias": "b", "when": {"type": "group", "operator": "OR", "children": [
                        {"type": "condition", "field": "x", "operator": "eq", "value": {"$ref": "a.x"}}
                    ]}}
                ]
            }
        }
        "#;
        let err = RulesetCompiler::compile_from_json(json).unwrap_err();
        assert!(err.to_string().contains("顶层"));
    }

    #[test]
    fn test_validate_empty_group() {
        let json = r#"{"r": {"all": [{"when": {"type": "group", "operator": "OR", "children": []}}]}}"#;
        let err = RulesetCompiler::compile_from_json(json).unwrap_err();
        assert!(err.to_string().contains("不能为空"));
    }

    #[test]
    fn test_validate_between_operator() {
        let ok = r#"{"r": {"all": [{"when": {"type": "condition", "field": "t", "operator": "between", "value": [1, 5]}}]}}"#;
        assert!(RulesetCompiler::compile_from_json(ok).is_ok());

        let bad = r#"{"r": {"all": [{"when": {"type": "condition", "field": "t", "operator": "between", "value": 100}}]}}"#;
        assert!(RulesetCompiler::compile_from_json(bad).is_err());
    }

    #[test]
    fn test_validate_invalid_regex() {
        let json = r#"{"r": {"all": [{"when": {"type": "condition", "field": "id", "operator": "regex", "value": "[invalid"}}]}}"#;
        let err = RulesetCompiler::compile_from_json(json).unwrap_err();
        assert!(err.to_string().contains("正则表达式无效"));
    }

    #[test]
    fn test_invalid_json_is_invalid_definition() {
        let err = RulesetCompiler::compile_from_json("not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_DEFINITION");
    }
}
