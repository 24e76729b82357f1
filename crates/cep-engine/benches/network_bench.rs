//! 匹配网络性能基准测试
//!
//! 针对编译与单次传播的细粒度测试：
//! - 规则数量增长时的编译耗时
//! - 共享 alpha 节点下的事件传播
//! - 工作内存中事实数量增长时的 join 传播

use cep_engine::network::WorkingMemory;
use cep_engine::{
    Condition, DocumentKind, LogicalGroup, Operator, PatternDefinition, RuleDefinition, RuleNode,
    RulesetCompiler, RulesetDefinition, Source,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use std::hint::black_box;

/// 创建 n 条单模式规则，阈值各不相同，条件字段相同
fn create_threshold_rules(count: usize) -> RulesetDefinition {
    (0..count).fold(RulesetDefinition::default(), |def, i| {
        def.with_rule(
            format!("threshold_{}", i),
            RuleDefinition::all(vec![PatternDefinition::new(
                "m",
                Source::Event,
                Some(RuleNode::Condition(Condition::new(
                    "temperature",
                    Operator::Gt,
                    (i * 10) as i64,
                ))),
            )]),
        )
    })
}

/// 读数 + 设备两模式 join 规则
fn create_join_rules() -> RulesetDefinition {
    RulesetDefinition::default().with_rule(
        "overheat",
        RuleDefinition::all(vec![
            PatternDefinition::new(
                "reading",
                Source::Event,
                Some(RuleNode::Condition(Condition::new(
                    "temperature",
                    Operator::Gt,
                    100,
                ))),
            ),
            PatternDefinition::new(
                "device",
                Source::Fact,
                Some(RuleNode::Group(LogicalGroup::and(vec![
                    RuleNode::Condition(Condition::new("kind", Operator::Eq, "device")),
                    RuleNode::Condition(Condition::join("name", Operator::Eq, "reading.device")),
                ]))),
            ),
        ]),
    )
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for count in [10, 100, 1000] {
        let definition = create_threshold_rules(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &definition, |b, def| {
            b.iter(|| RulesetCompiler::compile(black_box(def)).unwrap())
        });
    }

    group.finish();
}

fn bench_event_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_propagation");

    for count in [10, 100, 1000] {
        let network = RulesetCompiler::compile(&create_threshold_rules(count)).unwrap();
        let mut memory = WorkingMemory::new(&network);
        let event = json!({"temperature": 55});

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| memory.insert(&network, DocumentKind::Event, black_box(event.clone())))
        });
    }

    group.finish();
}

fn bench_join_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("join_propagation");
    let network = RulesetCompiler::compile(&create_join_rules()).unwrap();

    for devices in [10, 100, 1000] {
        let mut memory = WorkingMemory::new(&network);
        for i in 0..devices {
            memory.insert(
                &network,
                DocumentKind::Fact,
                json!({"kind": "device", "name": format!("d{}", i)}),
            );
        }
        let event = json!({"temperature": 120, "device": "d1"});

        group.bench_with_input(BenchmarkId::from_parameter(devices), &devices, |b, _| {
            b.iter(|| memory.insert(&network, DocumentKind::Event, black_box(event.clone())))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_compile,
    bench_event_propagation,
    bench_join_propagation
);
criterion_main!(benches);
