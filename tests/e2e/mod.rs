//! 规则引擎端到端测试
//!
//! 多个引擎实例共享同一状态存储，模拟多进程部署：
//! - 会话在实例之间共享（事实、状态、版本）
//! - 定时器只被一个实例触发
//! - 会话锁竞争
//! - Redis 绑定（需要运行 Redis）

pub mod suites;

use cep_engine::{Engine, LockConfig, ManualClock, MemoryStore, RulesetHandle};
use std::sync::Arc;
use std::time::Duration;

/// 设备告警规则：温度事件与同名设备事实 join
pub const DEVICE_RULES: &str = r#"
{
    "overheat": {
        "action": "cool_down",
        "all": [
            {"alias": "reading", "source": "event",
             "when": {"type": "condition", "field": "temperature", "operator": "gt", "value": 100}},
            {"alias": "device", "source": "fact",
             "when": {"type": "group", "operator": "AND", "children": [
                {"type": "condition", "field": "kind", "operator": "eq", "value": "device"},
                {"type": "condition", "field": "name", "operator": "eq", "value": {"$ref": "reading.device"}}
             ]}}
        ]
    },
    "heartbeat_missed": {
        "all": [
            {"alias": "t", "source": "event",
             "when": {"type": "condition", "field": "$timer", "operator": "eq", "value": "heartbeat"}}
        ]
    }
}
"#;

/// 测试用锁配置：短 TTL、短重试间隔
pub fn test_lock_config() -> LockConfig {
    LockConfig {
        ttl: Duration::from_secs(2),
        retry_count: 400,
        retry_delay: Duration::from_millis(5),
    }
}

/// 共享同一存储与时钟的一个引擎实例
pub struct Node {
    pub engine: Engine,
    pub handle: RulesetHandle,
}

/// 创建 n 个绑定到同一 `MemoryStore` 的引擎实例
pub fn cluster(
    ruleset: &str,
    nodes: usize,
    capacity: usize,
) -> (Vec<Node>, Arc<MemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000));

    let nodes = (0..nodes)
        .map(|_| {
            let engine = Engine::with_clock(clock.clone());
            let handle = engine
                .create_ruleset(ruleset, DEVICE_RULES, capacity)
                .unwrap();
            engine
                .bind_ruleset_with(handle, store.clone(), test_lock_config())
                .unwrap();
            Node { engine, handle }
        })
        .collect();

    (nodes, store, clock)
}
