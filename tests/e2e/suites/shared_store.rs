//! 共享存储测试套件
//!
//! 两个以上引擎实例绑定同一个 `MemoryStore`，验证会话与定时器在实例之间的行为。

use crate::{DEVICE_RULES, cluster};
use cep_engine::{Engine, EngineError, LockConfig, MemoryStore, Outcome, StateStore};
use serde_json::{Value, json};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn state_of(engine: &Engine, handle: cep_engine::RulesetHandle, sid: &str) -> Value {
    serde_json::from_str(&engine.get_state(handle, sid).unwrap()).unwrap()
}

#[cfg(test)]
mod session_sharing_tests {
    use super::*;

    /// 实例 A 写入的事实参与实例 B 上的匹配
    #[test]
    fn test_fact_visible_across_instances() {
        let (nodes, store, _clock) = cluster("devices", 2, 10);
        let (a, b) = (&nodes[0], &nodes[1]);

        let outcome = a
            .engine
            .assert_fact(a.handle, "site1", r#"{"kind": "device", "name": "pump"}"#)
            .unwrap();
        assert_eq!(outcome, Outcome::NotHandled);
        assert_eq!(store.session_count(), 1);

        let outcome = b
            .engine
            .assert_event(b.handle, "site1", r#"{"temperature": 130, "device": "pump"}"#)
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);

        // 动作队列属于产生激活的实例
        assert!(a.engine.start_action(a.handle).unwrap().is_none());
        let lease = b.engine.start_action(b.handle).unwrap().expect("B 应有待执行动作");
        assert_eq!(lease.rule, "overheat");
        assert_eq!(lease.action, "cool_down");
        assert_eq!(lease.messages["device"]["name"], "pump");
        assert_eq!(lease.messages["reading"]["temperature"], 130);
    }

    /// 实例 B 完成动作后，实例 A 缓存中的旧版本会话被重新加载
    #[test]
    fn test_state_refreshed_after_remote_write() {
        let (nodes, _store, _clock) = cluster("devices", 2, 10);
        let (a, b) = (&nodes[0], &nodes[1]);

        a.engine
            .assert_state(a.handle, "site1", r#"{"mode": "auto"}"#)
            .unwrap();
        assert_eq!(
            state_of(&a.engine, a.handle, "site1"),
            json!({"sid": "site1", "mode": "auto"})
        );

        b.engine
            .assert_fact(b.handle, "site1", r#"{"kind": "device", "name": "fan"}"#)
            .unwrap();
        b.engine
            .assert_event(b.handle, "site1", r#"{"temperature": 101, "device": "fan"}"#)
            .unwrap();
        let lease = b.engine.start_action(b.handle).unwrap().unwrap();
        assert_eq!(lease.state["mode"], "auto");
        b.engine
            .complete_action(b.handle, lease.handle, r#"{"mode": "cooling", "alarm": true}"#)
            .unwrap();

        assert_eq!(
            state_of(&a.engine, a.handle, "site1"),
            json!({"sid": "site1", "mode": "cooling", "alarm": true})
        );
        assert_eq!(a.engine.facts(a.handle, "site1").unwrap().len(), 1);
    }

    /// 并发写同一会话：所有实例写入的事实都保留
    #[test]
    fn test_concurrent_writers_keep_all_facts() {
        let (nodes, _store, _clock) = cluster("devices", 2, 4);
        let nodes = Arc::new(nodes);

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let nodes = Arc::clone(&nodes);
                thread::spawn(move || {
                    let node = &nodes[t % 2];
                    for i in 0..10 {
                        let fact = format!(r#"{{"id": "t{}-{}", "kind": "sensor"}}"#, t, i);
                        node.engine.assert_fact(node.handle, "shared", &fact).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        for node in nodes.iter() {
            assert_eq!(node.engine.facts(node.handle, "shared").unwrap().len(), 40);
        }
    }

    /// 容量为 1 时会话不断被淘汰，数据依旧完整
    #[test]
    fn test_eviction_with_shared_store() {
        let (nodes, store, _clock) = cluster("devices", 2, 1);
        let (a, b) = (&nodes[0], &nodes[1]);

        for sid in ["s1", "s2", "s3"] {
            a.engine
                .assert_fact(a.handle, sid, r#"{"kind": "device", "name": "pump"}"#)
                .unwrap();
        }
        assert_eq!(store.session_count(), 3);
        assert!(a.engine.stats(a.handle).unwrap().resident_sessions <= 1);

        for sid in ["s1", "s2", "s3"] {
            let outcome = b
                .engine
                .assert_event(b.handle, sid, r#"{"temperature": 200, "device": "pump"}"#)
                .unwrap();
            assert!(outcome.is_handled());
        }

        let mut leased = 0;
        while let Some(lease) = b.engine.start_action(b.handle).unwrap() {
            b.engine.complete_action(b.handle, lease.handle, "{}").unwrap();
            leased += 1;
        }
        assert_eq!(leased, 3);
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;

    /// 远端定时器只会被一个实例触发
    #[test]
    fn test_timer_fires_once_across_instances() {
        let (nodes, store, clock) = cluster("devices", 3, 10);

        nodes[0]
            .engine
            .start_timer(nodes[0].handle, "site1", 30, r#"{"$timer": "heartbeat", "last": 7}"#)
            .unwrap();
        assert_eq!(store.timer_count("devices"), 1);

        // 未到期
        for node in &nodes {
            assert!(!node.engine.sweep_timers(node.handle).unwrap());
        }

        clock.advance(30_000);
        let fired: Vec<bool> = nodes
            .iter()
            .map(|node| node.engine.sweep_timers(node.handle).unwrap())
            .collect();
        assert_eq!(fired.iter().filter(|f| **f).count(), 1);
        assert_eq!(store.timer_count("devices"), 0);

        let leases: Vec<_> = nodes
            .iter()
            .filter_map(|node| node.engine.start_action(node.handle).unwrap())
            .collect();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].rule, "heartbeat_missed");
        assert_eq!(leases[0].messages["t"]["last"], 7);
    }

    /// 同名定时器重复设置只保留最后一次
    #[test]
    fn test_timer_rearm_across_instances() {
        let (nodes, store, clock) = cluster("devices", 2, 10);
        let (a, b) = (&nodes[0], &nodes[1]);

        a.engine
            .start_timer(a.handle, "site1", 10, r#"{"name": "heartbeat"}"#)
            .unwrap();
        b.engine
            .start_timer(b.handle, "site1", 60, r#"{"name": "heartbeat"}"#)
            .unwrap();
        assert_eq!(store.timer_count("devices"), 1);

        clock.advance(10_000);
        assert!(!a.engine.sweep_timers(a.handle).unwrap());
        clock.advance(50_000);
        assert!(a.engine.sweep_timers(a.handle).unwrap());
    }

    /// 绑定时本地定时器迁移到远端存储
    #[test]
    fn test_local_timers_migrate_on_bind() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new();
        let handle = engine.create_ruleset("devices", DEVICE_RULES, 10).unwrap();

        engine
            .start_timer(handle, "site1", 5, r#"{"$timer": "heartbeat"}"#)
            .unwrap();
        engine
            .assert_fact(handle, "site1", r#"{"kind": "device", "name": "pump"}"#)
            .unwrap();
        engine
            .bind_ruleset_with(handle, store.clone(), crate::test_lock_config())
            .unwrap();

        assert_eq!(store.timer_count("devices"), 1);
        assert_eq!(store.session_count(), 1);
        assert_eq!(engine.stats(handle).unwrap().local_timers, 0);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    /// 会话锁被其他实例长时间持有时返回 LockTimeout
    #[test]
    fn test_lock_contention_times_out() {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new();
        let handle = engine.create_ruleset("devices", DEVICE_RULES, 10).unwrap();
        let lock = LockConfig {
            ttl: Duration::from_secs(5),
            retry_count: 2,
            retry_delay: Duration::from_millis(1),
        };
        engine.bind_ruleset_with(handle, store.clone(), lock).unwrap();

        assert!(
            store
                .try_lock("devices:site1", "other-node:1", Duration::from_secs(30))
                .unwrap()
        );

        let err = engine
            .assert_event(handle, "site1", r#"{"temperature": 150}"#)
            .unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
        assert!(err.is_retryable());

        // 其他会话不受影响
        engine
            .assert_event(handle, "site2", r#"{"temperature": 150}"#)
            .unwrap();

        assert!(store.unlock("devices:site1", "other-node:1").unwrap());
        engine
            .assert_event(handle, "site1", r#"{"temperature": 150}"#)
            .unwrap();
    }

    /// 存储不可用时写入失败且不产生动作，恢复后正常处理
    #[test]
    fn test_store_outage_and_recovery() {
        let (nodes, store, _clock) = cluster("devices", 1, 10);
        let node = &nodes[0];

        node.engine
            .assert_fact(node.handle, "site1", r#"{"kind": "device", "name": "pump"}"#)
            .unwrap();

        store.set_available(false);
        let err = node
            .engine
            .assert_event(node.handle, "site1", r#"{"temperature": 150, "device": "pump"}"#)
            .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(err.is_retryable());
        assert!(node.engine.start_action(node.handle).unwrap().is_none());

        store.set_available(true);
        let outcome = node
            .engine
            .assert_event(node.handle, "site1", r#"{"temperature": 150, "device": "pump"}"#)
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);
        assert_eq!(node.engine.facts(node.handle, "site1").unwrap().len(), 1);
    }
}
