//! Redis 绑定测试套件
//!
//! 需要本地 Redis，地址通过 `REDIS_HOST` / `REDIS_PORT` 覆盖，默认 127.0.0.1:6379。
//! 每个测试使用独立的规则集名称，结束时清理对应 key。

use crate::DEVICE_RULES;
use cep_engine::{Engine, EngineError, Outcome, RulesetHandle};
use cep_shared::config::RedisConfig;
use uuid::Uuid;

fn redis_config() -> RedisConfig {
    RedisConfig {
        enabled: true,
        host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379),
        ..Default::default()
    }
}

/// 创建绑定到 Redis 的引擎
fn bound_engine(ruleset: &str) -> (Engine, RulesetHandle) {
    let engine = Engine::new();
    let handle = engine.create_ruleset(ruleset, DEVICE_RULES, 10).unwrap();
    engine
        .bind_ruleset_with_config(handle, &redis_config())
        .unwrap();
    (engine, handle)
}

fn unique_ruleset() -> String {
    format!("e2e_{}", Uuid::new_v4().simple())
}

fn cleanup(ruleset: &str) {
    let config = redis_config();
    let client = redis::Client::open(format!("redis://{}:{}/", config.host, config.port)).unwrap();
    let mut conn = client.get_connection().unwrap();
    let pattern = format!("{}:{}:*", config.key_prefix, ruleset);
    let keys: Vec<String> = redis::cmd("KEYS").arg(&pattern).query(&mut conn).unwrap();
    if !keys.is_empty() {
        let _: () = redis::cmd("DEL").arg(&keys).query(&mut conn).unwrap();
    }
}

#[cfg(test)]
mod redis_tests {
    use super::*;

    /// 两个引擎通过 Redis 共享会话
    #[test]
    #[ignore = "需要运行 Redis"]
    fn test_session_shared_through_redis() {
        let ruleset = unique_ruleset();
        let (a, ha) = bound_engine(&ruleset);
        let (b, hb) = bound_engine(&ruleset);

        a.assert_fact(ha, "site1", r#"{"kind": "device", "name": "pump"}"#)
            .unwrap();
        let outcome = b
            .assert_event(hb, "site1", r#"{"temperature": 150, "device": "pump"}"#)
            .unwrap();
        assert_eq!(outcome, Outcome::Handled);

        let lease = b.start_action(hb).unwrap().expect("应有待执行动作");
        b.complete_action(hb, lease.handle, r#"{"cooling": true}"#)
            .unwrap();

        let state: serde_json::Value =
            serde_json::from_str(&a.get_state(ha, "site1").unwrap()).unwrap();
        assert_eq!(state["cooling"], true);

        cleanup(&ruleset);
    }

    /// 到期定时器只被一个实例领取
    #[test]
    #[ignore = "需要运行 Redis"]
    fn test_timer_claimed_once_through_redis() {
        let ruleset = unique_ruleset();
        let (a, ha) = bound_engine(&ruleset);
        let (b, hb) = bound_engine(&ruleset);

        a.start_timer(ha, "site1", 0, r#"{"$timer": "heartbeat"}"#)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let fired_a = a.sweep_timers(ha).unwrap();
        let fired_b = b.sweep_timers(hb).unwrap();
        assert!(fired_a ^ fired_b);

        cleanup(&ruleset);
    }

    /// 不可达的 Redis 绑定失败，规则集保持未绑定
    #[test]
    fn test_bind_unreachable_port() {
        let engine = Engine::new();
        let handle = engine.create_ruleset("unreachable", DEVICE_RULES, 10).unwrap();

        let err = engine
            .bind_ruleset(handle, "127.0.0.1", 1, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)));
        assert!(!engine.stats(handle).unwrap().bound);

        engine
            .assert_event(handle, "site1", r#"{"temperature": 150}"#)
            .unwrap();
    }
}
