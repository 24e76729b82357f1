//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use super::ObservabilityConfig;

/// 初始化 Prometheus 指标导出
///
/// 安装全局 recorder，并在指定端口启动 HTTP 监听。需要在 tokio 运行时内调用。
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Metrics exporter listening on {}", addr);

    register_common_metrics(&config.service_name);
    Ok(())
}

/// 注册通用指标
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "cep_assertions_total",
        "Total number of asserted events, facts and state documents"
    );
    metrics::describe_counter!(
        "cep_action_transitions_total",
        "Action lease transitions (queued, leased, completed, abandoned, dropped)"
    );
    metrics::describe_counter!("cep_timers_fired_total", "Total number of fired timers");
    metrics::describe_counter!(
        "cep_session_evictions_total",
        "Sessions evicted from the session cache"
    );
    metrics::describe_gauge!("cep_resident_sessions", "Sessions resident in memory");
    metrics::describe_histogram!(
        "cep_assertion_duration_seconds",
        "Time spent propagating one assertion"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次断言（kind: event / fact / state / retract）
#[inline]
pub fn record_assertion(ruleset: &str, kind: &str, handled: bool, duration_secs: f64) {
    metrics::counter!(
        "cep_assertions_total",
        "ruleset" => ruleset.to_string(),
        "kind" => kind.to_string(),
        "handled" => handled.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "cep_assertion_duration_seconds",
        "ruleset" => ruleset.to_string(),
        "kind" => kind.to_string()
    )
    .record(duration_secs);
}

/// 记录动作状态迁移
#[inline]
pub fn record_action_event(ruleset: &str, transition: &str) {
    metrics::counter!(
        "cep_action_transitions_total",
        "ruleset" => ruleset.to_string(),
        "transition" => transition.to_string()
    )
    .increment(1);
}

/// 记录触发的定时器数量
#[inline]
pub fn record_timers_fired(ruleset: &str, count: usize) {
    metrics::counter!("cep_timers_fired_total", "ruleset" => ruleset.to_string())
        .increment(count as u64);
}

/// 记录会话淘汰
#[inline]
pub fn record_session_eviction(ruleset: &str, persisted: bool) {
    metrics::counter!(
        "cep_session_evictions_total",
        "ruleset" => ruleset.to_string(),
        "persisted" => persisted.to_string()
    )
    .increment(1);
}

/// 更新常驻会话数
#[inline]
pub fn set_resident_sessions(ruleset: &str, count: usize) {
    metrics::gauge!("cep_resident_sessions", "ruleset" => ruleset.to_string()).set(count as f64);
}
