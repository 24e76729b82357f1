//! 规则引擎 Worker
//!
//! 加载配置文件中的规则集，按固定间隔扫描定时器并执行待处理动作。
//! 这里的动作处理只记录日志并以空状态完成，实际部署时替换为业务处理。

use anyhow::{Context, Result};
use cep_engine::{Engine, EngineError, RulesetHandle, RulesetOptions};
use cep_shared::config::AppConfig;
use cep_shared::observability;
use cep_shared::retry::{RetryPolicy, retry_with_policy};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("cep-worker").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(environment = %config.environment, "Starting cep-worker...");

    let definition = tokio::fs::read_to_string(&config.engine.ruleset_path)
        .await
        .with_context(|| format!("读取规则集文件失败: {}", config.engine.ruleset_path))?;
    let options = RulesetOptions::from_config(&config.engine)?;

    let engine = Arc::new(Engine::new());
    let handle =
        engine.create_ruleset_with_options(&config.engine.ruleset_name, &definition, options)?;

    if config.redis.enabled {
        let policy = RetryPolicy::default();
        retry_with_policy(
            &policy,
            "bind_ruleset",
            |e: &EngineError| e.is_retryable(),
            || {
                let engine = Arc::clone(&engine);
                let redis = config.redis.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        engine.bind_ruleset_with_config(handle, &redis)
                    })
                    .await
                    .map_err(|e| EngineError::Internal(e.to_string()))?
                }
            },
        )
        .await?;
    }

    let interval = Duration::from_millis(config.engine.poll_interval_ms.max(1));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let engine = Arc::clone(&engine);
        match tokio::task::spawn_blocking(move || poll_once(&engine, handle)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(processed)) => info!(processed, "本轮动作处理完成"),
            Ok(Err(e)) => warn!(code = e.code(), error = %e, "轮询失败"),
            Err(e) => error!(error = %e, "轮询任务异常退出"),
        }

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// 扫描定时器并处理所有待执行动作，返回处理的动作数
fn poll_once(engine: &Engine, handle: RulesetHandle) -> cep_engine::Result<usize> {
    engine.sweep_timers(handle)?;

    let mut processed = 0;
    while let Some(lease) = engine.start_action(handle)? {
        info!(
            sid = %lease.sid,
            rule = %lease.rule,
            action = %lease.action,
            messages = %lease.messages_document(),
            "执行动作"
        );

        if let Err(e) = engine.complete_action(handle, lease.handle, "{}") {
            warn!(sid = %lease.sid, error = %e, "完成动作失败，放弃租约");
            if let Err(e) = engine.abandon_action(handle, lease.handle) {
                warn!(sid = %lease.sid, error = %e, "放弃动作失败");
            }
            return Err(e);
        }
        processed += 1;
    }
    Ok(processed)
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
