//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker 启动时创建的规则集名称
    pub ruleset_name: String,
    /// 规则集定义文件路径（JSON）
    pub ruleset_path: String,
    /// 每个规则集常驻内存的会话上限
    pub cache_capacity: usize,
    /// 动作租约超时（秒），0 表示不超时
    pub lease_timeout_secs: u64,
    /// 动作最多投递次数（含首次）
    pub max_delivery_attempts: u32,
    /// 放弃动作后的处理策略：redeliver 或 drop
    pub abandon_policy: String,
    /// 单次扫描最多触发的定时器数量
    pub max_timers_per_sweep: usize,
    /// Worker 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ruleset_name: "default".to_string(),
            ruleset_path: "config/ruleset.json".to_string(),
            cache_capacity: 1024,
            lease_timeout_secs: 60,
            max_delivery_attempts: 3,
            abandon_policy: "redeliver".to_string(),
            max_timers_per_sweep: 100,
            poll_interval_ms: 200,
        }
    }
}

/// Redis 配置（分布式绑定）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// 连接与读写超时（毫秒）
    pub timeout_ms: u64,
    /// 会话锁 TTL（毫秒）
    pub lock_ttl_ms: u64,
    /// 获取会话锁的重试次数
    pub lock_retry_count: u32,
    /// 获取会话锁的重试间隔（毫秒）
    pub lock_retry_delay_ms: u64,
    /// 所有 key 的前缀
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            timeout_ms: 2000,
            lock_ttl_ms: 5000,
            lock_retry_count: 50,
            lock_retry_delay_ms: 10,
            key_prefix: "cep".to_string(),
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub service_name: String,
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    /// 注入服务名（配置文件中通常不单独配置）
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }

    /// 是否输出 JSON 日志
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: EngineConfig,
    pub redis: RedisConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（CEP_ 前缀，如 CEP_REDIS__HOST -> redis.host）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("CEP_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            // 字段名本身带下划线（如 cache_capacity），层级分隔使用双下划线
            .add_source(
                Environment::with_prefix("CEP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
