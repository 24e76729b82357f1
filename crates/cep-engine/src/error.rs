//! 规则引擎错误类型
//!
//! `EngineError` 是所有对外操作的错误类型，附带字符串错误码、数值错误码和可重试标记。
//! 未命中（NotHandled）与无可用动作不是错误，以普通返回值表达。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    // ==================== 定义与参数错误 ====================
    #[error("规则集定义无效: {0}")]
    InvalidDefinition(String),

    #[error("规则集已存在: {name}")]
    DuplicateName { name: String },

    #[error("无效的参数: {field} - {message}")]
    InvalidArgument { field: String, message: String },

    #[error("无效的文档: {0}")]
    InvalidDocument(String),

    // ==================== 句柄与生命周期错误 ====================
    #[error("无效或已失效的句柄: {0}")]
    InvalidHandle(String),

    #[error("规则集正在被使用: {name}")]
    Busy { name: String },

    // ==================== 远端存储错误 ====================
    #[error("远端存储连接失败: {0}")]
    Connection(String),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("获取会话锁超时: {resource}")]
    LockTimeout { resource: String },

    #[error("远端数据损坏: {0}")]
    Corrupted(String),

    // ==================== 通用错误 ====================
    #[error("资源耗尽: {0}")]
    ResourceExhausted(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDefinition(_) => "INVALID_DEFINITION",
            Self::DuplicateName { .. } => "DUPLICATE_NAME",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::InvalidDocument(_) => "INVALID_DOCUMENT",
            Self::InvalidHandle(_) => "INVALID_HANDLE",
            Self::Busy { .. } => "BUSY",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Corrupted(_) => "CORRUPTED",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 数值错误码，用于跨语言边界诊断
    ///
    /// 1xx 调用方错误，2xx 远端存储错误，3xx 资源错误，4xx 数据错误，500 内部错误。
    pub fn numeric_code(&self) -> u16 {
        match self {
            Self::InvalidDefinition(_) => 101,
            Self::DuplicateName { .. } => 102,
            Self::InvalidHandle(_) => 103,
            Self::Busy { .. } => 104,
            Self::InvalidDocument(_) => 105,
            Self::InvalidArgument { .. } => 106,
            Self::Connection(_) => 201,
            Self::Redis(_) => 202,
            Self::LockTimeout { .. } => 203,
            Self::ResourceExhausted(_) => 301,
            Self::Corrupted(_) => 401,
            Self::Internal(_) => 500,
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Redis(_) | Self::LockTimeout { .. } | Self::Busy { .. }
        )
    }

    pub(crate) fn invalid_argument(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// 条件求值错误
///
/// 只在网络内部使用：求值失败的条件按不匹配处理。
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("无效的操作数: {0}")]
    InvalidOperand(String),
}
