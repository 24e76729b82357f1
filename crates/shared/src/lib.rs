//! 共享库
//!
//! 规则引擎与 Worker 共用的配置、可观测性和重试等基础设施代码。

pub mod config;
pub mod observability;
pub mod retry;
