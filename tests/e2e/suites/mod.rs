//! 测试套件模块
//!
//! 按部署场景组织的测试用例集合。

pub mod redis_binding;
pub mod shared_store;
