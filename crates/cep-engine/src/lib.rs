//! 持久化会话规则引擎
//!
//! 提供面向大量长生命周期会话的复杂事件处理能力：
//! - JSON 规则集定义的编译（共享 alpha 节点，逐模式 join）
//! - 事件、事实、状态三类输入的增量匹配
//! - 有界会话缓存（LRU 淘汰，绑定远端存储时写穿）
//! - 动作租约（每个动作同一时刻至多一个租约）
//! - 由调用方驱动的定时器
//! - 可选的 Redis 分布式绑定

pub mod actions;
pub mod binding;
pub mod cache;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod handle;
pub mod models;
pub mod network;
pub mod operators;
pub mod ruleset;
pub mod session;
pub mod timers;

pub use actions::AbandonPolicy;
pub use binding::memory::MemoryStore;
pub use binding::redis_store::RedisStore;
pub use binding::{Binding, LockConfig, StateStore};
pub use compiler::RulesetCompiler;
pub use engine::{ActionLease, Engine, Outcome};
pub use error::{EngineError, EvalError, Result};
pub use evaluator::ConditionEvaluator;
pub use handle::{ActionHandle, RulesetHandle};
pub use models::{
    Condition, DocumentKind, LogicalGroup, Operand, PatternDefinition, RuleDefinition, RuleNode,
    RulesetDefinition, Source,
};
pub use network::Network;
pub use operators::{LogicalOperator, Operator};
pub use ruleset::{Ruleset, RulesetOptions, RulesetStats};
pub use timers::{Clock, ManualClock, SystemClock, Timer};
