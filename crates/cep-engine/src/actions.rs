//! 动作队列与租约
//!
//! 每个规则集一个就绪队列，与会话锁相互独立。
//! 状态迁移：
//! - Pending -> Leased：`lease`，出队与加租约在同一把锁内完成
//! - Leased -> Completing -> (移除)：`begin_complete` / `finish_complete`
//! - Completing -> Leased：`revert_complete`，写回状态失败时恢复租约
//! - Leased -> Pending / (移除)：`abandon`，按放弃策略重新投递或丢弃
//!
//! 重新投递的动作占用新的槽位，旧句柄随之失效。
//! 句柄带有签发队列的编号，其他规则集签发的句柄一律视为无效。

use crate::error::{EngineError, Result};
use crate::handle::{ActionHandle, Arena, SlotKey};
use crate::network::{Activation, Network};
use crate::timers::duration_ms;
use cep_shared::observability::metrics;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// 动作被放弃（或租约超时）后的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonPolicy {
    /// 重新入队，累计投递 `max_attempts` 次后丢弃
    Redeliver { max_attempts: u32 },
    /// 直接丢弃
    Drop,
}

impl Default for AbandonPolicy {
    fn default() -> Self {
        Self::Redeliver { max_attempts: 3 }
    }
}

impl AbandonPolicy {
    /// 从配置值解析（"redeliver" / "drop"）
    pub fn parse(policy: &str, max_attempts: u32) -> Result<Self> {
        match policy.to_ascii_lowercase().as_str() {
            "redeliver" => {
                if max_attempts == 0 {
                    return Err(EngineError::invalid_argument(
                        "max_delivery_attempts",
                        "必须大于 0",
                    ));
                }
                Ok(Self::Redeliver { max_attempts })
            }
            "drop" => Ok(Self::Drop),
            other => Err(EngineError::invalid_argument(
                "abandon_policy",
                format!("未知策略: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStatus {
    Pending,
    Leased { deadline: Option<u64> },
    Completing { deadline: Option<u64> },
}

/// 一个待执行的动作
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub sid: String,
    pub rule: String,
    pub action: String,
    pub messages: Map<String, Value>,
    /// 已投递次数
    pub attempts: u32,
    status: LeaseStatus,
}

/// 放弃动作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abandoned {
    Requeued,
    Dropped,
}

#[derive(Debug, Default)]
struct LeaseTable {
    ready: VecDeque<SlotKey>,
    records: Arena<ActionRecord>,
    deadlines: BTreeSet<(u64, SlotKey)>,
}

impl LeaseTable {
    fn leased(&self, key: SlotKey) -> Result<&ActionRecord> {
        match self.records.get(key) {
            Some(record) if matches!(record.status, LeaseStatus::Leased { .. }) => Ok(record),
            _ => Err(EngineError::InvalidHandle(format!(
                "动作租约不存在或已结束: {:?}",
                key
            ))),
        }
    }

    fn release(&mut self, key: SlotKey, policy: AbandonPolicy, ruleset: &str) -> Result<Abandoned> {
        let Some(record) = self.records.remove(key) else {
            return Err(EngineError::InvalidHandle(format!("{:?}", key)));
        };
        if let LeaseStatus::Leased {
            deadline: Some(deadline),
        } = record.status
        {
            self.deadlines.remove(&(deadline, key));
        }

        let redeliver = match policy {
            AbandonPolicy::Redeliver { max_attempts } => record.attempts < max_attempts,
            AbandonPolicy::Drop => false,
        };

        if !redeliver {
            warn!(
                ruleset,
                sid = %record.sid,
                rule = %record.rule,
                attempts = record.attempts,
                "动作已丢弃"
            );
            metrics::record_action_event(ruleset, "dropped");
            return Ok(Abandoned::Dropped);
        }

        let requeued = self.records.insert(ActionRecord {
            status: LeaseStatus::Pending,
            ..record
        })?;
        self.ready.push_back(requeued);
        metrics::record_action_event(ruleset, "requeued");
        Ok(Abandoned::Requeued)
    }

    /// 回收所有已超时的租约
    fn reclaim_expired(&mut self, now_ms: u64, policy: AbandonPolicy, ruleset: &str) {
        let expired: Vec<SlotKey> = self
            .deadlines
            .range(..=(now_ms, SlotKey::new(u32::MAX, u32::MAX)))
            .map(|(_, key)| *key)
            .collect();

        for key in expired {
            debug!(ruleset, action = ?key, "动作租约超时");
            metrics::record_action_event(ruleset, "expired");
            if let Err(e) = self.release(key, policy, ruleset) {
                warn!(ruleset, error = %e, "回收超时租约失败");
            }
        }
    }
}

/// 进程内队列编号，删除后重建的同名规则集也拿到新编号
static NEXT_QUEUE_ID: AtomicU32 = AtomicU32::new(1);

/// 规则集级别的动作队列
#[derive(Debug)]
pub struct ActionQueue {
    id: u32,
    ruleset: String,
    table: Mutex<LeaseTable>,
    lease_timeout_ms: Option<u64>,
    policy: AbandonPolicy,
}

impl ActionQueue {
    pub fn new(ruleset: &str, lease_timeout: Option<Duration>, policy: AbandonPolicy) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            ruleset: ruleset.to_string(),
            table: Mutex::new(LeaseTable::default()),
            lease_timeout_ms: lease_timeout.map(duration_ms),
            policy,
        }
    }

    /// 校验句柄由本队列签发，返回槽位键
    fn key_of(&self, handle: ActionHandle) -> Result<SlotKey> {
        if handle.queue == self.id {
            Ok(handle.key)
        } else {
            Err(EngineError::InvalidHandle(format!(
                "动作句柄不属于规则集 {}: {:?}",
                self.ruleset, handle
            )))
        }
    }

    /// 将一次传播产生的匹配加入就绪队列，返回入队数量
    ///
    /// 整批入队：任一匹配无法入队时已插入的记录全部撤回，队列保持调用前的状态。
    pub fn enqueue(&self, sid: &str, network: &Network, activations: Vec<Activation>) -> Result<usize> {
        if activations.is_empty() {
            return Ok(0);
        }

        let records = activations
            .into_iter()
            .map(|activation| -> Result<ActionRecord> {
                let production = network.production(activation.production).ok_or_else(|| {
                    EngineError::Internal(format!("产生式不存在: {}", activation.production))
                })?;
                Ok(ActionRecord {
                    sid: sid.to_string(),
                    rule: production.rule.clone(),
                    action: production.action.clone(),
                    messages: activation.messages,
                    attempts: 0,
                    status: LeaseStatus::Pending,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut table = self.table.lock();
        table
            .ready
            .try_reserve(records.len())
            .map_err(|e| EngineError::ResourceExhausted(e.to_string()))?;

        let mut inserted = Vec::with_capacity(records.len());
        for record in records {
            match table.records.insert(record) {
                Ok(key) => inserted.push(key),
                Err(e) => {
                    for key in inserted {
                        table.records.remove(key);
                    }
                    return Err(e);
                }
            }
        }
        let queued = inserted.len();
        table.ready.extend(inserted);

        metrics::record_action_event(&self.ruleset, "queued");
        debug!(ruleset = %self.ruleset, sid, queued, "动作入队");
        Ok(queued)
    }

    /// 取出一个待执行动作并加租约，没有可用动作时返回 None
    pub fn lease(&self, now_ms: u64) -> Option<(ActionHandle, ActionRecord)> {
        let mut table = self.table.lock();
        table.reclaim_expired(now_ms, self.policy, &self.ruleset);

        let deadline = self.lease_timeout_ms.map(|t| now_ms.saturating_add(t));
        while let Some(key) = table.ready.pop_front() {
            let Some(record) = table.records.get_mut(key) else {
                continue;
            };
            record.status = LeaseStatus::Leased { deadline };
            record.attempts += 1;
            let leased = record.clone();
            if let Some(deadline) = deadline {
                table.deadlines.insert((deadline, key));
            }
            metrics::record_action_event(&self.ruleset, "leased");
            return Some((ActionHandle::new(self.id, key), leased));
        }
        None
    }

    /// 撤销一次尚未交给调用方的租约，不计入投递次数
    pub fn restore(&self, handle: ActionHandle) {
        let Ok(key) = self.key_of(handle) else {
            return;
        };
        let mut table = self.table.lock();
        let Some(record) = table.records.get_mut(key) else {
            return;
        };
        let LeaseStatus::Leased { deadline } = record.status else {
            return;
        };
        record.status = LeaseStatus::Pending;
        record.attempts = record.attempts.saturating_sub(1);
        if let Some(deadline) = deadline {
            table.deadlines.remove(&(deadline, key));
        }
        table.ready.push_front(key);
    }

    /// 开始完成动作：校验租约并锁定，防止并发的完成/放弃
    pub fn begin_complete(&self, handle: ActionHandle) -> Result<ActionRecord> {
        let key = self.key_of(handle)?;
        let mut table = self.table.lock();
        let record = table.leased(key)?.clone();
        let LeaseStatus::Leased { deadline } = record.status else {
            return Err(EngineError::InvalidHandle(format!("{:?}", key)));
        };

        if let Some(deadline) = deadline {
            table.deadlines.remove(&(deadline, key));
        }
        if let Some(r) = table.records.get_mut(key) {
            r.status = LeaseStatus::Completing { deadline };
        }
        Ok(record)
    }

    pub fn finish_complete(&self, handle: ActionHandle) {
        let Ok(key) = self.key_of(handle) else {
            return;
        };
        let mut table = self.table.lock();
        if table.records.remove(key).is_some() {
            metrics::record_action_event(&self.ruleset, "completed");
        }
    }

    /// 写回状态失败时恢复租约，调用方可以重试完成
    pub fn revert_complete(&self, handle: ActionHandle) {
        let Ok(key) = self.key_of(handle) else {
            return;
        };
        let mut table = self.table.lock();
        let Some(record) = table.records.get_mut(key) else {
            return;
        };
        let LeaseStatus::Completing { deadline } = record.status else {
            return;
        };
        record.status = LeaseStatus::Leased { deadline };
        if let Some(deadline) = deadline {
            table.deadlines.insert((deadline, key));
        }
    }

    pub fn abandon(&self, handle: ActionHandle) -> Result<Abandoned> {
        let key = self.key_of(handle)?;
        let mut table = self.table.lock();
        table.leased(key)?;
        metrics::record_action_event(&self.ruleset, "abandoned");
        table.release(key, self.policy, &self.ruleset)
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().ready.len()
    }

    /// 已加租约（含正在完成）的动作数
    pub fn leased_count(&self) -> usize {
        let table = self.table.lock();
        table.records.len() - table.ready.len()
    }

    /// 丢弃所有动作，已签发的句柄全部失效
    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.ready.clear();
        table.deadlines.clear();
        table.records.clear();
    }
}
