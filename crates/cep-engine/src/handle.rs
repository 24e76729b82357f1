//! 带代数（generation）校验的句柄与槽位表
//!
//! 句柄在槽位被释放后立即失效：同一索引被复用时代数递增，
//! 旧句柄的查找返回 None，而不是访问到新的对象。

use crate::error::{EngineError, Result};
use std::fmt;

/// 槽位键：索引 + 代数
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub index: u32,
    pub generation: u32,
}

impl SlotKey {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// 编码为跨边界传递的 u64 令牌（高 32 位为代数）
    pub const fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub const fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Debug for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Hash)]
        pub struct $name(pub(crate) SlotKey);

        impl $name {
            pub const fn to_token(self) -> u64 {
                self.0.to_token()
            }

            pub const fn from_token(token: u64) -> Self {
                Self(SlotKey::from_token(token))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

define_handle!(
    /// 规则集句柄
    RulesetHandle
);

/// 动作租约句柄：签发队列编号 + 槽位键
///
/// 每个动作队列的槽位表都从索引 0 开始，必须同时比对队列编号，
/// 否则一个规则集签发的句柄会命中另一个规则集的动作。
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ActionHandle {
    pub(crate) queue: u32,
    pub(crate) key: SlotKey,
}

impl ActionHandle {
    pub(crate) const fn new(queue: u32, key: SlotKey) -> Self {
        Self { queue, key }
    }

    /// 编码为跨边界传递的令牌（高 64 位为队列编号）
    pub const fn to_token(self) -> u128 {
        ((self.queue as u128) << 64) | self.key.to_token() as u128
    }

    pub const fn from_token(token: u128) -> Self {
        Self {
            queue: (token >> 64) as u32,
            key: SlotKey::from_token(token as u64),
        }
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionHandle(q{}:{:?})", self.queue, self.key)
    }
}

impl fmt::Display for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// 代数校验的槽位表
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 插入值，优先复用已释放的槽位
    pub fn insert(&mut self, value: T) -> Result<SlotKey> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            self.len += 1;
            return Ok(SlotKey::new(index, slot.generation));
        }

        let index = u32::try_from(self.slots.len())
            .map_err(|_| EngineError::ResourceExhausted("槽位索引已用尽".to_string()))?;
        self.slots
            .try_reserve(1)
            .map_err(|e| EngineError::ResourceExhausted(e.to_string()))?;
        // 代数从 1 开始，令牌 0 永远无效
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        self.len += 1;
        Ok(SlotKey::new(index, 1))
    }

    pub fn get(&self, key: SlotKey) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    /// 移除值并使该槽位的所有旧句柄失效
    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (SlotKey::new(index as u32, slot.generation), value))
        })
    }

    /// 清空所有值，已签发的句柄全部失效
    pub fn clear(&mut self) {
        let keys: Vec<SlotKey> = self.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();

        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_key_after_reuse() {
        let mut arena = Arena::new();
        let old = arena.insert(1).unwrap();
        assert_eq!(arena.remove(old), Some(1));

        let new = arena.insert(2).unwrap();
        assert_eq!(new.index, old.index);
        assert_ne!(new.generation, old.generation);

        assert_eq!(arena.get(old), None);
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn test_clear_invalidates_keys() {
        let mut arena = Arena::new();
        let a = arena.insert(1).unwrap();
        arena.clear();
        assert!(arena.is_empty());
        assert!(!arena.contains(a));
    }

    #[test]
    fn test_token_roundtrip_and_zero_is_invalid() {
        let mut arena = Arena::new();
        let key = arena.insert(()).unwrap();
        let handle = ActionHandle::new(7, key);

        assert_eq!(ActionHandle::from_token(handle.to_token()), handle);
        assert!(arena.get(SlotKey::from_token(0)).is_none());
    }

    #[test]
    fn test_action_handle_carries_queue() {
        let key = SlotKey::new(0, 1);
        let a = ActionHandle::new(1, key);
        let b = ActionHandle::new(2, key);

        assert_ne!(a, b);
        assert_ne!(a.to_token(), b.to_token());
        assert_eq!(format!("{a:?}"), "ActionHandle(q1:0v1)");
    }

    #[test]
    fn test_handle_debug_format() {
        let handle = RulesetHandle(SlotKey::new(42, 3));
        assert_eq!(format!("{handle:?}"), "RulesetHandle(42v3)");
    }
}
