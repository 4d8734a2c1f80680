//! 内存存储实现
//! Memory store implementation
//!
//! 在一把写锁下模拟 Redis 的哈希、有序集合、字符串和列表，
//! 复合操作因此与 Lua 脚本一样原子。
//! Emulates Redis hashes, sorted sets, strings and lists under one write lock, so
//! compound operations are as atomic as the Lua scripts.

use crate::base::{PartitionRef, PointerKeys};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::lease::LeaseId;
use crate::partition::QueuePartition;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 有序集合
/// Sorted set
///
/// 同分数的成员按字典序排列，与 Redis 相同。
/// Members with equal scores are ordered lexicographically, as in Redis.
#[derive(Debug, Default, Clone)]
pub struct SortedSet {
  scores: HashMap<String, i64>,
  ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
  pub fn add(&mut self, member: &str, score: i64) {
    if let Some(old) = self.scores.insert(member.to_string(), score) {
      self.ordered.remove(&(old, member.to_string()));
    }
    self.ordered.insert((score, member.to_string()));
  }

  pub fn remove(&mut self, member: &str) -> bool {
    match self.scores.remove(member) {
      Some(score) => self.ordered.remove(&(score, member.to_string())),
      None => false,
    }
  }

  pub fn score(&self, member: &str) -> Option<i64> {
    self.scores.get(member).copied()
  }

  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scores.is_empty()
  }

  /// 最小分数的成员
  /// Member with the lowest score
  pub fn first(&self) -> Option<(&str, i64)> {
    self.ordered.iter().next().map(|(s, m)| (m.as_str(), *s))
  }

  fn scored(&self, min: i64, max: i64) -> impl Iterator<Item = &(i64, String)> {
    self
      .ordered
      .range((min, String::new())..)
      .take_while(move |(s, _)| *s <= max)
  }

  pub fn count(&self, min: i64, max: i64) -> i64 {
    if min > max {
      return 0;
    }
    self.scored(min, max).count() as i64
  }

  pub fn range_by_score(&self, min: i64, max: i64, limit: i64) -> Vec<(String, i64)> {
    if min > max {
      return Vec::new();
    }
    let take = if limit > 0 { limit as usize } else { usize::MAX };
    self
      .scored(min, max)
      .take(take)
      .map(|(s, m)| (m.clone(), *s))
      .collect()
  }

  pub fn range(&self, start: i64, stop: i64) -> Vec<String> {
    let len = self.len() as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
      return Vec::new();
    }
    self
      .ordered
      .iter()
      .skip(start as usize)
      .take((stop - start + 1) as usize)
      .map(|(_, m)| m.clone())
      .collect()
  }

  pub fn rank(&self, member: &str) -> Option<i64> {
    let score = self.score(member)?;
    Some(self.ordered.range(..(score, member.to_string())).count() as i64)
  }
}

#[derive(Debug, Clone)]
struct StringValue {
  value: String,
  expires_at_ms: Option<i64>,
}

/// 内存中的键空间
/// In-memory keyspace
#[derive(Debug, Default)]
pub struct MemoryStorage {
  hashes: HashMap<String, HashMap<String, String>>,
  zsets: HashMap<String, SortedSet>,
  strings: HashMap<String, StringValue>,
  lists: HashMap<String, VecDeque<String>>,
}

impl MemoryStorage {
  // === 哈希 ===
  // === Hashes ===

  pub fn hget(&self, key: &str, field: &str) -> Option<String> {
    self.hashes.get(key).and_then(|h| h.get(field)).cloned()
  }

  pub fn hexists(&self, key: &str, field: &str) -> bool {
    self.hashes.get(key).is_some_and(|h| h.contains_key(field))
  }

  pub fn hset(&mut self, key: &str, field: &str, value: String) {
    self
      .hashes
      .entry(key.to_string())
      .or_default()
      .insert(field.to_string(), value);
  }

  pub fn hsetnx(&mut self, key: &str, field: &str, value: &str) {
    self
      .hashes
      .entry(key.to_string())
      .or_default()
      .entry(field.to_string())
      .or_insert_with(|| value.to_string());
  }

  pub fn hdel(&mut self, key: &str, field: &str) {
    if let Some(h) = self.hashes.get_mut(key) {
      h.remove(field);
      if h.is_empty() {
        self.hashes.remove(key);
      }
    }
  }

  pub fn hvals(&self, key: &str) -> Vec<String> {
    self
      .hashes
      .get(key)
      .map(|h| h.values().cloned().collect())
      .unwrap_or_default()
  }

  // === 有序集合 ===
  // === Sorted sets ===

  pub fn zset(&self, key: &str) -> Option<&SortedSet> {
    self.zsets.get(key)
  }

  pub fn zadd(&mut self, key: &str, score: i64, member: &str) {
    self.zsets.entry(key.to_string()).or_default().add(member, score);
  }

  pub fn zrem(&mut self, key: &str, member: &str) {
    if let Some(z) = self.zsets.get_mut(key) {
      z.remove(member);
      if z.is_empty() {
        self.zsets.remove(key);
      }
    }
  }

  pub fn zscore(&self, key: &str, member: &str) -> Option<i64> {
    self.zset(key).and_then(|z| z.score(member))
  }

  pub fn zcard(&self, key: &str) -> i64 {
    self.zset(key).map(|z| z.len() as i64).unwrap_or(0)
  }

  pub fn zcount(&self, key: &str, min: i64, max: i64) -> i64 {
    self.zset(key).map(|z| z.count(min, max)).unwrap_or(0)
  }

  pub fn zfirst_score(&self, key: &str) -> Option<i64> {
    self.zset(key).and_then(|z| z.first()).map(|(_, s)| s)
  }

  // === 字符串 ===
  // === Strings ===

  pub fn get(&self, key: &str, now_ms: i64) -> Option<String> {
    self
      .strings
      .get(key)
      .filter(|v| v.expires_at_ms.is_none_or(|at| at > now_ms))
      .map(|v| v.value.clone())
  }

  pub fn exists(&self, key: &str, now_ms: i64) -> bool {
    self.get(key, now_ms).is_some()
  }

  /// 写入字符串，`ttl_ms` 为 None 时不过期
  /// Write a string; no expiry when `ttl_ms` is None
  pub fn set(&mut self, key: &str, value: String, ttl_ms: Option<i64>, now_ms: i64) {
    self.strings.insert(
      key.to_string(),
      StringValue {
        value,
        expires_at_ms: ttl_ms.map(|ttl| now_ms + ttl),
      },
    );
  }

  pub fn set_nx(&mut self, key: &str, value: &str, now_ms: i64) {
    if !self.exists(key, now_ms) {
      self.set(key, value.to_string(), None, now_ms);
    }
  }

  // === 列表 ===
  // === Lists ===

  pub fn lrange(&self, key: &str) -> Vec<String> {
    self
      .lists
      .get(key)
      .map(|l| l.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn push_capped(&mut self, key: &str, value: &str, len: usize) {
    let list = self.lists.entry(key.to_string()).or_default();
    list.push_back(value.to_string());
    while list.len() > len {
      list.pop_front();
    }
  }

  // === 与 Lua 辅助函数对应的复合操作 ===
  // === Compound helpers shared with the Lua scripts ===

  pub fn partition(&self, hash: &str, id: &str) -> Result<Option<QueuePartition>> {
    match self.hget(hash, id) {
      Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      None => Ok(None),
    }
  }

  pub fn put_partition(&mut self, hash: &str, p: &QueuePartition) -> Result<()> {
    let raw = serde_json::to_string(p)?;
    self.hset(hash, &p.id, raw);
    Ok(())
  }

  /// 账户索引的分数为其分区索引中最早的指针
  /// An account is scored by the earliest pointer in its partition index
  pub fn update_account(&mut self, global_account_index: &str, account_index: &str, account: &str) {
    match self.zfirst_score(account_index) {
      Some(score) => self.zadd(global_account_index, score, account),
      None => self.zrem(global_account_index, account),
    }
  }

  /// 并发索引的分数为进行中集合中最早的过期时间
  /// The concurrency index scores a member by its earliest in-progress expiry
  pub fn update_concurrency_index(&mut self, index: &str, in_progress: &str, member: &str) {
    if member.is_empty() {
      return;
    }
    match self.zfirst_score(in_progress) {
      Some(score) => self.zadd(index, score, member),
      None => self.zrem(index, member),
    }
  }

  /// 将分区指针设置到给定分数
  /// Set a partition's pointer in every index to the given score
  pub fn set_pointer(
    &mut self,
    keys: &PointerKeys,
    account_index: &str,
    account: &str,
    partition_id: &str,
    score: i64,
  ) {
    self.zadd(&keys.global_index, score, partition_id);
    if !account.is_empty() {
      self.zadd(account_index, score, partition_id);
      self.update_account(&keys.global_account_index, account_index, account);
    }
    if let Some(shard) = &keys.shard_index {
      self.zadd(shard, score, partition_id);
    }
  }

  /// 从所有索引中移除分区指针
  /// Remove a partition's pointer from every index
  pub fn remove_pointer(
    &mut self,
    keys: &PointerKeys,
    account_index: &str,
    account: &str,
    partition_id: &str,
  ) {
    self.zrem(&keys.global_index, partition_id);
    if !account.is_empty() {
      self.zrem(account_index, partition_id);
      self.update_account(&keys.global_account_index, account_index, account);
    }
    if let Some(shard) = &keys.shard_index {
      self.zrem(shard, partition_id);
    }
  }

  /// 只在指针缺失或更晚时将其提前；强制推迟或已租用的分区不动
  /// Pull a pointer earlier only when it is absent or later; forced or leased
  /// partitions are left alone
  pub fn update_pointer(
    &mut self,
    keys: &PointerKeys,
    partition: &PartitionRef,
    score: i64,
    now_ms: i64,
  ) -> Result<()> {
    let Some(p) = self.partition(&keys.partition_hash, &partition.id)? else {
      return Ok(());
    };
    if p.force_at_ms > now_ms || p.is_leased(now_ms) {
      return Ok(());
    }
    let current = self.zscore(&keys.global_index, &partition.id);
    if current.is_none_or(|c| c > score) {
      self.set_pointer(
        keys,
        &partition.account_index,
        &partition.account_id,
        &partition.id,
        score,
      );
    }
    Ok(())
  }
}

/// 判断租约字符串在给定时间是否有效
/// Whether a stored lease string is valid at `now_ms`
pub(crate) fn lease_valid(raw: Option<&str>, now_ms: i64) -> bool {
  raw
    .and_then(|s| s.parse::<LeaseId>().ok())
    .is_some_and(|l| l.is_valid_at(now_ms))
}

/// 内存存储
/// Memory store
#[derive(Clone)]
pub struct MemoryStore {
  pub(crate) storage: Arc<RwLock<MemoryStorage>>,
  pub(crate) clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new(Arc::new(SystemClock))
  }
}

impl MemoryStore {
  /// 创建新的内存存储，时钟用于字符串过期
  /// Create a new memory store; the clock drives string expiry
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      storage: Arc::new(RwLock::new(MemoryStorage::default())),
      clock,
    }
  }
}
