//! Redis 键名生成
//! Redis key name generation
//!
//! 所有键共享同一个 hash tag `{prefix}`，使集群模式下脚本访问的键落在同一槽位。
//! Every key shares the hash tag `{prefix}` so that all keys touched by one script
//! live in the same cluster slot.

use crate::base::constants::DEFAULT_KEY_PREFIX;
use ulid::Ulid;
use uuid::Uuid;

/// 并发跟踪集合的作用域前缀
/// Scope prefixes of the in-progress (concurrency) sets
pub const SCOPE_FUNCTION: &str = "p";
pub const SCOPE_ACCOUNT: &str = "account";
pub const SCOPE_CUSTOM: &str = "custom";

/// 键名生成器
/// Key name generator
#[derive(Debug, Clone)]
pub struct KeyGenerator {
  prefix: String,
}

impl Default for KeyGenerator {
  fn default() -> Self {
    Self::new(DEFAULT_KEY_PREFIX)
  }
}

impl KeyGenerator {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
    }
  }

  fn key(&self, rest: &str) -> String {
    format!("{{{}}}:{}", self.prefix, rest)
  }

  /// 队列项哈希：id -> JSON
  /// Queue item hash: id -> JSON
  pub fn queue_item(&self) -> String {
    self.key("queue:item")
  }

  /// 队列项租约哈希：id -> lease id
  /// Queue item lease hash: id -> lease id
  pub fn queue_lease(&self) -> String {
    self.key("queue:lease")
  }

  /// 分区哈希：分区 id -> JSON
  /// Partition hash: partition id -> JSON
  pub fn partition_item(&self) -> String {
    self.key("partition:item")
  }

  /// 分区内队列项的有序集合
  /// Sorted set holding a partition's queue items
  pub fn partition_queue_set(&self, partition_id: &str) -> String {
    self.key(&format!("queue:sorted:{partition_id}"))
  }

  pub fn global_partition_index(&self) -> String {
    self.key("partition:sorted")
  }

  pub fn global_account_index(&self) -> String {
    self.key("accounts:sorted")
  }

  pub fn account_partition_index(&self, account_id: &Uuid) -> String {
    self.key(&format!("accounts:{account_id}:partition:sorted"))
  }

  /// 分片的分区索引；空名称使用占位符
  /// A shard's partition index; an empty name uses a placeholder
  pub fn shard_partition_index(&self, shard_name: &str) -> String {
    let name = if shard_name.is_empty() { "-" } else { shard_name };
    self.key(&format!("shard:{name}"))
  }

  pub fn shards(&self) -> String {
    self.key("queue:shards")
  }

  pub fn idempotency(&self, item_id: &str) -> String {
    self.key(&format!("idempotency:{item_id}"))
  }

  pub fn fn_metadata(&self, fn_id: &Uuid) -> String {
    self.key(&format!("fnMeta:{fn_id}"))
  }

  /// 某个作用域的进行中集合：item id -> 租约过期时间
  /// In-progress set of a scope: item id -> lease expiry
  pub fn concurrency(&self, scope: &str, key: &str) -> String {
    let key = if key.is_empty() { "-" } else { key };
    self.key(&format!("concurrency:{scope}:{key}"))
  }

  /// 有进行中租约的函数索引，分数为最早的租约过期时间
  /// Index of functions with in-progress leases, scored by earliest expiry
  pub fn concurrency_index(&self) -> String {
    self.key("concurrency:sorted")
  }

  pub fn throttle(&self, key: &str) -> String {
    self.key(&format!("throttle:{key}"))
  }

  pub fn run_index(&self, run_id: &Ulid) -> String {
    self.key(&format!("idx:run:{run_id}"))
  }

  pub fn fn_peek_ewma(&self, fn_id: &Uuid) -> String {
    self.key(&format!("queue:ewma:{fn_id}"))
  }

  pub fn sequential(&self) -> String {
    self.key("queue:sequential")
  }

  pub fn scavenger(&self) -> String {
    self.key("queue:scavenger")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_share_hash_tag() {
    let kg = KeyGenerator::new("q");
    let fn_id = Uuid::nil();
    for key in [
      kg.queue_item(),
      kg.partition_item(),
      kg.partition_queue_set(&fn_id.to_string()),
      kg.account_partition_index(&fn_id),
      kg.concurrency(SCOPE_FUNCTION, &fn_id.to_string()),
      kg.shard_partition_index(""),
    ] {
      assert!(key.starts_with("{q}:"), "{key}");
    }
  }

  #[test]
  fn test_empty_components_use_placeholder() {
    let kg = KeyGenerator::default();
    assert_eq!(kg.shard_partition_index(""), "{stepq}:shard:-");
    assert_eq!(kg.concurrency(SCOPE_CUSTOM, ""), "{stepq}:concurrency:custom:-");
    assert_eq!(
      kg.concurrency(SCOPE_ACCOUNT, "a1"),
      "{stepq}:concurrency:account:a1"
    );
  }
}
