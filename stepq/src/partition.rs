//! 分区与分片模块
//! Partition and shard module
//!
//! 分区是可独立租用的子队列，按函数、自定义并发键或系统队列名分组。
//! A partition is an independently leasable sub-queue, grouped by function, by custom
//! concurrency key, or by a system queue name.

use crate::base::constants::PRIORITY_DEFAULT;
use crate::base::keys::{KeyGenerator, SCOPE_ACCOUNT, SCOPE_CUSTOM, SCOPE_FUNCTION};
use crate::error::Result;
pub use crate::item::ConcurrencyScope;
use crate::item::ConcurrencyKey;
use crate::lease::LeaseId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 分区类型
/// Partition kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionKind {
  /// 函数分区，ID 为函数 ID
  /// Function partition; its ID is the function ID
  Function { function_id: Uuid },
  /// 自定义并发键分区，ID 为完整的并发键
  /// Custom concurrency key partition; its ID is the full key
  ConcurrencyKey {
    scope: ConcurrencyScope,
    scope_id: Uuid,
    hash: String,
  },
  /// 按类型映射的系统队列，ID 为队列名
  /// System queue mapped from an item kind; its ID is the queue name
  System,
}

/// 队列分区
/// Queue partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePartition {
  pub id: String,
  pub kind: PartitionKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub account_id: Option<Uuid>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub env_id: Option<Uuid>,
  /// 扫描该分区的独占租约
  /// Exclusive right to scan this partition
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lease_id: Option<LeaseId>,
  /// 最近一次租用时间（毫秒）
  /// Last lease time in milliseconds
  #[serde(default)]
  pub last: i64,
  /// 因并发受限被强制推后的时间（毫秒）
  /// Time the pointer was forced to after a concurrency-limited lease, in milliseconds
  #[serde(default)]
  pub force_at_ms: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub concurrency_limit: Option<i64>,
  /// 设置并发上限的函数
  /// Function that set the concurrency limit
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub limit_owner: Option<Uuid>,
  #[serde(default = "default_priority")]
  pub priority: i32,
}

fn default_priority() -> i32 {
  PRIORITY_DEFAULT
}

impl QueuePartition {
  fn with_kind(id: String, kind: PartitionKind) -> Self {
    Self {
      id,
      kind,
      account_id: None,
      env_id: None,
      lease_id: None,
      last: 0,
      force_at_ms: 0,
      concurrency_limit: None,
      limit_owner: None,
      priority: PRIORITY_DEFAULT,
    }
  }

  /// 函数分区
  /// Function-scoped partition
  pub fn function(function_id: Uuid, account_id: Uuid) -> Self {
    let mut p = Self::with_kind(
      function_id.to_string(),
      PartitionKind::Function { function_id },
    );
    p.account_id = Some(account_id);
    p
  }

  /// 自定义并发键分区，租户指针取决于键的作用域
  /// Custom-key partition; tenant pointers depend on the key's scope
  pub fn concurrency_key(key: &ConcurrencyKey, account_id: Uuid, env_id: Uuid) -> Result<Self> {
    let (scope, scope_id, hash) = key.parse()?;
    let mut p = Self::with_kind(
      key.key.clone(),
      PartitionKind::ConcurrencyKey {
        scope,
        scope_id,
        hash: hash.to_string(),
      },
    );
    p.concurrency_limit = Some(key.limit);
    match scope {
      ConcurrencyScope::Function => {
        p.account_id = Some(account_id);
        p.env_id = Some(env_id);
      }
      ConcurrencyScope::Environment => {
        p.account_id = Some(account_id);
        p.env_id = Some(scope_id);
      }
      ConcurrencyScope::Account => {
        p.account_id = Some(scope_id);
      }
    }
    Ok(p)
  }

  /// 系统队列分区
  /// System queue partition
  pub fn system(name: impl Into<String>, account_id: Uuid) -> Self {
    let mut p = Self::with_kind(name.into(), PartitionKind::System);
    p.account_id = Some(account_id);
    p
  }

  pub fn queue(&self) -> &str {
    &self.id
  }

  /// 分区所属函数（账户或环境作用域时为空）
  /// Owning function; none for account or environment scoped partitions
  pub fn function_id(&self) -> Option<Uuid> {
    match &self.kind {
      PartitionKind::Function { function_id } => Some(*function_id),
      PartitionKind::ConcurrencyKey {
        scope: ConcurrencyScope::Function,
        scope_id,
        ..
      } => Some(*scope_id),
      _ => None,
    }
  }

  pub fn is_concurrency_key(&self) -> bool {
    matches!(self.kind, PartitionKind::ConcurrencyKey { .. })
  }

  pub fn is_leased(&self, now_ms: i64) -> bool {
    self.lease_id.is_some_and(|l| l.is_valid_at(now_ms))
  }

  pub fn zset_key(&self, kg: &KeyGenerator) -> String {
    kg.partition_queue_set(&self.id)
  }

  /// 函数级进行中集合；系统分区按队列名计
  /// Function-level in-progress set; system partitions count under their queue name
  pub fn fn_concurrency_key(&self, kg: &KeyGenerator) -> String {
    if matches!(self.kind, PartitionKind::System) {
      return kg.concurrency(SCOPE_FUNCTION, &self.id);
    }
    let id = self.function_id().map(|f| f.to_string()).unwrap_or_default();
    kg.concurrency(SCOPE_FUNCTION, &id)
  }

  pub fn acct_concurrency_key(&self, kg: &KeyGenerator) -> String {
    let id = self.account_id.map(|a| a.to_string()).unwrap_or_default();
    kg.concurrency(SCOPE_ACCOUNT, &id)
  }

  /// 计入本分区的进行中集合
  /// In-progress set attributed to this partition
  pub fn in_progress_key(&self, kg: &KeyGenerator) -> String {
    match self.kind {
      PartitionKind::ConcurrencyKey { .. } => kg.concurrency(SCOPE_CUSTOM, &self.id),
      _ => self.fn_concurrency_key(kg),
    }
  }
}

/// 函数元数据
/// Function metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnMetadata {
  pub fn_id: Uuid,
  #[serde(default)]
  pub paused: bool,
}

/// 分片：拥有保证容量的一组分区
/// Shard: a group of partitions with guaranteed worker capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueShard {
  pub name: String,
  #[serde(default)]
  pub priority: u32,
  /// 必须始终扫描该分片的最少工作进程数
  /// Minimum number of workers that must always scan this shard
  #[serde(default)]
  pub guaranteed_capacity: u32,
  #[serde(default)]
  pub leases: Vec<LeaseId>,
}

impl QueueShard {
  pub fn new(name: impl Into<String>, guaranteed_capacity: u32) -> Self {
    Self {
      name: name.into(),
      priority: 0,
      guaranteed_capacity,
      leases: Vec::new(),
    }
  }

  /// 分片分区索引的名称
  /// Name of the shard's partition index
  pub fn partition(&self) -> &str {
    &self.name
  }

  pub fn valid_leases(&self, now_ms: i64) -> usize {
    self.leases.iter().filter(|l| l.is_valid_at(now_ms)).count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_function_partition() {
    let fn_id = Uuid::new_v4();
    let acct = Uuid::new_v4();
    let kg = KeyGenerator::new("t");
    let p = QueuePartition::function(fn_id, acct);
    assert_eq!(p.id, fn_id.to_string());
    assert_eq!(p.function_id(), Some(fn_id));
    assert_eq!(p.zset_key(&kg), format!("{{t}}:queue:sorted:{fn_id}"));
    assert_eq!(p.in_progress_key(&kg), format!("{{t}}:concurrency:p:{fn_id}"));
    assert_eq!(p.priority, PRIORITY_DEFAULT);
  }

  #[test]
  fn test_concurrency_key_partition_scopes() {
    let acct = Uuid::new_v4();
    let env = Uuid::new_v4();
    let scope_id = Uuid::new_v4();

    let key = ConcurrencyKey::new(ConcurrencyScope::Account, scope_id, "k", 2);
    let p = QueuePartition::concurrency_key(&key, acct, env).unwrap();
    assert_eq!(p.account_id, Some(scope_id));
    assert_eq!(p.function_id(), None);
    assert_eq!(p.concurrency_limit, Some(2));

    let key = ConcurrencyKey::new(ConcurrencyScope::Environment, scope_id, "k", 2);
    let p = QueuePartition::concurrency_key(&key, acct, env).unwrap();
    assert_eq!(p.env_id, Some(scope_id));
    assert_eq!(p.account_id, Some(acct));

    let key = ConcurrencyKey::new(ConcurrencyScope::Function, scope_id, "k", 2);
    let p = QueuePartition::concurrency_key(&key, acct, env).unwrap();
    assert_eq!(p.function_id(), Some(scope_id));
    assert!(p.is_concurrency_key());
  }

  #[test]
  fn test_system_partition_tracks_in_progress_by_name() {
    let kg = KeyGenerator::new("t");
    let p = QueuePartition::system("pauses", Uuid::new_v4());
    assert_eq!(p.function_id(), None);
    assert_eq!(p.in_progress_key(&kg), "{t}:concurrency:p:pauses");
    assert_eq!(p.fn_concurrency_key(&kg), p.in_progress_key(&kg));
  }

  #[test]
  fn test_partition_json_omits_empty_lease() {
    let p = QueuePartition::system("pauses", Uuid::nil());
    let json = serde_json::to_value(&p).unwrap();
    assert!(json.get("lease_id").is_none());
    assert_eq!(json["kind"]["type"], "system");
    let back: QueuePartition = serde_json::from_value(json).unwrap();
    assert_eq!(back, p);
  }

  #[test]
  fn test_shard_valid_leases() {
    let ids = crate::lease::IdGenerator::seeded(3);
    let mut shard = QueueShard::new("acme", 2);
    shard.leases = vec![ids.lease(100), ids.lease(300)];
    assert_eq!(shard.valid_leases(200), 1);
    let decoded: QueueShard = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
    assert!(decoded.leases.is_empty());
  }
}
