//! 队列项模块
//! Queue item module
//!
//! 队列项是调度的最小工作单元，按 `score()` 在分区内排序。
//! A queue item is the unit of scheduled work, ordered within a partition by `score()`.

use crate::base::constants::{DEFAULT_MAX_ATTEMPTS, FUTURE_AT_LIMIT, PRIORITY_FACTOR_MAX};
use crate::clock::millis;
use crate::error::{Error, Result};
use crate::lease::{hash_id, LeaseId};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// 工作类型
/// Kind of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
  Start,
  Edge,
  Sleep,
  Pause,
  Debounce,
  EdgeError,
  ScheduleBatch,
}

impl Kind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Kind::Start => "start",
      Kind::Edge => "edge",
      Kind::Sleep => "sleep",
      Kind::Pause => "pause",
      Kind::Debounce => "debounce",
      Kind::EdgeError => "edge_error",
      Kind::ScheduleBatch => "schedule_batch",
    }
  }

  /// 是否为可按运行开始时间提前的立即执行类工作
  /// Whether this is immediate work that may be rescored by run start time
  pub fn is_fifo_eligible(&self) -> bool {
    matches!(self, Kind::Start | Kind::Edge | Kind::EdgeError)
  }
}

/// 并发键的作用域
/// Scope of a concurrency key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
  #[serde(rename = "fn")]
  Function,
  #[serde(rename = "env")]
  Environment,
  Account,
}

impl ConcurrencyScope {
  fn prefix(&self) -> &'static str {
    match self {
      ConcurrencyScope::Function => "f",
      ConcurrencyScope::Environment => "e",
      ConcurrencyScope::Account => "a",
    }
  }

  fn from_prefix(prefix: &str) -> Option<Self> {
    match prefix {
      "f" => Some(ConcurrencyScope::Function),
      "e" => Some(ConcurrencyScope::Environment),
      "a" => Some(ConcurrencyScope::Account),
      _ => None,
    }
  }
}

/// 自定义并发键：`<scope>:<scope id>:<hash>` 及其上限
/// A custom concurrency key, `<scope>:<scope id>:<hash>`, and its limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyKey {
  #[serde(rename = "k")]
  pub key: String,
  #[serde(rename = "l")]
  pub limit: i64,
}

impl ConcurrencyKey {
  /// 由作用域和未哈希的键值创建
  /// Build from a scope and an unhashed key value
  pub fn new(scope: ConcurrencyScope, scope_id: Uuid, unhashed: &str, limit: i64) -> Self {
    Self {
      key: format!("{}:{}:{}", scope.prefix(), scope_id, hash_id(unhashed)),
      limit,
    }
  }

  /// 解析为（作用域、作用域 ID、哈希）
  /// Parse into (scope, scope id, hash)
  pub fn parse(&self) -> Result<(ConcurrencyScope, Uuid, &str)> {
    let mut parts = self.key.splitn(3, ':');
    let (Some(scope), Some(id), Some(hash)) = (parts.next(), parts.next(), parts.next()) else {
      return Err(Error::other(format!("invalid concurrency key: {}", self.key)));
    };
    let scope = ConcurrencyScope::from_prefix(scope)
      .ok_or_else(|| Error::other(format!("invalid concurrency key scope: {}", self.key)))?;
    let id = Uuid::parse_str(id)
      .map_err(|e| Error::other(format!("invalid concurrency key id '{}': {e}", self.key)))?;
    Ok((scope, id, hash))
  }
}

/// 限流配置（GCRA）
/// Throttle configuration (GCRA)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
  pub key: String,
  /// 每个周期允许的次数
  /// Admissions allowed per period
  pub limit: u32,
  pub burst: u32,
  pub period_secs: u32,
}

/// 运行标识
/// Identifies the run an item belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
  pub workflow_id: Uuid,
  #[serde(default)]
  pub workflow_version: i32,
  pub run_id: Ulid,
  pub account_id: Uuid,
  pub workspace_id: Uuid,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub event_id: Option<Ulid>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key: Option<String>,
}

/// 队列项承载的执行数据
/// Execution payload carried by a queue item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub job_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub group_id: Option<String>,
  pub workspace_id: Uuid,
  pub kind: Kind,
  pub identifier: Identifier,
  #[serde(default)]
  pub attempt: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_attempts: Option<u32>,
  #[serde(default)]
  pub payload: serde_json::Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub throttle: Option<Throttle>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub custom_concurrency_keys: Vec<ConcurrencyKey>,
  /// 优先级因子（秒），正值使工作提前
  /// Priority factor in seconds; positive values run work earlier
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority_factor: Option<i64>,
}

impl Item {
  pub fn new(kind: Kind, identifier: Identifier) -> Self {
    Self {
      job_id: None,
      group_id: None,
      workspace_id: identifier.workspace_id,
      kind,
      identifier,
      attempt: 0,
      max_attempts: None,
      payload: serde_json::Value::Null,
      throttle: None,
      custom_concurrency_keys: Vec::new(),
      priority_factor: None,
    }
  }

  /// 优先级因子（毫秒），限制在 ±600 秒
  /// Priority factor in milliseconds, clamped to ±600s
  pub fn priority_factor_ms(&self) -> i64 {
    let max = PRIORITY_FACTOR_MAX.as_secs() as i64;
    self.priority_factor.unwrap_or(0).clamp(-max, max) * 1000
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
  }
}

/// 队列项
/// Queue item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  /// 调用方 ID 的哈希，用于幂等
  /// Hash of the caller-supplied ID, used for idempotency
  pub id: String,
  /// 最早被窥视的时间（毫秒），用于计算逗留延迟
  /// Earliest peek time in milliseconds, for sojourn latency
  #[serde(rename = "pt", default, skip_serializing_if = "is_zero")]
  pub earliest_peek_time: i64,
  /// 排序分数所依据的时间
  /// Time the queue position is derived from
  #[serde(rename = "at")]
  pub at_ms: i64,
  /// 实际期望执行时间，仅用于延迟统计
  /// Intended execution time, used only for latency accounting
  #[serde(rename = "wt")]
  pub wall_time_ms: i64,
  pub function_id: Uuid,
  pub workspace_id: Uuid,
  /// 租约保存在独立的哈希中，由存储层回填
  /// Leases are stored in a separate hash and filled in by the store
  #[serde(skip)]
  pub lease_id: Option<LeaseId>,
  pub data: Item,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub queue_name: Option<String>,
  /// 覆盖默认幂等时长（秒）
  /// Overrides the default idempotency period, in seconds
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub idempotency_period_secs: Option<u64>,
}

fn is_zero(v: &i64) -> bool {
  *v == 0
}

impl QueueItem {
  pub fn new(function_id: Uuid, data: Item) -> Self {
    Self {
      id: String::new(),
      earliest_peek_time: 0,
      at_ms: 0,
      wall_time_ms: 0,
      function_id,
      workspace_id: data.workspace_id,
      lease_id: None,
      data,
      queue_name: None,
      idempotency_period_secs: None,
    }
  }

  /// 设置调用方 ID（入队时会被哈希）
  /// Set the caller ID (hashed on enqueue)
  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = id.into();
    self
  }

  pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
    self.queue_name = Some(name.into());
    self
  }

  /// 队列名：显式名称或函数 ID
  /// Queue name: the explicit name or the function ID
  pub fn queue(&self) -> String {
    match &self.queue_name {
      Some(name) => name.clone(),
      None => self.function_id.to_string(),
    }
  }

  pub fn is_leased(&self, now_ms: i64) -> bool {
    self.lease_id.is_some_and(|l| l.is_valid_at(now_ms))
  }

  /// 队列项在分区内的排序分数
  /// Score of the item within its partitions
  ///
  /// 首次尝试的立即工作（start/edge/edge error）在当前时间附近时，分数取运行开始时间
  /// 减去优先级因子，使较早的运行先完成。
  /// First-attempt immediate work (start/edge/edge error) scheduled near now is scored by
  /// the run's start time minus the priority factor, so older runs finish first.
  pub fn score(&self, now_ms: i64) -> i64 {
    if !self.data.kind.is_fifo_eligible() || self.data.attempt > 0 {
      return self.at_ms;
    }
    if self.at_ms > now_ms + millis(FUTURE_AT_LIMIT) {
      return self.at_ms;
    }
    let started_at = self.data.identifier.run_id.timestamp_ms() as i64;
    if started_at == 0 {
      return self.at_ms;
    }
    started_at - self.data.priority_factor_ms()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn identifier(run_ms: u64) -> Identifier {
    Identifier {
      workflow_id: Uuid::new_v4(),
      workflow_version: 1,
      run_id: Ulid::from_parts(run_ms, 1),
      account_id: Uuid::new_v4(),
      workspace_id: Uuid::new_v4(),
      event_id: None,
      key: None,
    }
  }

  fn item(kind: Kind, run_ms: u64, at_ms: i64) -> QueueItem {
    let ident = identifier(run_ms);
    let mut qi = QueueItem::new(ident.workflow_id, Item::new(kind, ident));
    qi.at_ms = at_ms;
    qi
  }

  #[test]
  fn test_score_pulls_edges_back_to_run_start() {
    let now = 1_700_000_100_000;
    let qi = item(Kind::Edge, 1_700_000_000_000, now);
    assert_eq!(qi.score(now), 1_700_000_000_000);
  }

  #[test]
  fn test_score_applies_priority_factor() {
    let now = 1_700_000_100_000;
    let mut qi = item(Kind::Start, 1_700_000_000_000, now);
    qi.data.priority_factor = Some(30);
    assert_eq!(qi.score(now), 1_700_000_000_000 - 30_000);
    qi.data.priority_factor = Some(10_000);
    assert_eq!(qi.score(now), 1_700_000_000_000 - 600_000);
  }

  #[test]
  fn test_sleep_score_is_at() {
    let now = 1_700_000_100_000;
    let qi = item(Kind::Sleep, 1_700_000_000_000, now);
    assert_eq!(qi.score(now), now);
  }

  #[test]
  fn test_retries_and_future_items_keep_at() {
    let now = 1_700_000_100_000;
    let mut retry = item(Kind::Edge, 1_700_000_000_000, now);
    retry.data.attempt = 1;
    assert_eq!(retry.score(now), now);

    let future = item(Kind::Edge, 1_700_000_000_000, now + 2_001);
    assert_eq!(future.score(now), now + 2_001);

    let near = item(Kind::Edge, 1_700_000_000_000, now + 2_000);
    assert_eq!(near.score(now), 1_700_000_000_000);
  }

  #[test]
  fn test_concurrency_key_parse() {
    let scope_id = Uuid::new_v4();
    let key = ConcurrencyKey::new(ConcurrencyScope::Account, scope_id, "user-42", 3);
    let (scope, id, hash) = key.parse().unwrap();
    assert_eq!(scope, ConcurrencyScope::Account);
    assert_eq!(id, scope_id);
    assert_eq!(hash, hash_id("user-42"));

    let bad = ConcurrencyKey {
      key: "x:nope".to_string(),
      limit: 1,
    };
    assert!(bad.parse().is_err());
  }

  #[test]
  fn test_lease_is_not_serialized() {
    let mut qi = item(Kind::Edge, 1_700_000_000_000, 1);
    qi.lease_id = Some(crate::lease::IdGenerator::seeded(1).lease(5));
    let json = serde_json::to_string(&qi).unwrap();
    assert!(!json.contains("lease"));
    let decoded: QueueItem = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded.lease_id, None);
    assert_eq!(decoded.data.kind, Kind::Edge);
  }

  #[test]
  fn test_queue_name_defaults_to_function() {
    let qi = item(Kind::Edge, 1, 1);
    assert_eq!(qi.queue(), qi.function_id.to_string());
    assert_eq!(qi.clone().with_queue_name("system").queue(), "system");
  }
}
