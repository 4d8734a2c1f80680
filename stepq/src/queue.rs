//! 队列模块
//! Queue module
//!
//! `Queue` 是队列的全部公开操作：入队、租用、续租、出队、重新入队，分区的租用、
//! 重新入队与窥视，回收过期租约，配置租约与分片租约，以及只读的统计接口。
//! 所有复合操作都由存储后端原子地执行，`Queue` 只负责计算键名、记录和状态码映射。
//!
//! `Queue` exposes every queue operation: enqueue, lease, extend, dequeue and requeue of
//! items; lease, requeue and peek of partitions; scavenging of expired leases; config and
//! shard leases; and read-only introspection. Compound operations run atomically inside
//! the store backend, `Queue` only computes key names, records and maps status codes.

use crate::base::constants::*;
use crate::base::keys::{KeyGenerator, SCOPE_ACCOUNT, SCOPE_CUSTOM, SCOPE_FUNCTION};
use crate::base::*;
use crate::clock::{millis, Clock, SystemClock};
use crate::config::{matches_list, ConcurrencyLimits, QueueConfig};
use crate::deny::LeaseDenies;
use crate::error::{Error, Result};
use crate::ewma::SimpleEwma;
use crate::item::{Kind, QueueItem};
use crate::lease::{hash_id, IdGenerator, LeaseId};
use crate::partition::{FnMetadata, PartitionKind, QueuePartition, QueueShard};
use crate::sampling::weighted_shuffle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;
use uuid::Uuid;

/// 队列项所属的分区，固定为 3 个槽位
/// The partitions an item belongs to, padded to three slots
pub type ItemPartitions = [Option<QueuePartition>; 3];

/// 运行中队列项的位置信息
/// Position of one queued job of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResponse {
  pub at: DateTime<Utc>,
  /// 在函数分区中的排名，不在分区中时为 -1
  /// Rank within the function partition; -1 when not queued there
  pub position: i64,
  pub kind: Kind,
  pub attempt: u32,
}

/// 一次回收的结果
/// Result of one scavenge pass
#[derive(Debug, Default)]
pub struct ScavengeReport {
  /// 重新入队的队列项数量
  /// Number of items requeued
  pub recovered: usize,
  pub errors: Vec<Error>,
}

impl ScavengeReport {
  /// 合并为单个结果，有错误时返回聚合错误
  /// Collapse into a single result; any error becomes an aggregate error
  pub fn into_result(mut self) -> Result<usize> {
    match self.errors.len() {
      0 => Ok(self.recovered),
      1 => Err(self.errors.remove(0)),
      _ => Err(Error::Multiple(self.errors)),
    }
  }
}

/// 队列
/// Queue
pub struct Queue {
  store: Arc<dyn QueueStore>,
  kg: KeyGenerator,
  config: QueueConfig,
  clock: Arc<dyn Clock>,
  ids: IdGenerator,
}

fn to_ms(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl Queue {
  /// 创建新的队列，配置只在这里验证一次
  /// Create a new queue; the configuration is validated once, here
  pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      store,
      kg: KeyGenerator::new(config.key_prefix.clone()),
      config,
      clock: Arc::new(SystemClock),
      ids: IdGenerator::default(),
    })
  }

  /// 替换时钟
  /// Replace the clock
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// 替换 ID 生成器
  /// Replace the ID generator
  pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
    self.ids = ids;
    self
  }

  pub fn keys(&self) -> &KeyGenerator {
    &self.kg
  }

  pub fn config(&self) -> &QueueConfig {
    &self.config
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  pub fn ids(&self) -> &IdGenerator {
    &self.ids
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  // === 内部辅助 ===
  // === Internal helpers ===

  fn pointers(&self, shard: Option<&QueueShard>) -> PointerKeys {
    PointerKeys {
      partition_hash: self.kg.partition_item(),
      global_index: self.kg.global_partition_index(),
      global_account_index: self.kg.global_account_index(),
      shard_index: shard.map(|s| self.kg.shard_partition_index(&s.name)),
    }
  }

  fn shard_for(&self, queue: &str, workspace_id: Option<Uuid>) -> Option<QueueShard> {
    self
      .config
      .shard_finder
      .as_ref()
      .and_then(|finder| finder(queue, workspace_id))
  }

  fn partition_ref(&self, p: &QueuePartition) -> Result<PartitionRef> {
    Ok(PartitionRef {
      id: p.id.clone(),
      zset: p.zset_key(&self.kg),
      record: serde_json::to_string(p)?,
      account_id: p.account_id.map(|a| a.to_string()).unwrap_or_default(),
      account_index: p
        .account_id
        .map(|a| self.kg.account_partition_index(&a))
        .unwrap_or_default(),
    })
  }

  fn partition_refs(&self, parts: &ItemPartitions) -> Result<Vec<PartitionRef>> {
    parts
      .iter()
      .flatten()
      .map(|p| self.partition_ref(p))
      .collect()
  }

  /// 系统队列项按队列名计入进行中集合
  /// System queue items are tracked under their queue name
  fn in_progress_keys(&self, item: &QueueItem, parts: &ItemPartitions) -> InProgressKeys {
    let member = match &item.queue_name {
      Some(name) => name.clone(),
      None => item.function_id.to_string(),
    };
    InProgressKeys {
      index: self.kg.concurrency_index(),
      function: self.kg.concurrency(SCOPE_FUNCTION, &member),
      member,
      account: self.kg.concurrency(
        SCOPE_ACCOUNT,
        &item.data.identifier.account_id.to_string(),
      ),
      custom: parts
        .iter()
        .flatten()
        .filter(|p| p.is_concurrency_key())
        .map(|p| self.kg.concurrency(SCOPE_CUSTOM, &p.id))
        .collect(),
    }
  }

  fn partition_limits(&self, p: &QueuePartition) -> ConcurrencyLimits {
    (self.config.concurrency_limit_getter)(p)
  }

  /// 队列项的（函数上限，账户上限，各自定义键上限）
  /// (function limit, account limit, custom key limits) of an item
  fn item_limits(&self, item: &QueueItem, parts: &ItemPartitions) -> (i64, i64, Vec<i64>) {
    if item.queue_name.is_some() {
      return (NO_CONCURRENCY_LIMIT, NO_CONCURRENCY_LIMIT, Vec::new());
    }
    let mut fn_part = QueuePartition::function(item.function_id, item.data.identifier.account_id);
    fn_part.env_id = Some(item.workspace_id);
    let base = self.partition_limits(&fn_part);
    let custom = parts
      .iter()
      .flatten()
      .filter(|p| p.is_concurrency_key())
      .map(|p| self.partition_limits(p).custom)
      .collect();
    (base.function, base.account, custom)
  }

  fn idempotency_ttl(&self, item: &QueueItem) -> Duration {
    if let Some(secs) = item.idempotency_period_secs {
      return Duration::from_secs(secs);
    }
    match &self.config.idempotency_ttl_fn {
      Some(f) => f(item),
      None => self.config.idempotency_ttl,
    }
  }

  fn is_scannable(&self, queue: &str) -> bool {
    if !self.config.allow_queues.is_empty() && !matches_list(queue, &self.config.allow_queues) {
      return false;
    }
    !matches_list(queue, &self.config.deny_queues)
  }

  // === 队列项 ===
  // === Items ===

  /// 队列项所属的分区
  /// Partitions an item belongs to
  ///
  /// 有队列名的队列项只属于一个系统分区；声明了自定义并发键的队列项属于每个键
  /// 对应的分区（最多两个）；其余队列项属于函数分区。
  /// Items with a queue name live in a single system partition; items declaring custom
  /// concurrency keys live in one partition per key (at most two); everything else lives
  /// in the function partition.
  pub fn item_partitions(&self, item: &QueueItem) -> Result<ItemPartitions> {
    let account_id = item.data.identifier.account_id;
    if let Some(name) = &item.queue_name {
      let mut p = QueuePartition::system(name.clone(), account_id);
      p.env_id = Some(item.workspace_id);
      return Ok([Some(p), None, None]);
    }

    let keys = (self.config.custom_key_generator)(item);
    if keys.is_empty() {
      let mut p = QueuePartition::function(item.function_id, account_id);
      p.env_id = Some(item.workspace_id);
      return Ok([Some(p), None, None]);
    }

    let mut parts: ItemPartitions = [None, None, None];
    for (slot, key) in parts.iter_mut().zip(keys.iter().take(2)) {
      *slot = Some(QueuePartition::concurrency_key(
        key,
        account_id,
        item.workspace_id,
      )?);
    }
    Ok(parts)
  }

  /// 入队
  /// Enqueue an item
  ///
  /// 未提供 ID 时生成新的 ULID，否则对 ID 做哈希。`at` 早于当前时间时，
  /// 实际执行时间与分区可见时间都规整为当前时间。
  /// A missing ID is replaced by a fresh ULID, otherwise the ID is hashed. When `at` is in
  /// the past, both the wall time and the partition's visibility time become now.
  pub async fn enqueue(&self, mut item: QueueItem, at: DateTime<Utc>) -> Result<QueueItem> {
    let now = self.clock.now_ms();
    item.id = if item.id.is_empty() {
      self.ids.ulid_at(now).to_string()
    } else {
      hash_id(&item.id)
    };
    if item.queue_name.is_none() {
      if let Some(name) = self.config.kind_to_queue.get(&item.data.kind) {
        item.queue_name = Some(name.clone());
      }
    }

    let at_ms = to_ms(at);
    item.at_ms = at_ms;
    item.wall_time_ms = at_ms.max(now);
    item.lease_id = None;

    let parts = self.item_partitions(&item)?;
    let shard = self.shard_for(&item.queue(), Some(item.workspace_id));
    let fn_metadata = match item.queue_name {
      Some(_) => None,
      None => Some(serde_json::to_string(&FnMetadata {
        fn_id: item.function_id,
        paused: false,
      })?),
    };

    let req = EnqueueRequest {
      item_hash: self.kg.queue_item(),
      idempotency_key: self.kg.idempotency(&item.id),
      shards_hash: self.kg.shards(),
      fn_metadata_key: self.kg.fn_metadata(&item.function_id),
      pointers: self.pointers(shard.as_ref()),
      item_id: item.id.clone(),
      item: serde_json::to_string(&item)?,
      score: item.score(now),
      at_ms,
      partition_time_ms: at_ms.max(now),
      now_ms: now,
      partitions: self.partition_refs(&parts)?,
      shard: shard
        .as_ref()
        .map(|s| -> Result<ShardRef> {
          Ok(ShardRef {
            name: s.name.clone(),
            record: serde_json::to_string(s)?,
          })
        })
        .transpose()?,
      fn_metadata,
      indexes: (self.config.item_indexer)(&item, &self.kg),
    };

    match self.store.enqueue(&req).await? {
      0 => {
        tracing::debug!("Enqueued item {} into queue {}", item.id, item.queue());
        Ok(item)
      }
      1 => Err(Error::ItemAlreadyExists),
      code => Err(Error::unknown("enqueue", code)),
    }
  }

  /// 窥视分区中到 `until` 为止可用的队列项
  /// Peek the items of a partition that are available until `until`
  ///
  /// `limit` 为 -1 时最多返回下一个可用项，小于等于 0 时使用最大窥视数量。
  /// A `limit` of -1 returns at most the next available item; other values ≤ 0 use the
  /// maximum peek size.
  pub async fn peek(
    &self,
    queue_name: &str,
    until: DateTime<Utc>,
    limit: i64,
  ) -> Result<Vec<QueueItem>> {
    let max = self.config.peek_max;
    if limit > max {
      return Err(Error::PeekMaxExceedsLimits { max });
    }
    let limit = match limit {
      -1 => 1,
      l if l <= 0 => max,
      l => l,
    };

    let now = self.clock.now_ms();
    let zset = self.kg.partition_queue_set(queue_name);
    let ids: Vec<String> = self
      .store
      .zrange_by_score(&zset, SCORE_MIN, to_ms(until), limit)
      .await?
      .into_iter()
      .map(|(id, _)| id)
      .collect();
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    let records = self.store.hmget(&self.kg.queue_item(), &ids).await?;
    let leases = self.store.hmget(&self.kg.queue_lease(), &ids).await?;
    let mut items = Vec::with_capacity(ids.len());
    for ((id, record), lease) in ids.iter().zip(records).zip(leases) {
      let Some(record) = record else {
        tracing::warn!("Queue item {} is indexed in {} but missing", id, queue_name);
        continue;
      };
      let mut item: QueueItem = serde_json::from_str(&record)?;
      item.lease_id = lease.and_then(|l| l.parse().ok());
      if item.is_leased(now) {
        continue;
      }
      if item.earliest_peek_time == 0 {
        item.earliest_peek_time = now;
      }
      items.push(item);
    }
    Ok(items)
  }

  /// 租用队列项
  /// Lease an item
  ///
  /// 传入拒绝列表时，已知被拒绝的并发键或限流键会在访问存储之前直接失败。
  /// When a deny list is given, keys already known to be denied fail before the store is
  /// contacted.
  pub async fn lease(
    &self,
    item: &QueueItem,
    duration: Duration,
    denies: Option<&LeaseDenies>,
  ) -> Result<LeaseId> {
    let now = self.clock.now_ms();
    let parts = self.item_partitions(item)?;
    let in_progress = self.in_progress_keys(item, &parts);
    let (function_limit, account_limit, custom_limits) = self.item_limits(item, &parts);
    let throttle = item.data.throttle.as_ref().map(|t| ThrottleRef {
      key: self.kg.throttle(&t.key),
      limit: t.limit as i64,
      burst: t.burst as i64,
      period_ms: t.period_secs as i64 * 1000,
    });

    if let Some(denies) = denies {
      if function_limit > 0 && denies.deny_concurrency(&in_progress.function) {
        return Err(Error::PartitionConcurrencyLimit {
          key: in_progress.function,
        });
      }
      if account_limit > 0 && denies.deny_concurrency(&in_progress.account) {
        return Err(Error::AccountConcurrencyLimit {
          key: in_progress.account,
        });
      }
      for (i, (key, limit)) in in_progress.custom.iter().zip(&custom_limits).enumerate() {
        if *limit > 0 && denies.deny_concurrency(key) {
          let key = key.clone();
          return Err(match i {
            0 => Error::ConcurrencyLimitCustomKey0 { key },
            _ => Error::ConcurrencyLimitCustomKey1 { key },
          });
        }
      }
      if let Some(t) = throttle.as_ref().filter(|t| denies.deny_throttle(&t.key)) {
        return Err(Error::ItemThrottled { key: t.key.clone() });
      }
    }

    let lease_id = self.ids.lease(now + millis(duration));
    let req = LeaseRequest {
      item_hash: self.kg.queue_item(),
      lease_hash: self.kg.queue_lease(),
      item_id: item.id.clone(),
      lease_id: lease_id.to_string(),
      now_ms: now,
      expires_at_ms: lease_id.expires_at_ms(),
      in_progress,
      function_limit,
      account_limit,
      custom_limits,
      throttle,
      partition_sets: parts.iter().flatten().map(|p| p.zset_key(&self.kg)).collect(),
    };

    let custom_key = |i: usize| req.in_progress.custom.get(i).cloned().unwrap_or_default();
    match self.store.lease(&req).await? {
      0 => Ok(lease_id),
      1 => Err(Error::ItemNotFound),
      2 => Err(Error::ItemAlreadyLeased),
      3 => Err(Error::PartitionConcurrencyLimit {
        key: req.in_progress.function.clone(),
      }),
      4 => Err(Error::AccountConcurrencyLimit {
        key: req.in_progress.account.clone(),
      }),
      5 => Err(Error::ConcurrencyLimitCustomKey0 { key: custom_key(0) }),
      6 => Err(Error::ConcurrencyLimitCustomKey1 { key: custom_key(1) }),
      7 => Err(Error::ItemThrottled {
        key: req.throttle.map(|t| t.key).unwrap_or_default(),
      }),
      code => Err(Error::unknown("lease", code)),
    }
  }

  /// 续租，只有当前租约与 `existing` 完全一致时才会成功
  /// Extend a lease; succeeds only when the stored lease is exactly `existing`
  pub async fn extend_lease(
    &self,
    item: &QueueItem,
    existing: LeaseId,
    duration: Duration,
  ) -> Result<LeaseId> {
    let now = self.clock.now_ms();
    let parts = self.item_partitions(item)?;
    let lease_id = self.ids.lease(now + millis(duration));
    let req = ExtendLeaseRequest {
      item_hash: self.kg.queue_item(),
      lease_hash: self.kg.queue_lease(),
      item_id: item.id.clone(),
      existing: existing.to_string(),
      lease_id: lease_id.to_string(),
      expires_at_ms: lease_id.expires_at_ms(),
      in_progress: self.in_progress_keys(item, &parts),
    };
    match self.store.extend_lease(&req).await? {
      0 => Ok(lease_id),
      1 => Err(Error::ItemNotFound),
      2 => Err(Error::ItemNotLeased),
      3 => Err(Error::LeaseMismatch),
      code => Err(Error::unknown("extend_lease", code)),
    }
  }

  /// 出队，并写入幂等标记
  /// Dequeue an item and write its idempotency marker
  pub async fn dequeue(&self, item: &QueueItem) -> Result<()> {
    let parts = self.item_partitions(item)?;
    let req = DequeueRequest {
      item_hash: self.kg.queue_item(),
      lease_hash: self.kg.queue_lease(),
      idempotency_key: self.kg.idempotency(&item.id),
      item_id: item.id.clone(),
      idempotency_ttl_secs: self.idempotency_ttl(item).as_secs() as i64,
      in_progress: self.in_progress_keys(item, &parts),
      partition_sets: parts.iter().flatten().map(|p| p.zset_key(&self.kg)).collect(),
      indexes: (self.config.item_indexer)(item, &self.kg),
    };
    match self.store.dequeue(&req).await? {
      0 => Ok(()),
      1 => Err(Error::ItemNotFound),
      code => Err(Error::unknown("dequeue", code)),
    }
  }

  /// 重新入队到 `at`，清除租约
  /// Requeue an item at `at`, clearing its lease
  pub async fn requeue(&self, item: &QueueItem, at: DateTime<Utc>) -> Result<()> {
    let now = self.clock.now_ms();
    let at_ms = to_ms(at);
    let mut item = item.clone();
    item.at_ms = at_ms;
    item.wall_time_ms = at_ms;
    item.earliest_peek_time = 0;
    item.lease_id = None;

    let parts = self.item_partitions(&item)?;
    let shard = self.shard_for(&item.queue(), Some(item.workspace_id));
    let req = RequeueRequest {
      item_hash: self.kg.queue_item(),
      lease_hash: self.kg.queue_lease(),
      pointers: self.pointers(shard.as_ref()),
      item_id: item.id.clone(),
      item: serde_json::to_string(&item)?,
      at_ms,
      now_ms: now,
      in_progress: self.in_progress_keys(&item, &parts),
      partitions: self.partition_refs(&parts)?,
      indexes: (self.config.item_indexer)(&item, &self.kg),
    };
    match self.store.requeue(&req).await? {
      0 => Ok(()),
      1 => Err(Error::ItemNotFound),
      code => Err(Error::unknown("requeue", code)),
    }
  }

  /// 按作业 ID 重新调度分区中未被租用的队列项
  /// Reschedule an unleased item of a partition by its job ID
  pub async fn requeue_by_job_id(
    &self,
    queue_name: &str,
    job_id: &str,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let now = self.clock.now_ms();
    let item_id = hash_id(job_id);
    let Some(record) = self.store.hget(&self.kg.queue_item(), &item_id).await? else {
      return Err(Error::ItemNotFound);
    };
    let mut item: QueueItem = serde_json::from_str(&record)?;
    let at_ms = to_ms(at);
    item.at_ms = at_ms;
    item.wall_time_ms = at_ms;

    let account_id = item.data.identifier.account_id;
    let shard = self.shard_for(queue_name, Some(item.workspace_id));
    let req = RequeueByIdRequest {
      item_hash: self.kg.queue_item(),
      lease_hash: self.kg.queue_lease(),
      pointers: self.pointers(shard.as_ref()),
      item_id,
      item: serde_json::to_string(&item)?,
      at_ms,
      now_ms: now,
      partition: PartitionRef {
        id: queue_name.to_string(),
        zset: self.kg.partition_queue_set(queue_name),
        record: String::new(),
        account_id: account_id.to_string(),
        account_index: self.kg.account_partition_index(&account_id),
      },
    };
    match self.store.requeue_by_id(&req).await? {
      0 => Ok(()),
      -1 => Err(Error::ItemNotFound),
      -2 => Err(Error::ItemAlreadyLeased),
      code => Err(Error::unknown("requeue_by_id", code)),
    }
  }

  // === 分区 ===
  // === Partitions ===

  /// 读取分区记录
  /// Load a partition record
  pub async fn partition(&self, id: &str) -> Result<Option<QueuePartition>> {
    match self.store.hget(&self.kg.partition_item(), id).await? {
      Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      None => Ok(None),
    }
  }

  /// 租用分区，返回租约与剩余容量（-1 表示不限）
  /// Lease a partition, returning the lease and the remaining capacity (-1 if unlimited)
  pub async fn partition_lease(
    &self,
    p: &QueuePartition,
    duration: Duration,
  ) -> Result<(LeaseId, i64)> {
    let now = self.clock.now_ms();
    let limits = self.partition_limits(p);
    let lease_id = self.ids.lease(now + millis(duration));
    let shard = self.shard_for(p.queue(), p.env_id);
    let req = PartitionLeaseRequest {
      pointers: self.pointers(shard.as_ref()),
      partition_id: p.id.clone(),
      account_id: p.account_id.map(|a| a.to_string()).unwrap_or_default(),
      account_index: p
        .account_id
        .map(|a| self.kg.account_partition_index(&a))
        .unwrap_or_default(),
      fn_metadata_key: p.function_id().map(|f| self.kg.fn_metadata(&f)),
      function_in_progress: p.fn_concurrency_key(&self.kg),
      account_in_progress: p.acct_concurrency_key(&self.kg),
      custom_in_progress: match p.kind {
        PartitionKind::ConcurrencyKey { .. } => self.kg.concurrency(SCOPE_CUSTOM, &p.id),
        _ => String::new(),
      },
      function_limit: limits.function,
      account_limit: limits.account,
      custom_limit: limits.custom,
      lease_id: lease_id.to_string(),
      now_ms: now,
      expires_at_ms: lease_id.expires_at_ms(),
      force_at_ms: now + millis(PARTITION_CONCURRENCY_LIMIT_REQUEUE_EXTENSION),
    };

    match self.store.partition_lease(&req).await? {
      (0, capacity) => Ok((lease_id, capacity)),
      (-1, _) => Err(Error::PartitionConcurrencyLimit {
        key: p.in_progress_key(&self.kg),
      }),
      (-2, _) => Err(Error::PartitionNotFound),
      (-3, _) => Err(Error::PartitionAlreadyLeased),
      (-4, _) => Err(Error::PartitionPaused),
      (code, _) => Err(Error::unknown("partition_lease", code)),
    }
  }

  /// 重新入队分区
  /// Requeue a partition
  ///
  /// `forced` 为真时指针固定在 `at`，否则取 `at` 与最早队列项中较早者。
  /// 分区为空时被回收并返回 `PartitionGarbageCollected`。
  /// When `forced` the pointer is pinned at `at`, otherwise it takes the earlier of `at`
  /// and the earliest item. An empty partition is collected and `PartitionGarbageCollected`
  /// is returned.
  pub async fn partition_requeue(
    &self,
    p: &QueuePartition,
    at: DateTime<Utc>,
    forced: bool,
  ) -> Result<()> {
    let shard = self.shard_for(p.queue(), p.env_id);
    let req = PartitionRequeueRequest {
      pointers: self.pointers(shard.as_ref()),
      partition_id: p.id.clone(),
      zset: p.zset_key(&self.kg),
      account_id: p.account_id.map(|a| a.to_string()).unwrap_or_default(),
      account_index: p
        .account_id
        .map(|a| self.kg.account_partition_index(&a))
        .unwrap_or_default(),
      in_progress: p.in_progress_key(&self.kg),
      at_ms: to_ms(at),
      forced,
    };
    match self.store.partition_requeue(&req).await? {
      0 => Ok(()),
      1 => Err(Error::PartitionNotFound),
      2 => Err(Error::PartitionGarbageCollected),
      code => Err(Error::unknown("partition_requeue", code)),
    }
  }

  /// 从全局分区索引窥视分区
  /// Peek partitions from the global partition index
  pub async fn partition_peek(
    &self,
    sequential: bool,
    until: DateTime<Utc>,
    limit: i64,
  ) -> Result<Vec<QueuePartition>> {
    let index = self.kg.global_partition_index();
    self.partition_peek_from(&index, sequential, until, limit).await
  }

  /// 从指定索引（全局、账户或分片）窥视分区
  /// Peek partitions from a given index (global, account or shard)
  ///
  /// 顺序模式按时间升序返回，最多 100 个；随机模式以 `10 - priority` 为权重打乱。
  /// 已暂停、被拒绝或不在允许列表中的分区会被过滤掉。
  /// Sequential mode returns ascending by time, at most 100; random mode shuffles with
  /// weight `10 - priority`. Paused, denied or not-allowed partitions are filtered out.
  pub async fn partition_peek_from(
    &self,
    index: &str,
    sequential: bool,
    until: DateTime<Utc>,
    limit: i64,
  ) -> Result<Vec<QueuePartition>> {
    if limit > PARTITION_PEEK_MAX {
      return Err(Error::PartitionPeekMaxExceedsLimits {
        max: PARTITION_PEEK_MAX,
      });
    }
    let limit = if limit <= 0 { PARTITION_PEEK_MAX } else { limit };

    let ids: Vec<String> = self
      .store
      .zrange_by_score(index, SCORE_MIN, to_ms(until), limit)
      .await?
      .into_iter()
      .map(|(id, _)| id)
      .collect();
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    let records = self.store.hmget(&self.kg.partition_item(), &ids).await?;
    let mut partitions = Vec::with_capacity(ids.len());
    for (id, record) in ids.iter().zip(records) {
      let Some(record) = record else {
        tracing::warn!("Partition {} is indexed but has no record", id);
        continue;
      };
      let p: QueuePartition = serde_json::from_str(&record)?;
      if self.is_scannable(p.queue()) {
        partitions.push(p);
      }
    }

    let paused = self.paused_functions(&partitions).await;
    partitions.retain(|p| p.function_id().is_none_or(|f| !paused.contains(&f)));

    if sequential {
      partitions.truncate(PARTITION_SELECTION_MAX.min(limit) as usize);
      return Ok(partitions);
    }

    let weights: Vec<f64> = partitions
      .iter()
      .map(|p| {
        let priority = (self.config.priority_finder)(p).clamp(PRIORITY_MAX, PRIORITY_MIN);
        (10 - priority) as f64
      })
      .collect();
    let order = weighted_shuffle(&weights, &self.ids)?;
    let mut slots: Vec<Option<QueuePartition>> = partitions.into_iter().map(Some).collect();
    Ok(
      order
        .into_iter()
        .filter_map(|idx| slots.get_mut(idx).and_then(Option::take))
        .collect(),
    )
  }

  /// 已暂停的函数，查询失败时视为没有暂停
  /// Paused functions; lookup failures are treated as none paused
  async fn paused_functions(&self, partitions: &[QueuePartition]) -> Vec<Uuid> {
    let fn_ids: Vec<Uuid> = partitions.iter().filter_map(|p| p.function_id()).collect();
    if fn_ids.is_empty() {
      return Vec::new();
    }
    let keys: Vec<String> = fn_ids.iter().map(|f| self.kg.fn_metadata(f)).collect();
    match self.store.mget(&keys).await {
      Ok(values) => values
        .into_iter()
        .flatten()
        .filter_map(|raw| serde_json::from_str::<FnMetadata>(&raw).ok())
        .filter(|m| m.paused)
        .map(|m| m.fn_id)
        .collect(),
      Err(e) => {
        tracing::warn!("Failed to load function metadata: {}", e);
        Vec::new()
      }
    }
  }

  /// 窥视有可用分区的账户
  /// Peek accounts that have available partitions
  pub async fn account_peek(
    &self,
    sequential: bool,
    until: DateTime<Utc>,
    limit: i64,
  ) -> Result<Vec<Uuid>> {
    if limit > ACCOUNT_PEEK_MAX {
      return Err(Error::AccountPeekMaxExceedsLimits {
        max: ACCOUNT_PEEK_MAX,
      });
    }
    let limit = if limit <= 0 { ACCOUNT_PEEK_MAX } else { limit };
    let accounts: Vec<Uuid> = self
      .store
      .zrange_by_score(&self.kg.global_account_index(), SCORE_MIN, to_ms(until), limit)
      .await?
      .into_iter()
      .filter_map(|(id, _)| Uuid::parse_str(&id).ok())
      .collect();
    if sequential {
      return Ok(accounts);
    }
    let order = weighted_shuffle(&vec![1.0; accounts.len()], &self.ids)?;
    Ok(order.into_iter().filter_map(|i| accounts.get(i).copied()).collect())
  }

  /// 设置分区优先级（0 最高，9 最低）
  /// Set a partition's priority (0 highest, 9 lowest)
  pub async fn partition_reprioritize(&self, queue_name: &str, priority: i32) -> Result<()> {
    if priority > PRIORITY_MIN {
      return Err(Error::PriorityTooHigh);
    }
    if priority < PRIORITY_MAX {
      return Err(Error::PriorityTooLow);
    }
    match self
      .store
      .partition_reprioritize(&self.kg.partition_item(), queue_name, priority)
      .await?
    {
      0 => Ok(()),
      1 => Err(Error::PartitionNotFound),
      code => Err(Error::unknown("partition_reprioritize", code)),
    }
  }

  /// 暂停或恢复函数
  /// Pause or resume a function
  pub async fn set_function_paused(&self, fn_id: Uuid, paused: bool) -> Result<()> {
    let meta = serde_json::to_string(&FnMetadata { fn_id, paused })?;
    self.store.set(&self.kg.fn_metadata(&fn_id), &meta).await?;
    tracing::info!("Function {} paused: {}", fn_id, paused);
    Ok(())
  }

  // === 回收 ===
  // === Scavenging ===

  /// 将租约过期的队列项重新入队
  /// Requeue items whose lease has expired
  ///
  /// 单个分区或队列项的错误不会中断扫描，它们被收集到报告中。
  /// Errors of single partitions or items do not stop the sweep; they are collected into
  /// the report.
  pub async fn scavenge(&self) -> Result<ScavengeReport> {
    let now = self.clock.now_ms();
    let now_at = from_ms(now);
    let mut report = ScavengeReport::default();
    let functions = self
      .store
      .zrange_by_score(
        &self.kg.concurrency_index(),
        SCORE_MIN,
        now,
        SCAVENGE_PARTITION_BATCH,
      )
      .await?;

    for (fn_id, _) in functions {
      let key = self.kg.concurrency(SCOPE_FUNCTION, &fn_id);
      let expired = match self
        .store
        .zrange_by_score(&key, SCORE_MIN, now, SCAVENGE_ITEM_BATCH)
        .await
      {
        Ok(expired) => expired,
        Err(e) => {
          report.errors.push(e);
          continue;
        }
      };
      if expired.is_empty() {
        continue;
      }

      let ids: Vec<String> = expired.into_iter().map(|(id, _)| id).collect();
      let records = match self.store.hmget(&self.kg.queue_item(), &ids).await {
        Ok(records) => records,
        Err(e) => {
          report.errors.push(e);
          continue;
        }
      };
      for (id, record) in ids.iter().zip(records) {
        let Some(record) = record else {
          report.errors.push(Error::other(format!(
            "in-progress item {id} of function {fn_id} has no record"
          )));
          continue;
        };
        let result = match serde_json::from_str::<QueueItem>(&record) {
          Ok(item) => self.requeue(&item, now_at).await,
          Err(e) => Err(e.into()),
        };
        match result {
          Ok(()) => report.recovered += 1,
          Err(e) => report.errors.push(e),
        }
      }
    }

    if report.recovered > 0 {
      tracing::info!("Scavenger requeued {} expired items", report.recovered);
    }
    Ok(report)
  }

  // === 租约协调 ===
  // === Lease coordination ===

  /// 获取或续期配置租约
  /// Claim or renew a config lease
  pub async fn config_lease(
    &self,
    key: &str,
    duration: Duration,
    existing: Option<LeaseId>,
  ) -> Result<LeaseId> {
    if duration > CONFIG_LEASE_MAX {
      return Err(Error::ConfigLeaseExceedsLimits {
        max_secs: CONFIG_LEASE_MAX.as_secs(),
      });
    }
    let now = self.clock.now_ms();
    let lease_id = self.ids.lease(now + millis(duration));
    let req = ConfigLeaseRequest {
      key: key.to_string(),
      now_ms: now,
      lease_id: lease_id.to_string(),
      existing: existing.map(|l| l.to_string()),
      ttl_ms: millis(duration).max(1),
    };
    match self.store.config_lease(&req).await? {
      0 => Ok(lease_id),
      1 => Err(Error::ConfigAlreadyLeased),
      code => Err(Error::unknown("config_lease", code)),
    }
  }

  /// 所有已知的分片
  /// All known shards
  pub async fn get_shards(&self) -> Result<Vec<QueueShard>> {
    let mut shards = self
      .store
      .hvals(&self.kg.shards())
      .await?
      .iter()
      .map(|raw| serde_json::from_str::<QueueShard>(raw))
      .collect::<std::result::Result<Vec<_>, _>>()?;
    shards.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(shards)
  }

  /// 租用分片的第 `index` 个槽位
  /// Lease slot `index` of a shard
  pub async fn lease_shard(
    &self,
    shard: &QueueShard,
    duration: Duration,
    index: i64,
  ) -> Result<LeaseId> {
    let now = self.clock.now_ms();
    let lease_id = self.ids.lease(now + millis(duration));
    let req = ShardLeaseRequest {
      shards_hash: self.kg.shards(),
      name: shard.name.clone(),
      now_ms: now,
      lease_id: lease_id.to_string(),
      index,
    };
    match self.store.lease_shard(&req).await? {
      0 => Ok(lease_id),
      -1 => Err(Error::ShardNotFound),
      -2 => Err(Error::ShardIndexLeased),
      -3 => Err(Error::ShardIndexInvalid),
      code => Err(Error::unknown("lease_shard", code)),
    }
  }

  /// 续租分片槽位
  /// Renew a shard slot lease
  pub async fn renew_shard_lease(
    &self,
    shard: &QueueShard,
    duration: Duration,
    existing: LeaseId,
  ) -> Result<LeaseId> {
    let now = self.clock.now_ms();
    let lease_id = self.ids.lease(now + millis(duration));
    let req = RenewShardLeaseRequest {
      shards_hash: self.kg.shards(),
      name: shard.name.clone(),
      now_ms: now,
      existing: existing.to_string(),
      lease_id: lease_id.to_string(),
    };
    match self.store.renew_shard_lease(&req).await? {
      0 => Ok(lease_id),
      -1 => Err(Error::ShardNotFound),
      -2 => Err(Error::ShardLeaseNotFound),
      code => Err(Error::unknown("renew_shard_lease", code)),
    }
  }

  // === 窥视大小 ===
  // === Peek sizing ===

  /// 函数最近可用数量的 EWMA
  /// EWMA of a function's recent available counts
  pub async fn peek_ewma(&self, fn_id: Uuid) -> Result<i64> {
    let history = self.store.lrange(&self.kg.fn_peek_ewma(&fn_id)).await?;
    let value = SimpleEwma::over(history.iter().filter_map(|v| v.parse::<f64>().ok()));
    Ok(value.round() as i64)
  }

  /// 记录一次可用数量
  /// Record one available count
  pub async fn set_peek_ewma(&self, fn_id: Option<Uuid>, value: i64) -> Result<()> {
    let Some(fn_id) = fn_id else {
      return Ok(());
    };
    self
      .store
      .push_capped(
        &self.kg.fn_peek_ewma(&fn_id),
        &value.to_string(),
        self.config.peek_ewma_len,
      )
      .await
  }

  /// 分区本次应窥视的数量：`peek_min <= ewma * multiplier <= peek_max`
  /// Number of items to peek from a partition: `peek_min <= ewma * multiplier <= peek_max`
  pub async fn peek_size(&self, p: &QueuePartition) -> i64 {
    let min = self.config.peek_min;
    let Some(fn_id) = p.function_id() else {
      return min;
    };
    match self.peek_ewma(fn_id).await {
      Ok(ewma) => (ewma * self.config.peek_multiplier).clamp(min, self.config.peek_max),
      Err(e) => {
        tracing::warn!("Failed to read peek EWMA of {}: {}", fn_id, e);
        min
      }
    }
  }

  // === 统计 ===
  // === Introspection ===

  /// 未过期的进行中数量（租约到期时间晚于当前时间）
  /// Count of unexpired in-progress entries (lease expiring after now)
  pub async fn in_progress(&self, scope: &str, key: &str) -> Result<i64> {
    let now = self.clock.now_ms();
    self
      .store
      .zcount(&self.kg.concurrency(scope, key), now + 1, SCORE_MAX)
      .await
  }

  /// 运行中排队的作业
  /// Queued jobs of a run
  pub async fn run_jobs(
    &self,
    workspace_id: Uuid,
    workflow_id: Uuid,
    run_id: Ulid,
    limit: i64,
    offset: i64,
  ) -> Result<Vec<JobResponse>> {
    let limit = limit.clamp(1, RUN_JOBS_MAX);
    let offset = offset.max(0);
    let ids = self
      .store
      .zrange(&self.kg.run_index(&run_id), offset, offset.saturating_add(limit - 1))
      .await?;
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    let zset = self.kg.partition_queue_set(&workflow_id.to_string());
    let records = self.store.hmget(&self.kg.queue_item(), &ids).await?;
    let mut jobs = Vec::with_capacity(ids.len());
    for record in records.into_iter().flatten() {
      let item: QueueItem = serde_json::from_str(&record)?;
      if item.workspace_id != workspace_id {
        continue;
      }
      let position = self.store.zrank(&zset, &item.id).await?.unwrap_or(-1);
      jobs.push(JobResponse {
        at: from_ms(item.at_ms),
        position,
        kind: item.data.kind,
        attempt: item.data.attempt,
      });
    }
    Ok(jobs)
  }

  /// 运行中尚未完成的作业数量
  /// Number of outstanding jobs of a run
  pub async fn outstanding_job_count(&self, run_id: Ulid) -> Result<i64> {
    self.store.zcard(&self.kg.run_index(&run_id)).await
  }

  /// 按状态统计函数的作业数量：`queued` 或 `in_progress`
  /// Count a function's jobs by status: `queued` or `in_progress`
  pub async fn status_count(&self, workflow_id: Uuid, status: &str) -> Result<i64> {
    let id = workflow_id.to_string();
    let key = match status {
      "queued" => self.kg.partition_queue_set(&id),
      "in_progress" => self.kg.concurrency(SCOPE_FUNCTION, &id),
      other => return Err(Error::other(format!("unknown status: {other}"))),
    };
    self.store.zcard(&key).await
  }

  /// 函数正在执行的作业数量
  /// Number of running jobs of a function
  pub async fn running_count(&self, workflow_id: Uuid) -> Result<i64> {
    let id = workflow_id.to_string();
    if self
      .store
      .hget(&self.kg.partition_item(), &id)
      .await?
      .is_none()
    {
      return Ok(0);
    }
    self
      .store
      .zcard(&self.kg.concurrency(SCOPE_FUNCTION, &id))
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::item::tests::identifier;
  use crate::item::{ConcurrencyKey, ConcurrencyScope, Item, Throttle};
  use crate::memdb::MemoryStore;
  use pretty_assertions::assert_eq;

  fn setup(config: QueueConfig) -> (Queue, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let queue = Queue::new(store, config)
      .unwrap()
      .with_clock(clock.clone())
      .with_id_generator(IdGenerator::seeded(5));
    (queue, clock)
  }

  fn edge(fn_id: Uuid) -> QueueItem {
    let mut ident = identifier(1_600_000_000_000);
    ident.workflow_id = fn_id;
    QueueItem::new(fn_id, Item::new(Kind::Edge, ident))
  }

  #[tokio::test]
  async fn test_enqueue_hashes_ids_and_normalizes_wall_time() {
    let (q, clock) = setup(QueueConfig::default());
    let past = clock.now() - chrono::Duration::seconds(30);
    let item = q.enqueue(edge(Uuid::new_v4()).with_id("job-1"), past).await.unwrap();
    assert_eq!(item.id, hash_id("job-1"));
    assert_eq!(item.at_ms, to_ms(past));
    assert_eq!(item.wall_time_ms, clock.now_ms());

    let again = q.enqueue(edge(item.function_id).with_id("job-1"), past).await;
    assert!(matches!(again, Err(Error::ItemAlreadyExists)));
  }

  #[tokio::test]
  async fn test_item_partitions() {
    let (q, _) = setup(QueueConfig::default().map_kind_to_queue(Kind::Pause, "pauses"));
    let item = edge(Uuid::new_v4());
    let parts = q.item_partitions(&item).unwrap();
    assert_eq!(parts[0].as_ref().map(|p| p.id.clone()), Some(item.function_id.to_string()));
    assert!(parts[1].is_none() && parts[2].is_none());

    let mut custom = edge(Uuid::new_v4());
    let acct = custom.data.identifier.account_id;
    custom.data.custom_concurrency_keys = vec![
      ConcurrencyKey::new(ConcurrencyScope::Account, acct, "a", 1),
      ConcurrencyKey::new(ConcurrencyScope::Function, custom.function_id, "b", 2),
      ConcurrencyKey::new(ConcurrencyScope::Function, custom.function_id, "c", 3),
    ];
    let parts = q.item_partitions(&custom).unwrap();
    assert!(parts[0].as_ref().is_some_and(|p| p.is_concurrency_key()));
    assert!(parts[1].as_ref().is_some_and(|p| p.concurrency_limit == Some(2)));
    assert!(parts[2].is_none());

    let system = q.enqueue(edge(Uuid::new_v4()).with_queue_name("pauses"), q.now()).await.unwrap();
    let parts = q.item_partitions(&system).unwrap();
    assert_eq!(parts[0].as_ref().map(|p| p.kind.clone()), Some(PartitionKind::System));
  }

  #[tokio::test]
  async fn test_kind_mapping_routes_to_system_queue() {
    let (q, _) = setup(QueueConfig::default().map_kind_to_queue(Kind::Pause, "pauses"));
    let mut item = edge(Uuid::new_v4());
    item.data.kind = Kind::Pause;
    let item = q.enqueue(item, q.now()).await.unwrap();
    assert_eq!(item.queue_name.as_deref(), Some("pauses"));
    assert_eq!(q.peek("pauses", q.now(), 10).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_peek_limits() {
    let (q, _) = setup(QueueConfig::default());
    let fn_id = Uuid::new_v4();
    for i in 0..3 {
      q.enqueue(edge(fn_id).with_id(format!("j{i}")), q.now()).await.unwrap();
    }
    let queue = fn_id.to_string();
    assert_eq!(q.peek(&queue, q.now(), -1).await.unwrap().len(), 1);
    assert_eq!(q.peek(&queue, q.now(), 0).await.unwrap().len(), 3);
    assert!(matches!(
      q.peek(&queue, q.now(), QUEUE_PEEK_MAX + 1).await,
      Err(Error::PeekMaxExceedsLimits { .. })
    ));
    let peeked = q.peek(&queue, q.now(), 10).await.unwrap();
    assert!(peeked.iter().all(|i| i.earliest_peek_time == q.clock().now_ms()));
  }

  #[tokio::test]
  async fn test_lease_respects_deny_list() {
    let (q, _) = setup(QueueConfig::default());
    let item = q.enqueue(edge(Uuid::new_v4()), q.now()).await.unwrap();
    let denies = LeaseDenies::new();
    let fn_key = q.keys().concurrency(SCOPE_FUNCTION, &item.function_id.to_string());
    denies.record(&Error::PartitionConcurrencyLimit { key: fn_key.clone() });

    let err = q
      .lease(&item, Duration::from_secs(5), Some(&denies))
      .await
      .unwrap_err();
    assert_eq!(err.denied_key(), Some(fn_key.as_str()));
    assert!(q.lease(&item, Duration::from_secs(5), None).await.is_ok());
  }

  #[tokio::test]
  async fn test_custom_key_limit() {
    let (q, _) = setup(QueueConfig::default());
    let fn_id = Uuid::new_v4();
    let acct = Uuid::new_v4();
    let mut leased = Vec::new();
    for i in 0..2 {
      let mut item = edge(fn_id).with_id(format!("c{i}"));
      item.data.custom_concurrency_keys =
        vec![ConcurrencyKey::new(ConcurrencyScope::Account, acct, "user", 1)];
      let item = q.enqueue(item, q.now()).await.unwrap();
      leased.push(q.lease(&item, Duration::from_secs(5), None).await);
    }
    assert!(leased[0].is_ok());
    assert!(matches!(
      leased[1],
      Err(Error::ConcurrencyLimitCustomKey0 { .. })
    ));
  }

  #[tokio::test]
  async fn test_throttle() {
    let (q, clock) = setup(QueueConfig::default());
    let fn_id = Uuid::new_v4();
    let mut items = Vec::new();
    for i in 0..3 {
      let mut item = edge(fn_id).with_id(format!("t{i}"));
      item.data.throttle = Some(Throttle {
        key: "fn-throttle".to_string(),
        limit: 1,
        burst: 1,
        period_secs: 10,
      });
      items.push(q.enqueue(item, q.now()).await.unwrap());
    }
    let d = Duration::from_secs(60);
    assert!(q.lease(&items[0], d, None).await.is_ok());
    assert!(q.lease(&items[1], d, None).await.is_ok());
    let denied = q.lease(&items[2], d, None).await.unwrap_err();
    assert!(matches!(denied, Error::ItemThrottled { .. }));

    clock.advance(Duration::from_secs(10));
    assert!(q.lease(&items[2], d, None).await.is_ok());
  }

  #[tokio::test]
  async fn test_extend_lease_requires_current_lease() {
    let (q, _) = setup(QueueConfig::default());
    let item = q.enqueue(edge(Uuid::new_v4()), q.now()).await.unwrap();
    let d = Duration::from_secs(5);
    assert!(matches!(
      q.extend_lease(&item, q.ids().lease(1), d).await,
      Err(Error::ItemNotLeased)
    ));
    let lease = q.lease(&item, d, None).await.unwrap();
    assert!(matches!(
      q.extend_lease(&item, q.ids().lease(1), d).await,
      Err(Error::LeaseMismatch)
    ));
    let renewed = q.extend_lease(&item, lease, d).await.unwrap();
    assert_ne!(renewed, lease);
    assert!(matches!(
      q.extend_lease(&item, lease, d).await,
      Err(Error::LeaseMismatch)
    ));
  }

  #[tokio::test]
  async fn test_requeue_by_job_id() {
    let (q, clock) = setup(QueueConfig::default());
    let item = q
      .enqueue(edge(Uuid::new_v4()).with_queue_name("pauses").with_id("pause-1"), q.now())
      .await
      .unwrap();
    let later = clock.now() + chrono::Duration::minutes(5);
    q.requeue_by_job_id("pauses", "pause-1", later).await.unwrap();
    assert!(q.peek("pauses", q.now(), 10).await.unwrap().is_empty());
    let peeked = q.peek("pauses", later, 10).await.unwrap();
    assert_eq!(peeked[0].id, item.id);
    assert_eq!(peeked[0].at_ms, to_ms(later));

    assert!(matches!(
      q.requeue_by_job_id("pauses", "missing", later).await,
      Err(Error::ItemNotFound)
    ));
    q.lease(&peeked[0], Duration::from_secs(5), None).await.unwrap();
    assert!(matches!(
      q.requeue_by_job_id("pauses", "pause-1", later).await,
      Err(Error::ItemNotFound)
    ));
  }

  #[tokio::test]
  async fn test_partition_lease_reports_capacity() {
    let getter = |p: &QueuePartition| ConcurrencyLimits {
      function: if p.function_id().is_some() { 2 } else { -1 },
      account: -1,
      custom: -1,
    };
    let (q, _) = setup(QueueConfig::default().concurrency_limit_getter(getter));
    let fn_id = Uuid::new_v4();
    let first = q.enqueue(edge(fn_id).with_id("a"), q.now()).await.unwrap();
    q.enqueue(edge(fn_id).with_id("b"), q.now()).await.unwrap();

    let p = q.partition(&fn_id.to_string()).await.unwrap().unwrap();
    let (lease, capacity) = q.partition_lease(&p, PARTITION_LEASE_DURATION).await.unwrap();
    assert_eq!(capacity, 2);
    assert!(lease.expires_at_ms() > q.clock().now_ms());
    assert!(matches!(
      q.partition_lease(&p, PARTITION_LEASE_DURATION).await,
      Err(Error::PartitionAlreadyLeased)
    ));

    q.lease(&first, Duration::from_secs(30), None).await.unwrap();
    q.partition_requeue(&p, q.now(), false).await.unwrap();
    let (_, capacity) = q.partition_lease(&p, PARTITION_LEASE_DURATION).await.unwrap();
    assert_eq!(capacity, 1);
  }

  #[tokio::test]
  async fn test_partition_lease_when_limited_pins_pointer() {
    let getter = |_: &QueuePartition| ConcurrencyLimits {
      function: 1,
      account: -1,
      custom: -1,
    };
    let (q, clock) = setup(QueueConfig::default().concurrency_limit_getter(getter));
    let fn_id = Uuid::new_v4();
    let first = q.enqueue(edge(fn_id).with_id("a"), q.now()).await.unwrap();
    q.enqueue(edge(fn_id).with_id("b"), q.now()).await.unwrap();
    q.lease(&first, Duration::from_secs(30), None).await.unwrap();

    let p = q.partition(&fn_id.to_string()).await.unwrap().unwrap();
    assert!(matches!(
      q.partition_lease(&p, PARTITION_LEASE_DURATION).await,
      Err(Error::PartitionConcurrencyLimit { .. })
    ));
    assert!(q.partition_peek(true, q.now(), 10).await.unwrap().is_empty());

    // a new enqueue must not pull the pinned pointer back
    q.enqueue(edge(fn_id).with_id("c"), q.now()).await.unwrap();
    assert!(q.partition_peek(true, q.now(), 10).await.unwrap().is_empty());

    clock.advance(PARTITION_CONCURRENCY_LIMIT_REQUEUE_EXTENSION);
    assert_eq!(q.partition_peek(true, q.now(), 10).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_paused_partition() {
    let (q, _) = setup(QueueConfig::default());
    let fn_id = Uuid::new_v4();
    q.enqueue(edge(fn_id), q.now()).await.unwrap();
    q.set_function_paused(fn_id, true).await.unwrap();
    assert!(q.partition_peek(false, q.now(), 10).await.unwrap().is_empty());

    let p = q.partition(&fn_id.to_string()).await.unwrap().unwrap();
    assert!(matches!(
      q.partition_lease(&p, PARTITION_LEASE_DURATION).await,
      Err(Error::PartitionPaused)
    ));

    q.set_function_paused(fn_id, false).await.unwrap();
    assert_eq!(q.partition_peek(false, q.now(), 10).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_partition_peek_filters_allow_and_deny() {
    let (q, _) = setup(QueueConfig::default().deny_queues(["blocked-*"]));
    q.enqueue(edge(Uuid::new_v4()).with_queue_name("blocked-1"), q.now())
      .await
      .unwrap();
    q.enqueue(edge(Uuid::new_v4()).with_queue_name("open"), q.now())
      .await
      .unwrap();
    let peeked = q.partition_peek(true, q.now(), 10).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].id, "open");
    assert!(matches!(
      q.partition_peek(true, q.now(), PARTITION_PEEK_MAX + 1).await,
      Err(Error::PartitionPeekMaxExceedsLimits { .. })
    ));
  }

  #[tokio::test]
  async fn test_account_peek() {
    let (q, _) = setup(QueueConfig::default());
    let a = q.enqueue(edge(Uuid::new_v4()), q.now()).await.unwrap();
    let b = q.enqueue(edge(Uuid::new_v4()), q.now()).await.unwrap();
    let mut accounts = q.account_peek(false, q.now(), 10).await.unwrap();
    accounts.sort();
    let mut expected = vec![a.data.identifier.account_id, b.data.identifier.account_id];
    expected.sort();
    assert_eq!(accounts, expected);
    assert!(matches!(
      q.account_peek(true, q.now(), ACCOUNT_PEEK_MAX + 1).await,
      Err(Error::AccountPeekMaxExceedsLimits { .. })
    ));

    let index = q.keys().account_partition_index(&a.data.identifier.account_id);
    let parts = q.partition_peek_from(&index, true, q.now(), 10).await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].id, a.function_id.to_string());
  }

  #[tokio::test]
  async fn test_reprioritize() {
    let (q, _) = setup(QueueConfig::default());
    let fn_id = Uuid::new_v4();
    q.enqueue(edge(fn_id), q.now()).await.unwrap();
    let name = fn_id.to_string();
    assert!(matches!(
      q.partition_reprioritize(&name, 10).await,
      Err(Error::PriorityTooHigh)
    ));
    assert!(matches!(
      q.partition_reprioritize(&name, -1).await,
      Err(Error::PriorityTooLow)
    ));
    assert!(matches!(
      q.partition_reprioritize("missing", 1).await,
      Err(Error::PartitionNotFound)
    ));
    q.partition_reprioritize(&name, 0).await.unwrap();
    assert_eq!(q.partition(&name).await.unwrap().unwrap().priority, 0);
  }

  #[tokio::test]
  async fn test_config_lease() {
    let (q, clock) = setup(QueueConfig::default());
    let key = q.keys().sequential();
    let held = q.config_lease(&key, CONFIG_LEASE_DURATION, None).await.unwrap();
    assert!(matches!(
      q.config_lease(&key, CONFIG_LEASE_DURATION, None).await,
      Err(Error::ConfigAlreadyLeased)
    ));
    let renewed = q
      .config_lease(&key, CONFIG_LEASE_DURATION, Some(held))
      .await
      .unwrap();
    assert!(matches!(
      q.config_lease(&key, CONFIG_LEASE_DURATION, Some(held)).await,
      Err(Error::ConfigAlreadyLeased)
    ));
    assert!(matches!(
      q.config_lease(&key, Duration::from_secs(21), Some(renewed)).await,
      Err(Error::ConfigLeaseExceedsLimits { max_secs: 20 })
    ));

    clock.advance(CONFIG_LEASE_DURATION);
    assert!(q.config_lease(&key, CONFIG_LEASE_DURATION, None).await.is_ok());
  }

  #[tokio::test]
  async fn test_peek_size_follows_ewma() {
    let (q, _) = setup(QueueConfig::default().peek_size_range(10, 100).peek_multiplier(2));
    let fn_id = Uuid::new_v4();
    let p = QueuePartition::function(fn_id, Uuid::new_v4());
    assert_eq!(q.peek_size(&p).await, 10);
    for _ in 0..12 {
      q.set_peek_ewma(Some(fn_id), 30).await.unwrap();
    }
    assert_eq!(q.peek_ewma(fn_id).await.unwrap(), 30);
    assert_eq!(q.peek_size(&p).await, 60);
    q.set_peek_ewma(Some(fn_id), 5000).await.unwrap();
    assert_eq!(q.peek_size(&p).await, 100);

    let system = QueuePartition::system("q", Uuid::new_v4());
    assert_eq!(q.peek_size(&system).await, 10);
  }

  #[test]
  fn test_scavenge_report() {
    let report = ScavengeReport {
      recovered: 2,
      errors: Vec::new(),
    };
    assert_eq!(report.into_result().unwrap(), 2);
    let report = ScavengeReport {
      recovered: 1,
      errors: vec![Error::ItemNotFound, Error::PartitionNotFound],
    };
    assert!(matches!(report.into_result(), Err(Error::Multiple(e)) if e.len() == 2));
  }
}
