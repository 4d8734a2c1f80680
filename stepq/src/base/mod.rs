//! 存储模块
//! Store module
//!
//! 定义了队列与存储后端之间的原子操作契约。每个复合操作在后端中都必须整体生效或整体不生效，
//! 请求结构体携带队列预先计算好的键名与记录。
//! Defines the contract of atomic operations between the queue and its storage backend.
//! Every compound operation must apply entirely or not at all; request structs carry the
//! key names and records precomputed by the queue.

use crate::error::Result;
use async_trait::async_trait;

pub mod constants;
pub mod keys;

/// 负无穷分数
/// Negative infinity score bound
pub const SCORE_MIN: i64 = i64::MIN;
/// 正无穷分数
/// Positive infinity score bound
pub const SCORE_MAX: i64 = i64::MAX;

/// 脚本中引用的单个分区
/// A single partition referenced by a script
#[derive(Debug, Clone, Default)]
pub struct PartitionRef {
  pub id: String,
  /// 分区的队列项有序集合
  /// The partition's item sorted set
  pub zset: String,
  /// 分区不存在时写入的 JSON 记录
  /// JSON record written if the partition does not exist yet
  pub record: String,
  /// 账户 ID，为空表示没有账户指针
  /// Account ID; empty when the partition has no account pointer
  pub account_id: String,
  pub account_index: String,
}

/// 分片引用
/// Shard reference
#[derive(Debug, Clone, Default)]
pub struct ShardRef {
  pub name: String,
  pub record: String,
}

/// 队列项所在的进行中集合
/// In-progress sets an item is tracked in
#[derive(Debug, Clone, Default)]
pub struct InProgressKeys {
  /// 并发过期索引
  /// Concurrency expiry index
  pub index: String,
  /// 索引中的成员（函数 ID）
  /// Member within the index (function ID)
  pub member: String,
  pub function: String,
  pub account: String,
  /// 最多两个自定义键集合
  /// Up to two custom key sets
  pub custom: Vec<String>,
}

/// 分区指针所在的索引
/// Indexes that hold a partition's pointer
#[derive(Debug, Clone, Default)]
pub struct PointerKeys {
  pub partition_hash: String,
  pub global_index: String,
  pub global_account_index: String,
  /// 分片分区索引，没有分片时为 None
  /// Shard partition index; None when the partition has no shard
  pub shard_index: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
  pub item_hash: String,
  pub idempotency_key: String,
  pub shards_hash: String,
  pub fn_metadata_key: String,
  pub pointers: PointerKeys,
  pub item_id: String,
  pub item: String,
  pub score: i64,
  pub at_ms: i64,
  pub partition_time_ms: i64,
  pub now_ms: i64,
  pub partitions: Vec<PartitionRef>,
  pub shard: Option<ShardRef>,
  /// 不存在时写入的函数元数据
  /// Function metadata written if absent
  pub fn_metadata: Option<String>,
  /// 二级索引键
  /// Secondary index keys
  pub indexes: Vec<String>,
}

/// 限流参数（毫秒）
/// Throttle parameters, in milliseconds
#[derive(Debug, Clone, Default)]
pub struct ThrottleRef {
  pub key: String,
  pub limit: i64,
  pub burst: i64,
  pub period_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseRequest {
  pub item_hash: String,
  pub lease_hash: String,
  pub item_id: String,
  pub lease_id: String,
  pub now_ms: i64,
  pub expires_at_ms: i64,
  pub in_progress: InProgressKeys,
  pub function_limit: i64,
  pub account_limit: i64,
  /// 与 `in_progress.custom` 一一对应
  /// Matches `in_progress.custom` one to one
  pub custom_limits: Vec<i64>,
  pub throttle: Option<ThrottleRef>,
  /// 租用后移除队列项的分区集合
  /// Partition sets the item is removed from once leased
  pub partition_sets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtendLeaseRequest {
  pub item_hash: String,
  pub lease_hash: String,
  pub item_id: String,
  pub existing: String,
  pub lease_id: String,
  pub expires_at_ms: i64,
  pub in_progress: InProgressKeys,
}

#[derive(Debug, Clone, Default)]
pub struct DequeueRequest {
  pub item_hash: String,
  pub lease_hash: String,
  pub idempotency_key: String,
  pub item_id: String,
  /// 幂等时长（秒），0 表示不写入
  /// Idempotency period in seconds; 0 skips the marker
  pub idempotency_ttl_secs: i64,
  pub in_progress: InProgressKeys,
  pub partition_sets: Vec<String>,
  pub indexes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequeueRequest {
  pub item_hash: String,
  pub lease_hash: String,
  pub pointers: PointerKeys,
  pub item_id: String,
  pub item: String,
  pub at_ms: i64,
  pub now_ms: i64,
  pub in_progress: InProgressKeys,
  pub partitions: Vec<PartitionRef>,
  pub indexes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequeueByIdRequest {
  pub item_hash: String,
  pub lease_hash: String,
  pub pointers: PointerKeys,
  pub item_id: String,
  pub item: String,
  pub at_ms: i64,
  pub now_ms: i64,
  pub partition: PartitionRef,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionLeaseRequest {
  pub pointers: PointerKeys,
  pub partition_id: String,
  pub account_id: String,
  pub account_index: String,
  /// 函数元数据键，非函数分区为 None
  /// Function metadata key; None for partitions without a function
  pub fn_metadata_key: Option<String>,
  pub function_in_progress: String,
  pub account_in_progress: String,
  pub custom_in_progress: String,
  pub function_limit: i64,
  pub account_limit: i64,
  pub custom_limit: i64,
  pub lease_id: String,
  pub now_ms: i64,
  pub expires_at_ms: i64,
  /// 并发受限时指针被推迟到的时间
  /// Time the pointer is pushed to when concurrency limited
  pub force_at_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionRequeueRequest {
  pub pointers: PointerKeys,
  pub partition_id: String,
  pub zset: String,
  pub account_id: String,
  pub account_index: String,
  pub in_progress: String,
  pub at_ms: i64,
  pub forced: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigLeaseRequest {
  pub key: String,
  pub now_ms: i64,
  pub lease_id: String,
  pub existing: Option<String>,
  pub ttl_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ShardLeaseRequest {
  pub shards_hash: String,
  pub name: String,
  pub now_ms: i64,
  pub lease_id: String,
  pub index: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RenewShardLeaseRequest {
  pub shards_hash: String,
  pub name: String,
  pub now_ms: i64,
  pub existing: String,
  pub lease_id: String,
}

/// 队列存储后端特性
/// Queue storage backend trait
///
/// 复合操作返回状态码而不是错误，由队列映射为具体的错误类型。
/// Compound operations return status codes rather than errors; the queue maps them onto
/// concrete error variants.
#[async_trait]
pub trait QueueStore: Send + Sync {
  /// 入队：0 成功；1 已存在（队列项或幂等标记）
  /// Enqueue: 0 ok; 1 already exists (item or idempotency marker)
  async fn enqueue(&self, req: &EnqueueRequest) -> Result<i64>;

  /// 租用队列项：0 成功；1 未找到；2 已被租用；3 函数并发已满；4 账户并发已满；
  /// 5/6 自定义键并发已满；7 被限流
  /// Lease an item: 0 ok; 1 not found; 2 already leased; 3 function limit; 4 account
  /// limit; 5/6 custom key limits; 7 throttled
  async fn lease(&self, req: &LeaseRequest) -> Result<i64>;

  /// 续租：0 成功；1 未找到；2 未被租用；3 租约不匹配
  /// Extend a lease: 0 ok; 1 not found; 2 not leased; 3 lease mismatch
  async fn extend_lease(&self, req: &ExtendLeaseRequest) -> Result<i64>;

  /// 出队：0 成功；1 未找到
  /// Dequeue: 0 ok; 1 not found
  async fn dequeue(&self, req: &DequeueRequest) -> Result<i64>;

  /// 重新入队：0 成功；1 未找到
  /// Requeue: 0 ok; 1 not found
  async fn requeue(&self, req: &RequeueRequest) -> Result<i64>;

  /// 按 ID 重新入队：0 成功；-1 未找到；-2 已被租用
  /// Requeue by ID: 0 ok; -1 not found; -2 leased
  async fn requeue_by_id(&self, req: &RequeueByIdRequest) -> Result<i64>;

  /// 租用分区，返回（状态码，可用容量）：0 成功；-1 并发已满；-2 未找到；-3 已被租用；
  /// -4 已暂停。容量 -1 表示不限
  /// Lease a partition, returning (code, capacity): 0 ok; -1 concurrency limited;
  /// -2 not found; -3 already leased; -4 paused. A capacity of -1 means unlimited
  async fn partition_lease(&self, req: &PartitionLeaseRequest) -> Result<(i64, i64)>;

  /// 重新入队分区：0 成功；1 未找到；2 已回收
  /// Requeue a partition: 0 ok; 1 not found; 2 garbage collected
  async fn partition_requeue(&self, req: &PartitionRequeueRequest) -> Result<i64>;

  /// 设置分区优先级：0 成功；1 未找到
  /// Set a partition's priority: 0 ok; 1 not found
  async fn partition_reprioritize(
    &self,
    partition_hash: &str,
    partition_id: &str,
    priority: i32,
  ) -> Result<i64>;

  /// 配置租约：0 成功；1 已被其他进程持有
  /// Config lease: 0 ok; 1 held by another process
  async fn config_lease(&self, req: &ConfigLeaseRequest) -> Result<i64>;

  /// 租用分片槽位：0 成功；-1 未找到；-2 已被租用；-3 索引无效
  /// Lease a shard slot: 0 ok; -1 not found; -2 already leased; -3 invalid index
  async fn lease_shard(&self, req: &ShardLeaseRequest) -> Result<i64>;

  /// 续租分片：0 成功；-1 未找到；-2 租约不存在
  /// Renew a shard lease: 0 ok; -1 not found; -2 lease not found
  async fn renew_shard_lease(&self, req: &RenewShardLeaseRequest) -> Result<i64>;

  // === 通用读写 ===
  // === Generic reads and writes ===

  async fn set(&self, key: &str, value: &str) -> Result<()>;

  /// 批量读取字符串键
  /// Read several string keys at once
  async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

  async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

  async fn hvals(&self, key: &str) -> Result<Vec<String>>;

  async fn zcard(&self, key: &str) -> Result<i64>;

  /// 分数在闭区间 [min, max] 内的成员数量
  /// Number of members scored within [min, max]
  async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<i64>;

  async fn zrank(&self, key: &str, member: &str) -> Result<Option<i64>>;

  /// 按分数升序返回（成员，分数），`limit` 小于等于 0 表示不限
  /// Members and scores in ascending score order; a `limit` ≤ 0 means unbounded
  async fn zrange_by_score(
    &self,
    key: &str,
    min: i64,
    max: i64,
    limit: i64,
  ) -> Result<Vec<(String, i64)>>;

  /// 按排名返回成员，支持负数下标
  /// Members by rank; negative indexes count from the end
  async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

  async fn lrange(&self, key: &str) -> Result<Vec<String>>;

  /// 追加到列表末尾并只保留最后 `len` 个元素
  /// Append to a list and keep only its last `len` elements
  async fn push_capped(&self, key: &str, value: &str, len: usize) -> Result<()>;
}
