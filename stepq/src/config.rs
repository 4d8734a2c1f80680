//! 配置模块
//! Configuration module
//!
//! 定义了队列与处理器的配置选项，以及由宿主进程提供的可插拔策略
//! Defines queue and processor configuration, and the pluggable strategies supplied by
//! the host process

use crate::base::constants::*;
use crate::base::keys::KeyGenerator;
use crate::error::{Error, Result};
use crate::item::{ConcurrencyKey, Kind, QueueItem};
use crate::partition::{PartitionKind, QueuePartition, QueueShard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 分区的并发上限；小于等于 0 表示不限制
/// Concurrency limits of a partition; a value ≤ 0 disables the check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
  pub function: i64,
  pub account: i64,
  pub custom: i64,
}

/// 分区优先级查找函数类型（0 最高，9 最低）
/// Partition priority finder (0 highest, 9 lowest)
pub type PriorityFinder = Arc<dyn Fn(&QueuePartition) -> i32 + Send + Sync>;

/// 分片查找函数类型
/// Shard finder: (queue name, workspace id) -> shard
pub type ShardFinder = Arc<dyn Fn(&str, Option<Uuid>) -> Option<QueueShard> + Send + Sync>;

/// 并发上限获取函数类型
/// Concurrency limit getter
pub type ConcurrencyLimitGetter = Arc<dyn Fn(&QueuePartition) -> ConcurrencyLimits + Send + Sync>;

/// 自定义并发键生成函数类型
/// Custom concurrency key generator
pub type CustomConcurrencyKeyGenerator = Arc<dyn Fn(&QueueItem) -> Vec<ConcurrencyKey> + Send + Sync>;

/// 队列项二级索引函数类型
/// Secondary index function for queue items
pub type QueueItemIndexer = Arc<dyn Fn(&QueueItem, &KeyGenerator) -> Vec<String> + Send + Sync>;

/// 幂等时长函数类型
/// Idempotency period function
pub type IdempotencyTtlFn = Arc<dyn Fn(&QueueItem) -> Duration + Send + Sync>;

/// 重试退避函数类型，参数为已尝试次数
/// Retry backoff function; the argument is the attempt that failed
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// 默认优先级：分区记录中保存的优先级
/// Default priority: the priority stored on the partition record
pub fn default_priority_finder() -> PriorityFinder {
  Arc::new(|p: &QueuePartition| p.priority)
}

/// 默认并发上限
/// Default concurrency limits
///
/// 函数分区使用自身的上限或默认并发，自定义键分区只受键自身的上限约束，
/// 系统分区不受限制。
/// Function partitions use their own limit or the default concurrency, custom key
/// partitions are bound only by the key's own limit, and system partitions are unlimited.
pub fn default_concurrency_limit_getter() -> ConcurrencyLimitGetter {
  Arc::new(|p: &QueuePartition| {
    let def = match p.concurrency_limit {
      Some(limit) if limit > 0 => limit,
      _ => DEFAULT_CONCURRENCY,
    };
    let unlimited = ConcurrencyLimits {
      function: NO_CONCURRENCY_LIMIT,
      account: NO_CONCURRENCY_LIMIT,
      custom: NO_CONCURRENCY_LIMIT,
    };
    match p.kind {
      PartitionKind::Function { .. } => ConcurrencyLimits {
        function: def,
        account: if p.account_id.is_some() { def } else { NO_CONCURRENCY_LIMIT },
        ..unlimited
      },
      PartitionKind::ConcurrencyKey { .. } => ConcurrencyLimits {
        custom: def,
        ..unlimited
      },
      PartitionKind::System => unlimited,
    }
  })
}

/// 默认使用队列项自带的并发键
/// By default the keys declared on the item are used
pub fn default_custom_key_generator() -> CustomConcurrencyKeyGenerator {
  Arc::new(|item: &QueueItem| item.data.custom_concurrency_keys.clone())
}

/// 默认按运行 ID 建立索引
/// Index items by run ID by default
pub fn default_item_indexer() -> QueueItemIndexer {
  Arc::new(|item: &QueueItem, kg: &KeyGenerator| vec![kg.run_index(&item.data.identifier.run_id)])
}

/// 默认重试延迟：指数退避加抖动
/// Default retry delay: exponential backoff with jitter
pub fn default_backoff() -> BackoffFn {
  Arc::new(|attempt: u32| {
    let base = (attempt as u64).pow(4) + 15;
    let jitter = rand::random::<u64>() % (30 * (attempt as u64 + 1));
    Duration::from_secs(base + jitter)
  })
}

/// 名称是否匹配列表（以 `*` 结尾的条目为前缀匹配）
/// Whether a name matches the list (entries ending in `*` match by prefix)
pub fn matches_list(name: &str, list: &[String]) -> bool {
  list.iter().any(|entry| match entry.strip_suffix('*') {
    Some(prefix) => name.starts_with(prefix),
    None => name == entry,
  })
}

/// 队列配置
/// Queue configuration
#[derive(Clone)]
pub struct QueueConfig {
  /// 键前缀
  /// Key prefix
  pub key_prefix: String,
  /// 默认幂等时长
  /// Default idempotency period
  pub idempotency_ttl: Duration,
  pub idempotency_ttl_fn: Option<IdempotencyTtlFn>,
  /// 每次窥视的数量范围
  /// Range for the number of items peeked per partition
  pub peek_min: i64,
  pub peek_max: i64,
  /// EWMA 值的乘数
  /// Multiplier applied to the EWMA value
  pub peek_multiplier: i64,
  /// EWMA 历史长度
  /// Length of the EWMA history
  pub peek_ewma_len: usize,
  /// 只扫描这些队列（为空时不限制）
  /// Only scan these queues (no restriction when empty)
  pub allow_queues: Vec<String>,
  /// 从不扫描这些队列
  /// Never scan these queues
  pub deny_queues: Vec<String>,
  /// 工作类型到系统队列名的映射
  /// Mapping of work kind to system queue name
  pub kind_to_queue: HashMap<Kind, String>,
  pub priority_finder: PriorityFinder,
  pub shard_finder: Option<ShardFinder>,
  pub concurrency_limit_getter: ConcurrencyLimitGetter,
  pub custom_key_generator: CustomConcurrencyKeyGenerator,
  pub item_indexer: QueueItemIndexer,
}

impl fmt::Debug for QueueConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConfig")
      .field("key_prefix", &self.key_prefix)
      .field("idempotency_ttl", &self.idempotency_ttl)
      .field("peek_min", &self.peek_min)
      .field("peek_max", &self.peek_max)
      .field("peek_multiplier", &self.peek_multiplier)
      .field("peek_ewma_len", &self.peek_ewma_len)
      .field("allow_queues", &self.allow_queues)
      .field("deny_queues", &self.deny_queues)
      .field("kind_to_queue", &self.kind_to_queue)
      .finish_non_exhaustive()
  }
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      key_prefix: DEFAULT_KEY_PREFIX.to_string(),
      idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
      idempotency_ttl_fn: None,
      peek_min: QUEUE_PEEK_MIN,
      peek_max: QUEUE_PEEK_MAX,
      peek_multiplier: QUEUE_PEEK_CURR_MULTIPLIER,
      peek_ewma_len: QUEUE_PEEK_EWMA_LEN,
      allow_queues: Vec::new(),
      deny_queues: Vec::new(),
      kind_to_queue: HashMap::new(),
      priority_finder: default_priority_finder(),
      shard_finder: None,
      concurrency_limit_getter: default_concurrency_limit_getter(),
      custom_key_generator: default_custom_key_generator(),
      item_indexer: default_item_indexer(),
    }
  }
}

impl QueueConfig {
  /// 创建新的队列配置
  /// Create a new queue configuration
  pub fn new() -> Self {
    Self::default()
  }

  pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.key_prefix = prefix.into();
    self
  }

  pub fn idempotency_ttl(mut self, ttl: Duration) -> Self {
    self.idempotency_ttl = ttl;
    self
  }

  pub fn idempotency_ttl_fn<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueueItem) -> Duration + Send + Sync + 'static,
  {
    self.idempotency_ttl_fn = Some(Arc::new(f));
    self
  }

  /// 设置窥视数量范围
  /// Set the peek size range
  pub fn peek_size_range(mut self, min: i64, max: i64) -> Self {
    self.peek_min = min;
    self.peek_max = max;
    self
  }

  pub fn peek_multiplier(mut self, multiplier: i64) -> Self {
    self.peek_multiplier = multiplier;
    self
  }

  pub fn peek_ewma_len(mut self, len: usize) -> Self {
    self.peek_ewma_len = len;
    self
  }

  pub fn allow_queues<I, S>(mut self, queues: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.allow_queues = queues.into_iter().map(Into::into).collect();
    self
  }

  pub fn deny_queues<I, S>(mut self, queues: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.deny_queues = queues.into_iter().map(Into::into).collect();
    self
  }

  /// 将某种工作映射到系统队列
  /// Route a kind of work to a system queue
  pub fn map_kind_to_queue(mut self, kind: Kind, queue: impl Into<String>) -> Self {
    self.kind_to_queue.insert(kind, queue.into());
    self
  }

  pub fn priority_finder<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueuePartition) -> i32 + Send + Sync + 'static,
  {
    self.priority_finder = Arc::new(f);
    self
  }

  pub fn shard_finder<F>(mut self, f: F) -> Self
  where
    F: Fn(&str, Option<Uuid>) -> Option<QueueShard> + Send + Sync + 'static,
  {
    self.shard_finder = Some(Arc::new(f));
    self
  }

  pub fn concurrency_limit_getter<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueuePartition) -> ConcurrencyLimits + Send + Sync + 'static,
  {
    self.concurrency_limit_getter = Arc::new(f);
    self
  }

  pub fn custom_key_generator<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueueItem) -> Vec<ConcurrencyKey> + Send + Sync + 'static,
  {
    self.custom_key_generator = Arc::new(f);
    self
  }

  pub fn item_indexer<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueueItem, &KeyGenerator) -> Vec<String> + Send + Sync + 'static,
  {
    self.item_indexer = Arc::new(f);
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.key_prefix.trim().is_empty() {
      return Err(Error::config("Key prefix must not be empty"));
    }
    if self.peek_min <= 0 || self.peek_min > self.peek_max {
      return Err(Error::config("Peek size range must satisfy 0 < min <= max"));
    }
    if self.peek_max > QUEUE_PEEK_MAX {
      return Err(Error::config(format!(
        "Peek max must not exceed {QUEUE_PEEK_MAX}"
      )));
    }
    if self.peek_multiplier <= 0 {
      return Err(Error::config("Peek multiplier must be positive"));
    }
    if self.peek_ewma_len == 0 {
      return Err(Error::config("Peek EWMA length must be positive"));
    }
    if let Some(name) = self.allow_queues.iter().find(|q| self.deny_queues.contains(q)) {
      return Err(Error::config(format!(
        "Queue '{name}' is both allowed and denied"
      )));
    }
    Ok(())
  }
}

/// 运行模式
/// Run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode {
  /// 是否竞争顺序扫描租约
  /// Whether to compete for the sequential scan lease
  pub sequential: bool,
  /// 是否竞争回收器租约
  /// Whether to compete for the scavenger lease
  pub scavenger: bool,
  /// 每轮处理的分区比例（1-100）
  /// Percentage of peeked partitions processed per pass (1-100)
  pub partition_ratio: u8,
  /// 使用两级账户扫描的概率（0-100）
  /// Probability of a two-level account scan (0-100)
  pub account_ratio: u8,
  /// 是否竞争分片租约
  /// Whether to compete for shard leases
  pub shards: bool,
}

impl Default for RunMode {
  fn default() -> Self {
    Self {
      sequential: true,
      scavenger: true,
      partition_ratio: 100,
      account_ratio: 0,
      shards: true,
    }
  }
}

/// 处理器配置
/// Processor configuration
#[derive(Clone)]
pub struct ProcessorConfig {
  /// 并发工作者数量
  /// Number of concurrent workers
  pub num_workers: usize,
  /// 扫描间隔
  /// Interval between scans
  pub poll_tick: Duration,
  /// 队列项租约时长
  /// Queue item lease duration
  pub lease_duration: Duration,
  pub scavenge_interval: Duration,
  pub run_mode: RunMode,
  pub backoff: BackoffFn,
}

impl fmt::Debug for ProcessorConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProcessorConfig")
      .field("num_workers", &self.num_workers)
      .field("poll_tick", &self.poll_tick)
      .field("lease_duration", &self.lease_duration)
      .field("scavenge_interval", &self.scavenge_interval)
      .field("run_mode", &self.run_mode)
      .finish_non_exhaustive()
  }
}

impl Default for ProcessorConfig {
  fn default() -> Self {
    Self {
      num_workers: DEFAULT_NUM_WORKERS,
      poll_tick: DEFAULT_POLL_TICK,
      lease_duration: QUEUE_LEASE_DURATION,
      scavenge_interval: DEFAULT_SCAVENGE_INTERVAL,
      run_mode: RunMode::default(),
      backoff: default_backoff(),
    }
  }
}

impl ProcessorConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn num_workers(mut self, n: usize) -> Self {
    self.num_workers = n;
    self
  }

  pub fn poll_tick(mut self, tick: Duration) -> Self {
    self.poll_tick = tick;
    self
  }

  pub fn lease_duration(mut self, duration: Duration) -> Self {
    self.lease_duration = duration;
    self
  }

  pub fn scavenge_interval(mut self, interval: Duration) -> Self {
    self.scavenge_interval = interval;
    self
  }

  pub fn run_mode(mut self, mode: RunMode) -> Self {
    self.run_mode = mode;
    self
  }

  pub fn backoff<F>(mut self, f: F) -> Self
  where
    F: Fn(u32) -> Duration + Send + Sync + 'static,
  {
    self.backoff = Arc::new(f);
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.num_workers == 0 {
      return Err(Error::config("Number of workers must be greater than 0"));
    }
    if self.poll_tick.is_zero() {
      return Err(Error::config("Poll tick must be positive"));
    }
    if self.scavenge_interval.is_zero() {
      return Err(Error::config("Scavenge interval must be positive"));
    }
    if self.lease_duration < Duration::from_secs(1) {
      return Err(Error::config("Lease duration cannot be less than 1 second"));
    }
    if !(1..=100).contains(&self.run_mode.partition_ratio) {
      return Err(Error::config("Partition ratio must be between 1 and 100"));
    }
    if self.run_mode.account_ratio > 100 {
      return Err(Error::config("Account ratio must be between 0 and 100"));
    }
    Ok(())
  }
}
