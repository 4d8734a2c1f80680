//! 错误处理模块
//! Error handling module
//!
//! 定义了队列中使用的各种错误类型。容量类错误携带被拒绝的键，
//! 扫描循环据此填充单次扫描的拒绝列表。
//! Defines the error types used by the queue. Capacity errors carry the key that was
//! denied so that the scan loop can populate its per-pass deny list.

use thiserror::Error;

/// 队列的结果类型
/// Result type for the queue
pub type Result<T> = std::result::Result<T, Error>;

/// 队列错误类型
/// Queue error type
#[derive(Error, Debug)]
pub enum Error {
  /// Redis connection error
  #[error("Redis connection error: {0}")]
  Redis(#[from] redis::RedisError),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// 队列项已存在（幂等窗口内）
  /// Queue item already exists within the idempotency window
  #[error("queue item already exists")]
  ItemAlreadyExists,

  /// 队列项未找到
  /// Queue item not found
  #[error("queue item not found")]
  ItemNotFound,

  /// 队列项已被租用
  /// Queue item already leased
  #[error("queue item already leased")]
  ItemAlreadyLeased,

  /// 队列项未被租用
  /// Queue item is not leased
  #[error("queue item is not leased")]
  ItemNotLeased,

  /// 租约不匹配
  /// Item lease does not match
  #[error("item lease does not match")]
  LeaseMismatch,

  /// 队列项被限流
  /// Queue item throttled
  #[error("queue item throttled: {key}")]
  ItemThrottled { key: String },

  /// 函数并发已满
  /// At partition (function) concurrency limit
  #[error("at partition concurrency limit: {key}")]
  PartitionConcurrencyLimit { key: String },

  /// 账户并发已满
  /// At account concurrency limit
  #[error("at account concurrency limit: {key}")]
  AccountConcurrencyLimit { key: String },

  /// 第一个自定义并发键已满
  /// At the limit of the first custom concurrency key
  #[error("at concurrency limit 0: {key}")]
  ConcurrencyLimitCustomKey0 { key: String },

  /// 第二个自定义并发键已满
  /// At the limit of the second custom concurrency key
  #[error("at concurrency limit 1: {key}")]
  ConcurrencyLimitCustomKey1 { key: String },

  /// Partition not found
  #[error("partition not found")]
  PartitionNotFound,

  /// Partition already leased
  #[error("partition already leased")]
  PartitionAlreadyLeased,

  /// 分区所属函数已暂停
  /// Partition belongs to a paused function
  #[error("partition is paused")]
  PartitionPaused,

  /// 分区已被回收
  /// Partition garbage collected
  #[error("partition garbage collected")]
  PartitionGarbageCollected,

  #[error("peek exceeded the maximum limit of {max}")]
  PeekMaxExceedsLimits { max: i64 },

  #[error("partition peek exceeded the maximum limit of {max}")]
  PartitionPeekMaxExceedsLimits { max: i64 },

  #[error("account peek exceeded the maximum limit of {max}")]
  AccountPeekMaxExceedsLimits { max: i64 },

  /// 优先级数值大于 9
  /// Priority value is greater than nine
  #[error("priority is too high")]
  PriorityTooHigh,

  /// 优先级数值小于 0
  /// Priority value is below zero
  #[error("priority is too low")]
  PriorityTooLow,

  #[error("weighted sample could not be read")]
  WeightedSampleRead,

  /// 配置租约已被其他进程持有
  /// Config key already leased by another process
  #[error("config key already leased")]
  ConfigAlreadyLeased,

  #[error("config lease duration exceeds the maximum of {max_secs} seconds")]
  ConfigLeaseExceedsLimits { max_secs: u64 },

  #[error("shard not found")]
  ShardNotFound,

  #[error("shard index is already leased")]
  ShardIndexLeased,

  /// 分片租约索引过高（刚有租约过期）
  /// Shard lease index is too high (a lease just expired)
  #[error("shard lease index is invalid")]
  ShardIndexInvalid,

  #[error("shard lease not found")]
  ShardLeaseNotFound,

  /// 脚本返回了未知状态码
  /// A script returned a status code outside its contract
  #[error("unknown response from {op}: {code}")]
  UnknownScriptResponse { op: &'static str, code: i64 },

  /// 多个错误的聚合
  /// Aggregate of several errors
  #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
  Multiple(Vec<Error>),

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

fn join_errors(errors: &[Error]) -> String {
  errors
    .iter()
    .map(|e| e.to_string())
    .collect::<Vec<_>>()
    .join("; ")
}

impl Error {
  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  pub(crate) fn unknown(op: &'static str, code: i64) -> Self {
    Self::UnknownScriptResponse { op, code }
  }

  /// 是否为并发容量错误
  /// Whether this is a concurrency capacity error
  pub fn is_concurrency_limit(&self) -> bool {
    matches!(
      self,
      Error::PartitionConcurrencyLimit { .. }
        | Error::AccountConcurrencyLimit { .. }
        | Error::ConcurrencyLimitCustomKey0 { .. }
        | Error::ConcurrencyLimitCustomKey1 { .. }
    )
  }

  /// 是否为容量错误（并发或限流）
  /// Whether this is a capacity error (concurrency or throttling)
  pub fn is_capacity(&self) -> bool {
    self.is_concurrency_limit() || matches!(self, Error::ItemThrottled { .. })
  }

  /// 是否可以视为已处理（未找到或已回收）
  /// Whether the caller can treat this as already handled
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      Error::ItemNotFound
        | Error::PartitionNotFound
        | Error::PartitionGarbageCollected
        | Error::ShardNotFound
    )
  }

  /// 返回容量错误中被拒绝的键
  /// Returns the denied key carried by a capacity error
  pub fn denied_key(&self) -> Option<&str> {
    match self {
      Error::ItemThrottled { key }
      | Error::PartitionConcurrencyLimit { key }
      | Error::AccountConcurrencyLimit { key }
      | Error::ConcurrencyLimitCustomKey0 { key }
      | Error::ConcurrencyLimitCustomKey1 { key } => Some(key.as_str()),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_creation() {
    let err = Error::config("bad peek range");
    assert!(matches!(err, Error::Config { .. }));

    let err = Error::other("test other error");
    assert!(matches!(err, Error::Other { .. }));
  }

  #[test]
  fn test_denied_key() {
    let err = Error::AccountConcurrencyLimit {
      key: "acct-1".to_string(),
    };
    assert_eq!(err.denied_key(), Some("acct-1"));
    assert!(err.is_concurrency_limit());
    assert!(Error::ItemThrottled { key: "t".into() }.is_capacity());
    assert!(!Error::ItemThrottled { key: "t".into() }.is_concurrency_limit());
    assert_eq!(Error::ItemNotFound.denied_key(), None);
  }

  #[test]
  fn test_not_found_classification() {
    assert!(Error::PartitionGarbageCollected.is_not_found());
    assert!(Error::ItemNotFound.is_not_found());
    assert!(!Error::ItemAlreadyLeased.is_not_found());
  }

  #[test]
  fn test_multiple_display() {
    let err = Error::Multiple(vec![Error::ItemNotFound, Error::PartitionNotFound]);
    let msg = err.to_string();
    assert!(msg.starts_with("2 errors occurred"));
    assert!(msg.contains("queue item not found"));
  }
}
