use std::time::Duration;

/// 默认键前缀
/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "stepq";

/// 单次顺序扫描最多选择的分区数
/// Maximum number of partitions selected by one sequential peek
pub const PARTITION_SELECTION_MAX: i64 = 100;
pub const PARTITION_PEEK_MAX: i64 = 300;
pub const ACCOUNT_PEEK_MAX: i64 = 25;

/// 分区租约时长，需要覆盖一次最大窥视的延迟
/// Partition lease duration; long enough to cover peeking QUEUE_PEEK_MAX items
pub const PARTITION_LEASE_DURATION: Duration = Duration::from_secs(4);
/// 默认分区重新入队的延后时间
/// Default extension when requeueing a partition
pub const PARTITION_REQUEUE_EXTENSION: Duration = Duration::from_secs(30);
/// 因并发受限而重新入队的分区延后时间
/// Extension for partitions requeued because of concurrency limits
pub const PARTITION_CONCURRENCY_LIMIT_REQUEUE_EXTENSION: Duration = Duration::from_secs(2);
pub const PARTITION_LOOKAHEAD: Duration = Duration::from_secs(1);

pub const QUEUE_PEEK_MIN: i64 = 300;
pub const QUEUE_PEEK_MAX: i64 = 5000;
pub const QUEUE_PEEK_CURR_MULTIPLIER: i64 = 4;
pub const QUEUE_PEEK_EWMA_LEN: usize = 10;
pub const QUEUE_LEASE_DURATION: Duration = Duration::from_secs(20);
pub const CONFIG_LEASE_DURATION: Duration = Duration::from_secs(10);
pub const CONFIG_LEASE_MAX: Duration = Duration::from_secs(20);

/// 优先级：0 最高，9 最低
/// Priorities: 0 is the highest, 9 the lowest
pub const PRIORITY_MAX: i32 = 0;
pub const PRIORITY_DEFAULT: i32 = 5;
pub const PRIORITY_MIN: i32 = 9;

/// 比较运行开始时间与边入队时间时的宽限期
/// Grace period used when comparing run start times to edge enqueue times
pub const FUNCTION_START_SCORE_BUFFER_TIME: Duration = Duration::from_secs(10);
/// 超过此时间的未来项不调整分数
/// Items further in the future than this are never rescored
pub const FUTURE_AT_LIMIT: Duration = Duration::from_secs(2);
/// 优先级因子的绝对上限
/// Absolute bound of an item's priority factor
pub const PRIORITY_FACTOR_MAX: Duration = Duration::from_secs(600);

pub const DEFAULT_NUM_WORKERS: usize = 100;
pub const DEFAULT_POLL_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_CONCURRENCY: i64 = 1000;
pub const DEFAULT_SCAVENGE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// 表示没有并发限制
/// Marks the absence of a concurrency limit
pub const NO_CONCURRENCY_LIMIT: i64 = -1;

/// 回收器每批扫描的分区数与队列项数
/// Partitions and items scanned per scavenger batch
pub const SCAVENGE_PARTITION_BATCH: i64 = 100;
pub const SCAVENGE_ITEM_BATCH: i64 = 100;

pub const RUN_JOBS_MAX: i64 = 10;

/// 版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_constants() {
    assert_eq!(PARTITION_PEEK_MAX, 300);
    assert!(QUEUE_PEEK_MIN <= QUEUE_PEEK_MAX);
    assert!(CONFIG_LEASE_DURATION <= CONFIG_LEASE_MAX);
    assert_eq!(PRIORITY_MAX, 0);
    assert_eq!(PRIORITY_MIN, 9);
    assert_eq!(DEFAULT_IDEMPOTENCY_TTL, Duration::from_secs(43200));
  }
}
