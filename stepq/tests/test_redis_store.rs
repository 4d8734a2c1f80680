//! Lua script behaviour against a live Redis
//! Each test skips itself when Redis is not reachable at `REDIS_URL`

use std::sync::Arc;
use std::time::Duration;
use stepq::base::constants::*;
use stepq::clock::{Clock, ManualClock};
use stepq::config::{ConcurrencyLimits, QueueConfig};
use stepq::error::Error;
use stepq::item::{Identifier, Item, Kind, QueueItem};
use stepq::partition::QueuePartition;
use stepq::queue::Queue;
use stepq::rdb::RedisStore;
use stepq::redis::RedisConnectionConfig;
use ulid::Ulid;
use uuid::Uuid;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn setup(config: QueueConfig) -> Option<(Queue, Arc<ManualClock>)> {
  let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
  let store = match RedisConnectionConfig::single(url.as_str()) {
    Ok(c) => match RedisStore::new(c).await {
      Ok(store) => store,
      Err(e) => {
        println!("Skipping test - Redis not available: {e}");
        return None;
      }
    },
    Err(e) => {
      println!("Skipping test - invalid Redis URL: {e}");
      return None;
    }
  };
  let clock = Arc::new(ManualClock::starting_now());
  // a fresh prefix per test keeps runs independent without flushing the database
  let config = config.key_prefix(format!("stepq-test-{}", Uuid::new_v4()));
  let queue = Queue::new(Arc::new(store), config).ok()?.with_clock(clock.clone());
  Some((queue, clock))
}

fn item(fn_id: Uuid) -> QueueItem {
  let ident = Identifier {
    workflow_id: fn_id,
    workflow_version: 1,
    run_id: Ulid::from_parts(1_700_000_000_000, 11),
    account_id: Uuid::new_v4(),
    workspace_id: Uuid::new_v4(),
    event_id: None,
    key: None,
  };
  QueueItem::new(fn_id, Item::new(Kind::Edge, ident))
}

#[tokio::test]
async fn test_redis_item_lifecycle() -> TestResult {
  let Some((q, clock)) = setup(QueueConfig::default()).await else {
    return Ok(());
  };
  let fn_id = Uuid::new_v4();
  let queued = q.enqueue(item(fn_id).with_id("a"), clock.now()).await?;
  assert!(matches!(
    q.enqueue(item(fn_id).with_id("a"), clock.now()).await,
    Err(Error::ItemAlreadyExists)
  ));

  let peeked = q.peek(&queued.queue(), clock.now(), 10).await?;
  assert_eq!(peeked.len(), 1);
  assert_eq!(peeked[0].id, queued.id);

  let lease = q.lease(&queued, QUEUE_LEASE_DURATION, None).await?;
  assert!(matches!(
    q.lease(&queued, QUEUE_LEASE_DURATION, None).await,
    Err(Error::ItemAlreadyLeased)
  ));
  let extended = q.extend_lease(&queued, lease, QUEUE_LEASE_DURATION).await?;
  assert!(matches!(
    q.extend_lease(&queued, lease, QUEUE_LEASE_DURATION).await,
    Err(Error::LeaseMismatch)
  ));
  assert_ne!(extended, lease);
  assert_eq!(q.running_count(fn_id).await?, 1);

  q.dequeue(&queued).await?;
  assert_eq!(q.status_count(fn_id, "queued").await?, 0);
  assert_eq!(q.status_count(fn_id, "in_progress").await?, 0);
  assert!(matches!(q.dequeue(&queued).await, Err(Error::ItemNotFound)));
  Ok(())
}

#[tokio::test]
async fn test_redis_concurrency_and_partition_gc() -> TestResult {
  let getter = |p: &QueuePartition| ConcurrencyLimits {
    function: if p.function_id().is_some() { 1 } else { -1 },
    account: -1,
    custom: -1,
  };
  let Some((q, clock)) = setup(QueueConfig::default().concurrency_limit_getter(getter)).await else {
    return Ok(());
  };
  let fn_id = Uuid::new_v4();
  let a = q.enqueue(item(fn_id).with_id("a"), clock.now()).await?;
  let b = q.enqueue(item(fn_id).with_id("b"), clock.now()).await?;

  let p = q
    .partition(&fn_id.to_string())
    .await?
    .ok_or("partition missing")?;
  let (_, capacity) = q.partition_lease(&p, PARTITION_LEASE_DURATION).await?;
  assert_eq!(capacity, 1);
  assert!(matches!(
    q.partition_lease(&p, PARTITION_LEASE_DURATION).await,
    Err(Error::PartitionAlreadyLeased)
  ));

  q.lease(&a, QUEUE_LEASE_DURATION, None).await?;
  assert!(matches!(
    q.lease(&b, QUEUE_LEASE_DURATION, None).await,
    Err(Error::PartitionConcurrencyLimit { .. })
  ));
  q.partition_requeue(&p, clock.now(), false).await?;

  q.dequeue(&a).await?;
  q.lease(&b, QUEUE_LEASE_DURATION, None).await?;
  q.dequeue(&b).await?;
  assert!(matches!(
    q.partition_requeue(&p, clock.now(), false).await,
    Err(Error::PartitionGarbageCollected)
  ));
  assert!(q.partition(&p.id).await?.is_none());
  Ok(())
}

#[tokio::test]
async fn test_redis_scavenge() -> TestResult {
  let Some((q, clock)) = setup(QueueConfig::default()).await else {
    return Ok(());
  };
  let fn_id = Uuid::new_v4();
  let queued = q.enqueue(item(fn_id), clock.now()).await?;
  q.lease(&queued, Duration::from_secs(1), None).await?;
  clock.advance(Duration::from_secs(2));

  let report = q.scavenge().await?;
  assert_eq!(report.recovered, 1);
  assert_eq!(q.peek(&queued.queue(), clock.now(), 10).await?.len(), 1);
  Ok(())
}

#[tokio::test]
async fn test_redis_config_lease() -> TestResult {
  let Some((q, clock)) = setup(QueueConfig::default()).await else {
    return Ok(());
  };
  let key = q.keys().scavenger();
  let held = q.config_lease(&key, CONFIG_LEASE_DURATION, None).await?;
  assert!(matches!(
    q.config_lease(&key, CONFIG_LEASE_DURATION, None).await,
    Err(Error::ConfigAlreadyLeased)
  ));
  let renewed = q.config_lease(&key, CONFIG_LEASE_DURATION, Some(held)).await?;
  assert!(renewed.expires_at_ms() > clock.now_ms());
  assert!(matches!(
    q.config_lease(&key, CONFIG_LEASE_MAX + Duration::from_secs(1), Some(renewed)).await,
    Err(Error::ConfigLeaseExceedsLimits { .. })
  ));
  Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_concurrent_leases() -> TestResult {
  let getter = |p: &QueuePartition| ConcurrencyLimits {
    function: if p.function_id().is_some() { 2 } else { -1 },
    account: -1,
    custom: -1,
  };
  let Some((q, clock)) = setup(QueueConfig::default().concurrency_limit_getter(getter)).await else {
    return Ok(());
  };
  let q = Arc::new(q);
  let fn_id = Uuid::new_v4();

  // every task races for the same item
  let single = q.enqueue(item(Uuid::new_v4()), clock.now()).await?;
  let attempts = (0..8).map(|_| {
    let q = q.clone();
    let single = single.clone();
    tokio::spawn(async move { q.lease(&single, QUEUE_LEASE_DURATION, None).await })
  });
  let mut granted = 0;
  for result in futures::future::join_all(attempts).await {
    match result? {
      Ok(_) => granted += 1,
      Err(Error::ItemAlreadyLeased) => {}
      Err(e) => return Err(e.into()),
    }
  }
  assert_eq!(granted, 1);

  // distinct items race for two function slots
  let mut items = Vec::new();
  for i in 0..10 {
    items.push(q.enqueue(item(fn_id).with_id(format!("s{i}")), clock.now()).await?);
  }
  let attempts = items.into_iter().map(|queued| {
    let q = q.clone();
    tokio::spawn(async move { q.lease(&queued, QUEUE_LEASE_DURATION, None).await })
  });
  let mut granted = 0;
  let mut limited = 0;
  for result in futures::future::join_all(attempts).await {
    match result? {
      Ok(_) => granted += 1,
      Err(Error::PartitionConcurrencyLimit { .. }) => limited += 1,
      Err(e) => return Err(e.into()),
    }
  }
  assert_eq!((granted, limited), (2, 8));
  assert_eq!(q.running_count(fn_id).await?, 2);
  Ok(())
}

#[tokio::test]
async fn test_redis_system_partition_kept_while_leased() -> TestResult {
  let Some((q, clock)) = setup(QueueConfig::default()).await else {
    return Ok(());
  };
  let queued = q
    .enqueue(item(Uuid::new_v4()).with_queue_name("pauses"), clock.now())
    .await?;
  let p = q.partition("pauses").await?.ok_or("partition missing")?;
  q.partition_lease(&p, PARTITION_LEASE_DURATION).await?;
  q.lease(&queued, QUEUE_LEASE_DURATION, None).await?;

  q.partition_requeue(&p, clock.now(), false).await?;
  assert!(q.partition("pauses").await?.is_some());

  q.dequeue(&queued).await?;
  assert!(matches!(
    q.partition_requeue(&p, clock.now(), false).await,
    Err(Error::PartitionGarbageCollected)
  ));
  Ok(())
}
