//! Processor scan and worker behaviour over the in-memory store

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepq::clock::{Clock, ManualClock};
use stepq::components::processor::{Handler, HandlerFunc, Processor, RunOutcome};
use stepq::config::{ConcurrencyLimits, ProcessorConfig, QueueConfig};
use stepq::error::{Error, Result};
use stepq::item::{Identifier, Item, Kind, QueueItem};
use stepq::lease::IdGenerator;
use stepq::memdb::MemoryStore;
use stepq::partition::QueuePartition;
use stepq::queue::Queue;
use tokio::sync::Semaphore;
use ulid::Ulid;
use uuid::Uuid;

fn setup(config: QueueConfig) -> (Arc<Queue>, Arc<ManualClock>) {
  let clock = Arc::new(ManualClock::starting_now());
  let store = Arc::new(MemoryStore::new(clock.clone()));
  let queue = Queue::new(store, config)
    .unwrap()
    .with_clock(clock.clone())
    .with_id_generator(IdGenerator::seeded(7));
  (Arc::new(queue), clock)
}

fn identifier(fn_id: Uuid) -> Identifier {
  Identifier {
    workflow_id: fn_id,
    workflow_version: 1,
    run_id: Ulid::from_parts(1_700_000_000_000, 3),
    account_id: Uuid::new_v4(),
    workspace_id: Uuid::new_v4(),
    event_id: None,
    key: None,
  }
}

async fn enqueue_n(queue: &Queue, fn_id: Uuid, n: usize) -> Vec<QueueItem> {
  let ident = identifier(fn_id);
  let mut items = Vec::new();
  for i in 0..n {
    let item = QueueItem::new(fn_id, Item::new(Kind::Edge, ident.clone())).with_id(format!("step-{i}"));
    items.push(queue.enqueue(item, queue.now()).await.unwrap());
  }
  items
}

fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn Handler> {
  Arc::new(HandlerFunc::new(move |_item: QueueItem| {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(RunOutcome::Complete)
  }))
}

#[tokio::test]
async fn test_scan_runs_and_dequeues_items() {
  let (queue, _clock) = setup(QueueConfig::default());
  let fn_id = Uuid::new_v4();
  enqueue_n(&queue, fn_id, 3).await;

  let processor = Processor::new(queue.clone(), ProcessorConfig::default(), None).unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  let dispatched = processor.scan_once(counting(counter.clone())).await.unwrap();
  processor.wait_idle().await;

  assert_eq!(dispatched, 3);
  assert_eq!(counter.load(Ordering::SeqCst), 3);
  assert_eq!(queue.status_count(fn_id, "queued").await.unwrap(), 0);
  assert_eq!(queue.status_count(fn_id, "in_progress").await.unwrap(), 0);
  assert_eq!(processor.active_workers(), 0);
  assert!(processor.cancellations().is_empty());
}

#[tokio::test]
async fn test_failed_items_retry_until_max_attempts() {
  let (queue, _clock) = setup(QueueConfig::default());
  let fn_id = Uuid::new_v4();
  let mut item = QueueItem::new(fn_id, Item::new(Kind::Edge, identifier(fn_id)));
  item.data.max_attempts = Some(2);
  queue.enqueue(item, queue.now()).await.unwrap();

  let config = ProcessorConfig::default().backoff(|_| Duration::ZERO);
  let processor = Processor::new(queue.clone(), config, None).unwrap();
  let calls = Arc::new(AtomicUsize::new(0));
  let handler: Arc<dyn Handler> = {
    let calls = calls.clone();
    Arc::new(HandlerFunc::new(move |item: QueueItem| {
      assert_eq!(item.data.attempt as usize, calls.fetch_add(1, Ordering::SeqCst));
      Err(Error::other("boom"))
    }))
  };

  assert_eq!(processor.scan_once(handler.clone()).await.unwrap(), 1);
  processor.wait_idle().await;
  assert_eq!(queue.status_count(fn_id, "queued").await.unwrap(), 1);

  assert_eq!(processor.scan_once(handler.clone()).await.unwrap(), 1);
  processor.wait_idle().await;
  assert_eq!(calls.load(Ordering::SeqCst), 2);
  assert_eq!(queue.status_count(fn_id, "queued").await.unwrap(), 0);
  assert_eq!(queue.status_count(fn_id, "in_progress").await.unwrap(), 0);
}

#[tokio::test]
async fn test_requeue_outcome_reschedules_item() {
  let (queue, clock) = setup(QueueConfig::default());
  let fn_id = Uuid::new_v4();
  let items = enqueue_n(&queue, fn_id, 1).await;

  let later = clock.now() + chrono::Duration::seconds(60);
  let processor = Processor::new(queue.clone(), ProcessorConfig::default(), None).unwrap();
  let handler = Arc::new(HandlerFunc::new(move |_item: QueueItem| Ok(RunOutcome::Requeue(later))));
  assert_eq!(processor.scan_once(handler).await.unwrap(), 1);
  processor.wait_idle().await;

  let queue_name = items[0].queue();
  assert!(queue.peek(&queue_name, clock.now(), 10).await.unwrap().is_empty());
  let peeked = queue.peek(&queue_name, later, 10).await.unwrap();
  assert_eq!(peeked.len(), 1);
  assert_eq!(peeked[0].at_ms, later.timestamp_millis());
}

/// 阻塞直到测试放行
/// Blocks until the test releases it
struct Gated {
  gate: Arc<Semaphore>,
  done: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Gated {
  async fn run(&self, _item: QueueItem) -> Result<RunOutcome> {
    let _permit = self.gate.acquire().await.map_err(|e| Error::other(e.to_string()))?;
    self.done.fetch_add(1, Ordering::SeqCst);
    Ok(RunOutcome::Complete)
  }
}

#[tokio::test]
async fn test_scan_respects_function_concurrency() {
  let getter = |p: &QueuePartition| ConcurrencyLimits {
    function: if p.function_id().is_some() { 1 } else { -1 },
    account: -1,
    custom: -1,
  };
  let (queue, _clock) = setup(QueueConfig::default().concurrency_limit_getter(getter));
  let fn_id = Uuid::new_v4();
  enqueue_n(&queue, fn_id, 3).await;

  let processor = Processor::new(queue.clone(), ProcessorConfig::default(), None).unwrap();
  let gate = Arc::new(Semaphore::new(0));
  let done = Arc::new(AtomicUsize::new(0));
  let handler: Arc<dyn Handler> = Arc::new(Gated {
    gate: gate.clone(),
    done: done.clone(),
  });

  assert_eq!(processor.scan_once(handler.clone()).await.unwrap(), 1);
  assert_eq!(queue.in_progress("p", &fn_id.to_string()).await.unwrap(), 1);
  // the partition is still at capacity while the first item runs
  assert_eq!(processor.scan_once(handler.clone()).await.unwrap(), 0);

  gate.add_permits(10);
  processor.wait_idle().await;
  assert_eq!(done.load(Ordering::SeqCst), 1);
  assert_eq!(queue.status_count(fn_id, "queued").await.unwrap(), 2);
}

#[tokio::test]
async fn test_running_items_can_be_cancelled() {
  let (queue, _clock) = setup(QueueConfig::default());
  let fn_id = Uuid::new_v4();
  let items = enqueue_n(&queue, fn_id, 1).await;

  let processor = Processor::new(queue.clone(), ProcessorConfig::default(), None).unwrap();
  let gate = Arc::new(Semaphore::new(0));
  let done = Arc::new(AtomicUsize::new(0));
  let handler: Arc<dyn Handler> = Arc::new(Gated {
    gate: gate.clone(),
    done: done.clone(),
  });
  assert_eq!(processor.scan_once(handler).await.unwrap(), 1);

  let cancellations = processor.cancellations();
  for _ in 0..100 {
    if cancellations.cancel(&items[0].id) {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  processor.wait_idle().await;

  // a cancelled item keeps its lease until it expires and the scavenger picks it up
  assert_eq!(done.load(Ordering::SeqCst), 0);
  assert_eq!(queue.status_count(fn_id, "in_progress").await.unwrap(), 1);
}

#[tokio::test]
async fn test_start_and_shutdown() {
  let (queue, _clock) = setup(QueueConfig::default());
  let fn_id = Uuid::new_v4();
  enqueue_n(&queue, fn_id, 2).await;

  let config = ProcessorConfig::default().poll_tick(Duration::from_millis(5));
  let mut processor = Processor::new(queue.clone(), config, None).unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  let handler = {
    let counter = counter.clone();
    Arc::new(HandlerFunc::new(move |_item: QueueItem| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(RunOutcome::Complete)
    }))
  };
  processor.start(handler);

  for _ in 0..200 {
    if counter.load(Ordering::SeqCst) == 2 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  processor.shutdown().await;

  assert_eq!(counter.load(Ordering::SeqCst), 2);
  assert_eq!(queue.status_count(fn_id, "queued").await.unwrap(), 0);
  assert_eq!(queue.status_count(fn_id, "in_progress").await.unwrap(), 0);
}
