//! 处理器模块
//! Processor module
//!
//! ## 概述 / Overview
//!
//! Processor 是执行队列项的核心组件：扫描循环按固定间隔窥视可用分区，租用分区后窥视
//! 并租用其中的队列项，再交给工作者执行。
//!
//! The Processor is the component that runs queue items: its scan loop peeks available
//! partitions on a fixed tick, leases each partition, then peeks and leases its items and
//! hands them to workers.
//!
//! ## 主要特性 / Key Features
//!
//! - **信号量并发控制**: 没有空闲工作者时不再租用新的队列项
//!   - **Semaphore-based concurrency**: no new items are leased without a free worker
//!
//! - **拒绝列表**: 同一轮扫描中跳过已知达到上限的并发键与限流键
//!   - **Deny list**: keys known to be at capacity are skipped for the rest of a pass
//!
//! - **租约续期**: 工作者在执行期间定期续租，租约丢失时取消执行
//!   - **Lease extension**: workers extend their lease while running and are cancelled
//!     once it is lost
//!
//! - **自动重试**: 失败的队列项按退避策略重新入队，直到达到最大尝试次数
//!   - **Automatic retry**: failed items are requeued with backoff until max attempts
//!
//! ## 使用示例 / Usage Example
//!
//! ```rust,no_run
//! use stepq::components::processor::{HandlerFunc, Processor, RunOutcome};
//! use stepq::config::{ProcessorConfig, QueueConfig};
//! use stepq::memdb::MemoryStore;
//! use stepq::queue::Queue;
//! use stepq::clock::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn example() -> stepq::error::Result<()> {
//! let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
//! let queue = Arc::new(Queue::new(store, QueueConfig::default())?);
//! let mut processor = Processor::new(queue, ProcessorConfig::default(), None)?;
//!
//! processor.start(Arc::new(HandlerFunc::new(|item: stepq::item::QueueItem| {
//!   println!("running {}", item.id);
//!   Ok(RunOutcome::Complete)
//! })));
//!
//! processor.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::base::constants::*;
use crate::clock::millis;
use crate::components::leaser::Leaser;
use crate::config::ProcessorConfig;
use crate::deny::LeaseDenies;
use crate::error::{Error, Result};
use crate::item::QueueItem;
use crate::lease::LeaseId;
use crate::partition::QueuePartition;
use crate::queue::Queue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 队列项执行结果
/// Outcome of running an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
  /// 完成并出队
  /// Done; the item is dequeued
  Complete,
  /// 在给定时间重新执行
  /// Run again at the given time
  Requeue(DateTime<Utc>),
}

/// 队列项处理器特性
/// Item handler trait
#[async_trait]
pub trait Handler: Send + Sync {
  /// 执行队列项
  /// Run an item
  async fn run(&self, item: QueueItem) -> Result<RunOutcome>;
}

/// 函数式处理器适配器
/// Functional handler adapter
pub struct HandlerFunc<F> {
  func: F,
}

impl<F> HandlerFunc<F>
where
  F: Fn(QueueItem) -> Result<RunOutcome> + Send + Sync,
{
  pub fn new(func: F) -> Self {
    Self { func }
  }
}

#[async_trait]
impl<F> Handler for HandlerFunc<F>
where
  F: Fn(QueueItem) -> Result<RunOutcome> + Send + Sync,
{
  async fn run(&self, item: QueueItem) -> Result<RunOutcome> {
    (self.func)(item)
  }
}

/// 正在执行的队列项及其取消令牌
/// Running items and their cancellation tokens
#[derive(Clone, Default)]
pub struct CancellationMap {
  items: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationMap {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn add(&self, item_id: String, token: CancellationToken) {
    self.lock().insert(item_id, token);
  }

  pub fn remove(&self, item_id: &str) {
    self.lock().remove(item_id);
  }

  /// 取消正在执行的队列项
  /// Cancel a running item
  pub fn cancel(&self, item_id: &str) -> bool {
    tracing::info!("canceling item {}", item_id);
    match self.lock().get(item_id) {
      Some(token) => {
        token.cancel();
        true
      }
      None => false,
    }
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
  at + chrono::Duration::milliseconds(millis(d))
}

/// 每轮处理的分区数量：按比例计算，至少 1 个
/// Partitions processed per pass: the configured share, at least one
fn partitions_to_process(found: usize, ratio: u8) -> usize {
  if found == 0 {
    return 0;
  }
  (found * ratio as usize).div_ceil(100).clamp(1, found)
}

/// 分区租约返回的容量是否已用完；负数表示不限
/// Whether the capacity granted by a partition lease is used up; negative means unlimited
fn at_capacity(capacity: i64, dispatched: usize) -> bool {
  capacity >= 0 && i64::try_from(dispatched).unwrap_or(i64::MAX) >= capacity
}

struct Inner {
  queue: Arc<Queue>,
  config: ProcessorConfig,
  leaser: Option<Arc<Leaser>>,
  sema: Arc<Semaphore>,
  cancellations: CancellationMap,
  active_workers: Arc<AtomicUsize>,
}

/// 处理器
/// Processor
pub struct Processor {
  inner: Arc<Inner>,
  running: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

impl Processor {
  /// 创建新的处理器
  /// Create a new processor
  pub fn new(queue: Arc<Queue>, config: ProcessorConfig, leaser: Option<Arc<Leaser>>) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      inner: Arc::new(Inner {
        queue,
        sema: Arc::new(Semaphore::new(config.num_workers)),
        config,
        leaser,
        cancellations: CancellationMap::new(),
        active_workers: Arc::new(AtomicUsize::new(0)),
      }),
      running: Arc::new(AtomicBool::new(false)),
      handle: None,
    })
  }

  pub fn cancellations(&self) -> CancellationMap {
    self.inner.cancellations.clone()
  }

  pub fn active_workers(&self) -> usize {
    self.inner.active_workers.load(Ordering::Relaxed)
  }

  /// 执行一轮扫描，返回交给工作者的队列项数量
  /// Run one scan pass, returning the number of items handed to workers
  pub async fn scan_once(&self, handler: Arc<dyn Handler>) -> Result<usize> {
    self.inner.scan(&handler).await
  }

  /// 等待所有工作者空闲
  /// Wait until every worker is idle
  pub async fn wait_idle(&self) {
    let n = self.inner.config.num_workers as u32;
    let _ = self.inner.sema.acquire_many(n).await;
  }

  /// 启动处理器
  /// Start the processor
  pub fn start<H>(&mut self, handler: Arc<H>)
  where
    H: Handler + 'static,
  {
    self.running.store(true, Ordering::SeqCst);
    let inner = Arc::clone(&self.inner);
    let running = Arc::clone(&self.running);
    let handler: Arc<dyn Handler> = handler;

    self.handle = Some(tokio::spawn(async move {
      while running.load(Ordering::SeqCst) {
        if let Err(e) = inner.scan(&handler).await {
          tracing::error!("Processor scan error: {}", e);
        }
        tokio::time::sleep(inner.config.poll_tick).await;
      }
      tracing::debug!("Processor loop exited");
    }));
  }

  /// 停止扫描（不等待工作者完成）
  /// Stop scanning without waiting for workers
  pub fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
  }

  /// 停止扫描并等待所有工作者完成
  /// Stop scanning and wait for every worker to finish
  pub async fn shutdown(&mut self) {
    self.stop();
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
    tracing::info!("Waiting for all workers to finish...");
    self.wait_idle().await;
    tracing::info!("All workers have finished");
  }
}

impl Inner {
  async fn scan(&self, handler: &Arc<dyn Handler>) -> Result<usize> {
    let now = self.queue.now();
    let until = after(now, PARTITION_LOOKAHEAD);
    let sequential = match &self.leaser {
      Some(leaser) => leaser.is_sequential().await,
      None => false,
    };

    let partitions = self.peek_partitions(sequential, until).await?;
    let n = partitions_to_process(partitions.len(), self.config.run_mode.partition_ratio);
    let denies = LeaseDenies::new();
    let mut dispatched = 0;
    for p in partitions.iter().take(n) {
      if self.sema.available_permits() == 0 {
        break;
      }
      match self.process_partition(p, &denies, handler).await {
        Ok(count) => dispatched += count,
        Err(e) => tracing::warn!("Failed to process partition {}: {}", p.id, e),
      }
    }
    Ok(dispatched)
  }

  /// 选择分区来源：持有的分片、两级账户扫描或全局索引
  /// Choose the partition source: the held shard, a two-level account scan or the global index
  async fn peek_partitions(&self, sequential: bool, until: DateTime<Utc>) -> Result<Vec<QueuePartition>> {
    let queue = &self.queue;
    if let Some(leaser) = &self.leaser {
      if let Some(shard) = leaser.shard().await {
        let index = queue.keys().shard_partition_index(&shard.name);
        return queue
          .partition_peek_from(&index, sequential, until, PARTITION_PEEK_MAX)
          .await;
      }
    }

    let ratio = self.config.run_mode.account_ratio as f64;
    if ratio > 0.0 && queue.ids().float64() * 100.0 < ratio {
      let accounts = queue.account_peek(sequential, until, ACCOUNT_PEEK_MAX).await?;
      let peeks = accounts.iter().map(|account| {
        let index = queue.keys().account_partition_index(account);
        async move {
          queue
            .partition_peek_from(&index, sequential, until, PARTITION_SELECTION_MAX)
            .await
        }
      });
      let mut partitions = Vec::new();
      for result in futures::future::join_all(peeks).await {
        partitions.extend(result?);
      }
      return Ok(partitions);
    }

    queue.partition_peek(sequential, until, PARTITION_PEEK_MAX).await
  }

  async fn process_partition(
    &self,
    p: &QueuePartition,
    denies: &LeaseDenies,
    handler: &Arc<dyn Handler>,
  ) -> Result<usize> {
    let queue = &self.queue;
    let capacity = match queue.partition_lease(p, PARTITION_LEASE_DURATION).await {
      Ok((_, capacity)) => capacity,
      Err(e @ Error::PartitionConcurrencyLimit { .. }) => {
        tracing::debug!("Partition {} is at capacity: {}", p.id, e);
        return Ok(0);
      }
      Err(Error::PartitionNotFound | Error::PartitionAlreadyLeased | Error::PartitionPaused) => {
        return Ok(0);
      }
      Err(e) => return Err(e),
    };

    let now = queue.now();
    let limit = queue.peek_size(p).await;
    let items = queue
      .peek(p.queue(), after(now, PARTITION_LOOKAHEAD), limit)
      .await?;
    if let Err(e) = queue.set_peek_ewma(p.function_id(), items.len() as i64).await {
      tracing::warn!("Failed to record peek size of {}: {}", p.id, e);
    }

    let mut dispatched: usize = 0;
    let mut limited = false;
    for item in items {
      if at_capacity(capacity, dispatched) {
        break;
      }
      let Ok(permit) = self.sema.clone().try_acquire_owned() else {
        break;
      };
      match queue
        .lease(&item, self.config.lease_duration, Some(denies))
        .await
      {
        Ok(lease) => {
          self.spawn_worker(item, lease, permit, Arc::clone(handler));
          dispatched += 1;
        }
        Err(e) if e.is_capacity() => {
          denies.record(&e);
          if matches!(
            e,
            Error::PartitionConcurrencyLimit { .. } | Error::AccountConcurrencyLimit { .. }
          ) {
            limited = true;
            break;
          }
        }
        Err(Error::ItemAlreadyLeased | Error::ItemNotFound) => {}
        Err(e) => tracing::warn!("Failed to lease item {}: {}", item.id, e),
      }
    }

    let requeued = if limited {
      queue
        .partition_requeue(p, after(now, PARTITION_CONCURRENCY_LIMIT_REQUEUE_EXTENSION), true)
        .await
    } else {
      queue
        .partition_requeue(p, after(now, PARTITION_REQUEUE_EXTENSION), false)
        .await
    };
    match requeued {
      Ok(()) | Err(Error::PartitionGarbageCollected) => Ok(dispatched),
      Err(e) => Err(e),
    }
  }

  fn spawn_worker(
    &self,
    mut item: QueueItem,
    lease: LeaseId,
    permit: OwnedSemaphorePermit,
    handler: Arc<dyn Handler>,
  ) {
    let queue = Arc::clone(&self.queue);
    let cancellations = self.cancellations.clone();
    let active_workers = Arc::clone(&self.active_workers);
    let backoff = Arc::clone(&self.config.backoff);
    let lease_duration = self.config.lease_duration;
    item.lease_id = Some(lease);

    tokio::spawn(async move {
      let _permit = permit;
      active_workers.fetch_add(1, Ordering::Relaxed);

      let token = CancellationToken::new();
      cancellations.add(item.id.clone(), token.clone());
      let result = tokio::select! {
        result = handler.run(item.clone()) => Some(result),
        lost = keep_alive(&queue, &item, lease, lease_duration) => {
          tracing::warn!("Lease of item {} lost: {}", item.id, lost);
          None
        }
        _ = token.cancelled() => {
          tracing::info!("Item {} was cancelled", item.id);
          None
        }
      };
      cancellations.remove(&item.id);

      let finalized = match result {
        None => Ok(()),
        Some(Ok(RunOutcome::Complete)) => queue.dequeue(&item).await,
        Some(Ok(RunOutcome::Requeue(at))) => queue.requeue(&item, at).await,
        Some(Err(e)) => {
          let attempt = item.data.attempt;
          if attempt + 1 < item.data.max_attempts() {
            tracing::warn!("Item {} failed on attempt {}: {}", item.id, attempt, e);
            let at = after(queue.now(), backoff(attempt));
            let mut retry = item.clone();
            retry.data.attempt += 1;
            queue.requeue(&retry, at).await
          } else {
            tracing::error!("Item {} exhausted its attempts: {}", item.id, e);
            queue.dequeue(&item).await
          }
        }
      };
      if let Err(e) = finalized {
        tracing::error!("Failed to finalize item {}: {}", item.id, e);
      }

      active_workers.fetch_sub(1, Ordering::Relaxed);
    });
  }
}

/// 每半个租约时长续租一次，只在租约丢失时返回
/// Extend the lease every half lease duration; returns only once the lease is lost
async fn keep_alive(queue: &Queue, item: &QueueItem, mut lease: LeaseId, duration: Duration) -> Error {
  let mut interval = tokio::time::interval(duration / 2);
  interval.tick().await;
  loop {
    interval.tick().await;
    match queue.extend_lease(item, lease, duration).await {
      Ok(renewed) => lease = renewed,
      Err(e @ (Error::ItemNotFound | Error::ItemNotLeased | Error::LeaseMismatch)) => return e,
      Err(e) => tracing::warn!("Failed to extend lease of item {}: {}", item.id, e),
    }
  }
}
