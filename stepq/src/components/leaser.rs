//! 租约管理模块
//! Leaser module
//!
//! 定期竞争并续期三类租约：顺序扫描租约、回收器租约，以及分片的保证容量槽位。
//! 持有顺序扫描租约的进程按严格时间顺序扫描分区；持有回收器租约的进程负责回收；
//! 持有分片槽位的进程优先扫描该分片的分区。
//! Periodically claims and renews three kinds of leases: the sequential scan lease, the
//! scavenger lease and guaranteed-capacity shard slots. The holder of the sequential lease
//! scans partitions in strict time order; the holder of the scavenger lease runs the
//! scavenger; a process holding a shard slot scans that shard's partitions first.

use crate::base::constants::CONFIG_LEASE_DURATION;
use crate::components::ComponentLifecycle;
use crate::config::RunMode;
use crate::error::Error;
use crate::lease::LeaseId;
use crate::partition::QueueShard;
use crate::queue::Queue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// 租约管理器
/// Leaser
pub struct Leaser {
  queue: Arc<Queue>,
  mode: RunMode,
  sequential: RwLock<Option<LeaseId>>,
  scavenger: RwLock<Option<LeaseId>>,
  shard: RwLock<Option<(QueueShard, LeaseId)>>,
  done: Arc<AtomicBool>,
}

impl Leaser {
  pub fn new(queue: Arc<Queue>, mode: RunMode) -> Self {
    Self {
      queue,
      mode,
      sequential: RwLock::new(None),
      scavenger: RwLock::new(None),
      shard: RwLock::new(None),
      done: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn mode(&self) -> RunMode {
    self.mode
  }

  /// 续期间隔
  /// Renewal interval
  pub fn interval() -> Duration {
    CONFIG_LEASE_DURATION / 3
  }

  fn valid(&self, lease: Option<LeaseId>) -> bool {
    lease.is_some_and(|l| l.is_valid_at(self.queue.clock().now_ms()))
  }

  /// 是否持有顺序扫描租约
  /// Whether this process holds the sequential scan lease
  pub async fn is_sequential(&self) -> bool {
    self.valid(*self.sequential.read().await)
  }

  /// 是否持有回收器租约
  /// Whether this process holds the scavenger lease
  pub async fn is_scavenger(&self) -> bool {
    self.valid(*self.scavenger.read().await)
  }

  /// 当前持有的分片
  /// The shard this process currently holds a slot of
  pub async fn shard(&self) -> Option<QueueShard> {
    let held = self.shard.read().await;
    match held.as_ref() {
      Some((shard, lease)) if self.valid(Some(*lease)) => Some(shard.clone()),
      _ => None,
    }
  }

  /// 执行一轮竞争与续期
  /// Run one round of claims and renewals
  pub async fn tick(&self) {
    if self.mode.sequential {
      let key = self.queue.keys().sequential();
      self.claim_config(&key, &self.sequential).await;
    }
    if self.mode.scavenger {
      let key = self.queue.keys().scavenger();
      self.claim_config(&key, &self.scavenger).await;
    }
    if self.mode.shards {
      self.claim_shard().await;
    }
  }

  async fn claim_config(&self, key: &str, slot: &RwLock<Option<LeaseId>>) {
    let mut held = slot.write().await;
    match self
      .queue
      .config_lease(key, CONFIG_LEASE_DURATION, *held)
      .await
    {
      Ok(lease) => {
        if held.is_none() {
          tracing::info!("Leaser: acquired config lease {}", key);
        }
        *held = Some(lease);
      }
      Err(Error::ConfigAlreadyLeased) => {
        if held.take().is_some() {
          tracing::info!("Leaser: lost config lease {}", key);
        }
      }
      Err(e) => {
        tracing::warn!("Leaser: failed to claim config lease {}: {}", key, e);
        *held = None;
      }
    }
  }

  async fn claim_shard(&self) {
    let mut held = self.shard.write().await;
    if let Some((shard, lease)) = held.take() {
      match self
        .queue
        .renew_shard_lease(&shard, CONFIG_LEASE_DURATION, lease)
        .await
      {
        Ok(renewed) => *held = Some((shard, renewed)),
        Err(e) => tracing::info!("Leaser: dropped lease of shard {}: {}", shard.name, e),
      }
      return;
    }

    let shards = match self.queue.get_shards().await {
      Ok(shards) => shards,
      Err(e) => {
        tracing::warn!("Leaser: failed to load shards: {}", e);
        return;
      }
    };
    let now = self.queue.clock().now_ms();
    for shard in shards {
      let taken = shard.valid_leases(now);
      if taken >= shard.guaranteed_capacity as usize {
        continue;
      }
      match self
        .queue
        .lease_shard(&shard, CONFIG_LEASE_DURATION, taken as i64)
        .await
      {
        Ok(lease) => {
          tracing::info!("Leaser: leased slot {} of shard {}", taken, shard.name);
          *held = Some((shard, lease));
          return;
        }
        Err(e) => tracing::debug!("Leaser: shard {} slot {} unavailable: {}", shard.name, taken, e),
      }
    }
  }

  /// 启动租约管理器
  /// Start the leaser
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(Self::interval());
      loop {
        interval.tick().await;
        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("Leaser: shutting down");
          break;
        }
        self.tick().await;
      }
    })
  }

  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
  }

  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}

impl ComponentLifecycle for Leaser {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Leaser::start(self)
  }

  fn shutdown(&self) {
    Leaser::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Leaser::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::config::QueueConfig;
  use crate::lease::IdGenerator;
  use crate::memdb::MemoryStore;

  fn queue(clock: Arc<ManualClock>, seed: u64) -> Arc<Queue> {
    let store = Arc::new(MemoryStore::new(clock.clone()));
    Arc::new(
      Queue::new(store, QueueConfig::default())
        .unwrap()
        .with_clock(clock)
        .with_id_generator(IdGenerator::seeded(seed)),
    )
  }

  #[tokio::test]
  async fn test_only_one_sequential_holder() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let make = |seed| {
      Arc::new(
        Queue::new(store.clone(), QueueConfig::default())
          .unwrap()
          .with_clock(clock.clone())
          .with_id_generator(IdGenerator::seeded(seed)),
      )
    };
    let a = Leaser::new(make(1), RunMode::default());
    let b = Leaser::new(make(2), RunMode::default());

    a.tick().await;
    b.tick().await;
    assert!(a.is_sequential().await && a.is_scavenger().await);
    assert!(!b.is_sequential().await && !b.is_scavenger().await);

    // a keeps renewing while b keeps losing
    clock.advance(Leaser::interval());
    a.tick().await;
    b.tick().await;
    assert!(a.is_sequential().await);
    assert!(!b.is_sequential().await);

    // a stops renewing and the lease moves to b once it expires
    clock.advance(CONFIG_LEASE_DURATION);
    b.tick().await;
    assert!(b.is_sequential().await);
    assert!(!a.is_sequential().await);
  }

  #[tokio::test]
  async fn test_mode_disables_claims() {
    let clock = Arc::new(ManualClock::starting_now());
    let mode = RunMode {
      sequential: false,
      scavenger: false,
      ..RunMode::default()
    };
    let leaser = Leaser::new(queue(clock, 1), mode);
    leaser.tick().await;
    assert!(!leaser.is_sequential().await);
    assert!(!leaser.is_scavenger().await);
    assert!(leaser.shard().await.is_none());
  }

  #[tokio::test]
  async fn test_shutdown() {
    let clock = Arc::new(ManualClock::starting_now());
    let leaser = Arc::new(Leaser::new(queue(clock, 1), RunMode::default()));
    assert!(!leaser.is_done());
    leaser.shutdown();
    assert!(leaser.is_done());
    leaser.clone().start().await.unwrap();
  }
}
