//! 回收器模块
//! Scavenger module
//!
//! 定期将租约已过期的队列项重新入队。启用选举时只有持有回收器租约的进程执行回收。
//! Periodically requeues items whose lease has expired. With election enabled, only the
//! process holding the scavenger lease scavenges.

use crate::base::constants::DEFAULT_SCAVENGE_INTERVAL;
use crate::components::leaser::Leaser;
use crate::components::ComponentLifecycle;
use crate::error::{Error, Result};
use crate::queue::{Queue, ScavengeReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 回收器配置
/// Scavenger configuration
#[derive(Debug, Clone)]
pub struct ScavengerConfig {
  /// 回收间隔
  /// Scavenge interval
  pub interval: Duration,
}

impl Default for ScavengerConfig {
  fn default() -> Self {
    Self {
      interval: DEFAULT_SCAVENGE_INTERVAL,
    }
  }
}

impl ScavengerConfig {
  pub fn validate(&self) -> Result<()> {
    if self.interval.is_zero() {
      return Err(Error::config("Scavenge interval must be positive"));
    }
    Ok(())
  }
}

/// 回收器
/// Scavenger
pub struct Scavenger {
  queue: Arc<Queue>,
  leaser: Option<Arc<Leaser>>,
  config: ScavengerConfig,
  done: Arc<AtomicBool>,
}

impl Scavenger {
  /// 创建新的回收器；`leaser` 为 None 或其运行模式未启用回收器选举时无条件回收
  /// Create a new scavenger; without a leaser, or when its run mode disables scavenger
  /// election, it scavenges unconditionally
  pub fn new(
    queue: Arc<Queue>,
    leaser: Option<Arc<Leaser>>,
    config: ScavengerConfig,
  ) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      queue,
      leaser,
      config,
      done: Arc::new(AtomicBool::new(false)),
    })
  }

  async fn should_run(&self) -> bool {
    match &self.leaser {
      Some(leaser) if leaser.mode().scavenger => leaser.is_scavenger().await,
      _ => true,
    }
  }

  /// 执行一次回收；未持有回收器租约时返回空报告
  /// Run one scavenge pass; returns an empty report when the scavenger lease is not held
  pub async fn run_once(&self) -> Result<ScavengeReport> {
    if !self.should_run().await {
      return Ok(ScavengeReport::default());
    }
    self.queue.scavenge().await
  }

  /// 启动回收器
  /// Start the scavenger
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      loop {
        interval.tick().await;
        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("Scavenger: shutting down");
          break;
        }
        let report = match self.run_once().await {
          Ok(report) => report,
          Err(e) => {
            tracing::error!("Scavenger error: {}", e);
            continue;
          }
        };
        let recovered = report.recovered;
        if let Err(e) = report.into_result() {
          tracing::error!("Scavenger: requeued {} items with errors: {}", recovered, e);
        }
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

impl ComponentLifecycle for Scavenger {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Scavenger::start(self)
  }

  fn shutdown(&self) {
    Scavenger::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Scavenger::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::{Clock, ManualClock};
  use crate::config::{QueueConfig, RunMode};
  use crate::item::tests::identifier;
  use crate::item::{Item, Kind, QueueItem};
  use crate::lease::IdGenerator;
  use crate::memdb::MemoryStore;

  fn setup() -> (Arc<Queue>, Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let queue = Queue::new(store.clone(), QueueConfig::default())
      .unwrap()
      .with_clock(clock.clone())
      .with_id_generator(IdGenerator::seeded(9));
    (Arc::new(queue), store, clock)
  }

  async fn leased_item(queue: &Queue, clock: &ManualClock) -> QueueItem {
    let ident = identifier(1_600_000_000_000);
    let item = QueueItem::new(ident.workflow_id, Item::new(Kind::Edge, ident));
    let item = queue.enqueue(item, clock.now()).await.unwrap();
    queue.lease(&item, Duration::from_secs(1), None).await.unwrap();
    item
  }

  #[test]
  fn test_scavenger_config_default() {
    assert_eq!(ScavengerConfig::default().interval, Duration::from_secs(5));
    assert!(ScavengerConfig::default().validate().is_ok());
  }

  #[test]
  fn test_zero_interval_is_rejected() {
    let (queue, _, _) = setup();
    let config = ScavengerConfig {
      interval: Duration::ZERO,
    };
    assert!(matches!(config.validate(), Err(Error::Config { .. })));
    assert!(Scavenger::new(queue, None, config).is_err());
  }

  #[tokio::test]
  async fn test_requires_scavenger_lease() {
    let (queue, _, clock) = setup();
    leased_item(&queue, &clock).await;
    clock.advance(Duration::from_secs(2));

    let leaser = Arc::new(Leaser::new(queue.clone(), RunMode::default()));
    let scavenger =
      Scavenger::new(queue.clone(), Some(leaser.clone()), ScavengerConfig::default()).unwrap();
    assert_eq!(scavenger.run_once().await.unwrap().recovered, 0);

    leaser.tick().await;
    assert_eq!(scavenger.run_once().await.unwrap().recovered, 1);
    assert_eq!(scavenger.run_once().await.unwrap().recovered, 0);
  }

  #[tokio::test]
  async fn test_report_keeps_count_alongside_errors() {
    let (queue, store, clock) = setup();
    let item = leased_item(&queue, &clock).await;

    // an in-progress entry whose item record is gone
    let key = queue.keys().concurrency("p", &item.function_id.to_string());
    store.storage.write().await.zadd(&key, clock.now_ms() + 500, "missing");
    clock.advance(Duration::from_secs(2));

    let scavenger = Scavenger::new(queue.clone(), None, ScavengerConfig::default()).unwrap();
    let report = scavenger.run_once().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.into_result().is_err());
  }
}
