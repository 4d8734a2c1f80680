//! 后台组件模块
//! Background components module
//!
//! 每个工作进程运行的后台组件：扫描并执行队列项的处理器、回收过期租约的回收器，
//! 以及维护顺序扫描、回收器和分片租约的租约管理器。
//! Background components run by every worker process: the processor that scans and runs
//! items, the scavenger that recovers expired leases, and the leaser that holds the
//! sequential, scavenger and shard leases.

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod leaser;
pub mod processor;
pub mod scavenger;

/// 组件生命周期管理接口
/// Component lifecycle interface
///
/// # 实现者 / Implementors
///
/// - [`Leaser`](leaser::Leaser) - 竞争并续期配置租约与分片租约
/// - [`Scavenger`](scavenger::Scavenger) - 将租约过期的队列项重新入队
///
/// [`Processor`](processor::Processor) 没有实现此 trait，因为它需要一个 Handler 参数，
/// 并且 `shutdown()` 是异步的。
/// [`Processor`](processor::Processor) does not implement this trait: it needs a Handler
/// argument and its `shutdown()` is async.
pub trait ComponentLifecycle {
  /// 启动组件的后台任务
  /// Start the component's background task
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 发送关闭信号，组件会在完成当前一轮后停止
  /// Signal shutdown; the component stops after its current round
  fn shutdown(&self);

  fn is_done(&self) -> bool;
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct TestComponent {
    done: Arc<AtomicBool>,
  }

  impl ComponentLifecycle for TestComponent {
    fn start(self: Arc<Self>) -> JoinHandle<()> {
      tokio::spawn(async move {
        while !self.done.load(Ordering::Relaxed) {
          tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
      })
    }

    fn shutdown(&self) {
      self.done.store(true, Ordering::Relaxed);
    }

    fn is_done(&self) -> bool {
      self.done.load(Ordering::Relaxed)
    }
  }

  #[tokio::test]
  async fn test_lifecycle_trait() {
    let component = Arc::new(TestComponent {
      done: Arc::new(AtomicBool::new(false)),
    });
    assert!(!component.is_done());

    let handle = component.clone().start();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    component.shutdown();

    assert!(component.is_done());
    handle.await.unwrap();
  }
}
