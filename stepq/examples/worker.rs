//! Worker 使用示例
//! Worker usage example
//!
//! 演示如何组合 Leaser、Scavenger 与 Processor 运行一个完整的工作进程
//! Demonstrates how Leaser, Scavenger and Processor combine into a complete worker process

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use stepq::components::leaser::Leaser;
use stepq::components::processor::{Handler, Processor, RunOutcome};
use stepq::components::scavenger::{Scavenger, ScavengerConfig};
use stepq::config::{ProcessorConfig, QueueConfig};
use stepq::error::{Error, Result};
use stepq::item::{Identifier, Item, Kind, QueueItem};
use stepq::queue::Queue;
use stepq::rdb::RedisStore;
use stepq::redis::RedisConnectionConfig;

#[derive(Serialize, Deserialize, Debug)]
struct StepPayload {
  step: String,
  delay_ms: u64,
}

/// 步骤处理器
/// Step handler
struct StepRunner;

#[async_trait]
impl Handler for StepRunner {
  async fn run(&self, item: QueueItem) -> Result<RunOutcome> {
    let payload: StepPayload = serde_json::from_value(item.data.payload.clone())?;
    println!(
      "📨 Running step {} of run {} (attempt {})",
      payload.step, item.data.identifier.run_id, item.data.attempt
    );

    match payload.step.as_str() {
      "sleep" if item.data.attempt == 0 => {
        // 第一次执行时推迟，演示重新调度
        // Push the first run back to show rescheduling
        let at = chrono::Utc::now() + chrono::Duration::milliseconds(payload.delay_ms as i64);
        println!("⏰ Rescheduling {} to {}", item.id, at);
        Ok(RunOutcome::Requeue(at))
      }
      "fail" => Err(Error::other("step always fails")),
      _ => {
        tokio::time::sleep(Duration::from_millis(payload.delay_ms)).await;
        println!("✅ Step {} finished", payload.step);
        Ok(RunOutcome::Complete)
      }
    }
  }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt::init();

  // 创建 Redis 存储
  // Create the Redis store
  let redis_url =
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
  println!("🔗 Using Redis URL: {redis_url}");
  let store = Arc::new(RedisStore::new(RedisConnectionConfig::single(redis_url)?).await?);
  let queue = Arc::new(Queue::new(store, QueueConfig::default().key_prefix("demo"))?);

  // 入队几个步骤
  // Enqueue a few steps
  let ident = Identifier {
    workflow_id: uuid::Uuid::new_v4(),
    workflow_version: 1,
    run_id: ulid::Ulid::new(),
    account_id: uuid::Uuid::new_v4(),
    workspace_id: uuid::Uuid::new_v4(),
    event_id: None,
    key: None,
  };
  for (i, step) in ["fetch", "sleep", "fail", "notify"].into_iter().enumerate() {
    let mut data = Item::new(Kind::Edge, ident.clone());
    data.max_attempts = Some(2);
    data.payload = serde_json::to_value(StepPayload {
      step: step.to_string(),
      delay_ms: 200,
    })?;
    let item = QueueItem::new(ident.workflow_id, data).with_id(format!("{}-{i}", ident.run_id));
    let item = queue.enqueue(item, queue.now()).await?;
    println!("📥 Enqueued {step} as {}", item.id);
  }

  // 启动后台组件
  // Start the background components
  let config = ProcessorConfig::new()
    .num_workers(4)
    .poll_tick(Duration::from_millis(100));
  let leaser = Arc::new(Leaser::new(queue.clone(), config.run_mode));
  let scavenger = Arc::new(Scavenger::new(
    queue.clone(),
    Some(leaser.clone()),
    ScavengerConfig {
      interval: config.scavenge_interval,
    },
  )?);
  let leaser_handle = leaser.clone().start();
  let scavenger_handle = scavenger.clone().start();

  let mut processor = Processor::new(queue.clone(), config, Some(leaser.clone()))?;
  processor.start(Arc::new(StepRunner));

  println!("🔄 Worker is running, press Ctrl+C to shut down");
  tokio::signal::ctrl_c().await?;

  processor.shutdown().await;
  leaser.shutdown();
  scavenger.shutdown();
  let _ = tokio::join!(leaser_handle, scavenger_handle);
  println!("👋 Worker shutdown complete");
  Ok(())
}
