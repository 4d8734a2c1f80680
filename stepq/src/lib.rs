//! # Stepq
//!
//! Partitioned, concurrency-aware durable work queue in Rust
//!
//! Stepq 是一个持久化的工作队列，用于在多个工作进程之间调度工作流的每一步。
//! Stepq is a durable work queue that schedules each step of a workflow run across many
//! worker processes.
//! 队列项按函数、自定义并发键或系统队列分区，所有状态转换都是存储端的原子操作。
//! Items are partitioned by function, custom concurrency key or system queue, and every
//! state transition is a single atomic operation on the store.
//!
//! ## 特性
//! ## Features
//!
//! - 基于租约的至少一次执行
//!   - At-least-once execution based on leases
//! - 函数、账户与自定义键三级并发上限
//!   - Function, account and custom key concurrency limits
//! - GCRA 限流
//!   - GCRA throttling
//! - 按优先级加权的随机分区扫描，以及可选的严格顺序扫描
//!   - Priority-weighted random partition scans, with an optional strict sequential scan
//! - 崩溃的工作者持有的队列项会被自动回收
//!   - Automatic recovery of items held by crashed workers
//! - 分片的保证容量
//!   - Guaranteed capacity for shards
//! - 根据历史可用数量自适应调整窥视大小
//!   - Adaptive peek sizes from recent available counts
//! - Redis（Lua 脚本）与内存两种存储后端
//!   - Redis (Lua scripts) and in-memory store backends
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use stepq::item::{Identifier, Item, Kind, QueueItem};
//! use stepq::queue::Queue;
//! use stepq::config::QueueConfig;
//! use stepq::rdb::RedisStore;
//! use stepq::redis::RedisConnectionConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 创建 Redis 存储
//!     // Create the Redis store
//!     let config = RedisConnectionConfig::single("redis://127.0.0.1:6379")?;
//!     let store = Arc::new(RedisStore::new(config).await?);
//!     let queue = Queue::new(store, QueueConfig::default())?;
//!
//!     // 入队
//!     // Enqueue
//!     let ident = Identifier {
//!         workflow_id: uuid::Uuid::new_v4(),
//!         workflow_version: 1,
//!         run_id: ulid::Ulid::new(),
//!         account_id: uuid::Uuid::new_v4(),
//!         workspace_id: uuid::Uuid::new_v4(),
//!         event_id: None,
//!         key: None,
//!     };
//!     let item = QueueItem::new(ident.workflow_id, Item::new(Kind::Start, ident));
//!     let item = queue.enqueue(item, queue.now()).await?;
//!
//!     // 租用并完成
//!     // Lease and complete
//!     queue.lease(&item, Duration::from_secs(20), None).await?;
//!     queue.dequeue(&item).await?;
//!     Ok(())
//! }
//! ```

pub mod base;
pub mod clock;
pub mod components;
pub mod config;
pub mod deny;
pub mod error;
pub mod ewma;
pub mod item;
pub mod lease;
pub mod memdb;
pub mod partition;
pub mod queue;
pub mod rdb;
pub mod redis;
pub mod sampling;

pub use base::QueueStore;
pub use error::{Error, Result};
pub use queue::Queue;
