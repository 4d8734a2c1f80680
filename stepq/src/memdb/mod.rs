//! 内存存储模块
//! Memory store module
//!
//! 基于内存的存储后端，不依赖任何外部服务，语义与 Redis 后端一致
//! In-memory storage backend without external service dependencies, with the same
//! semantics as the Redis backend

pub mod memory_store;
mod store;

pub use memory_store::MemoryStore;
