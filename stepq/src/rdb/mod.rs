//! Redis 存储后端模块
//! Redis storage backend module

pub mod redis_scripts;
pub mod redis_store;

pub use redis_store::RedisStore;
