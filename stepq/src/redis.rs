//! Redis 配置和连接管理模块
//! Redis configuration and connection management module

use crate::error::Result;
use redis::{Cmd, ConnectionInfo, IntoConnectionInfo, Pipeline, RedisFuture, Value};

/// Redis 连接，可在多个任务间克隆共享
/// Redis connection; cheap to clone and share between tasks
#[derive(Clone)]
pub enum RedisConnection {
  Single(redis::aio::MultiplexedConnection),
  #[cfg(feature = "cluster")]
  Cluster(redis::cluster_async::ClusterConnection),
}

impl redis::aio::ConnectionLike for RedisConnection {
  fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
    match self {
      RedisConnection::Single(c) => c.req_packed_command(cmd),
      #[cfg(feature = "cluster")]
      RedisConnection::Cluster(c) => c.req_packed_command(cmd),
    }
  }

  fn req_packed_commands<'a>(
    &'a mut self,
    cmd: &'a Pipeline,
    offset: usize,
    count: usize,
  ) -> RedisFuture<'a, Vec<Value>> {
    match self {
      RedisConnection::Single(c) => c.req_packed_commands(cmd, offset, count),
      #[cfg(feature = "cluster")]
      RedisConnection::Cluster(c) => c.req_packed_commands(cmd, offset, count),
    }
  }

  /// 集群模式不支持选择数据库，总是返回 0
  /// Always 0; database selection is not supported in cluster mode
  fn get_db(&self) -> i64 {
    0
  }
}

/// Redis 连接配置
/// Redis connection configuration
#[derive(Debug, Clone)]
pub enum RedisConnectionConfig {
  /// 单机连接
  /// Standalone connection
  Single(ConnectionInfo),
  #[cfg(feature = "cluster")]
  /// 集群连接
  /// Cluster connection
  Cluster(Vec<ConnectionInfo>),
}

impl RedisConnectionConfig {
  /// 创建单机连接
  /// Create a standalone connection
  pub fn single<T: IntoConnectionInfo>(connection_info: T) -> Result<Self> {
    Ok(Self::Single(connection_info.into_connection_info()?))
  }

  #[cfg(feature = "cluster")]
  /// 创建集群连接
  /// Create a cluster connection
  pub fn cluster<T: IntoConnectionInfo>(nodes: Vec<T>) -> Result<Self> {
    let nodes = nodes
      .into_iter()
      .map(|x| x.into_connection_info())
      .filter_map(|x| x.ok())
      .collect::<Vec<_>>();
    if nodes.is_empty() {
      return Err(crate::error::Error::other(
        "At least one valid node is required for cluster connection",
      ));
    }
    Ok(Self::Cluster(nodes))
  }

  /// 建立异步连接
  /// Open an async connection
  pub async fn connect(&self) -> Result<RedisConnection> {
    match self {
      RedisConnectionConfig::Single(info) => {
        let client = redis::Client::open(info.clone())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisConnection::Single(conn))
      }
      #[cfg(feature = "cluster")]
      RedisConnectionConfig::Cluster(nodes) => {
        let client = redis::cluster::ClusterClient::new(nodes.clone())?;
        let conn = client.get_async_connection().await?;
        Ok(RedisConnection::Cluster(conn))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_config_parses_url() {
    let config = RedisConnectionConfig::single("redis://127.0.0.1:6379/2");
    assert!(matches!(config, Ok(RedisConnectionConfig::Single(_))));
    assert!(RedisConnectionConfig::single("not a url").is_err());
  }
}
