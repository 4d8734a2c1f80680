//! Redis QueueStore trait 实现
//! Redis QueueStore trait implementation
//!
//! 所有键名共享同一个 `{prefix}` 哈希标签，集群模式下脚本访问的键都落在同一个槽位。
//! 可选的键在缺失时由同槽位的占位键替代，脚本根据参数决定是否使用它们。
//! Every key shares the same `{prefix}` hash tag so the keys a script touches live in one
//! cluster slot. Optional keys are replaced by a placeholder from the same slot when absent;
//! the scripts decide from their arguments whether to use them.

use crate::base::*;
use crate::error::Result;
use crate::rdb::redis_scripts::{RedisArg, ScriptManager};
use crate::redis::{RedisConnection, RedisConnectionConfig};
use async_trait::async_trait;
use redis::AsyncCommands;

/// Redis 存储后端
/// Redis storage backend
pub struct RedisStore {
  conn: RedisConnection,
  script_manager: ScriptManager,
}

impl RedisStore {
  /// 连接 Redis 并预加载脚本
  /// Connect to Redis and preload the scripts
  pub async fn new(config: RedisConnectionConfig) -> Result<Self> {
    let conn = config.connect().await?;
    Self::from_connection(conn).await
  }

  pub async fn from_connection(mut conn: RedisConnection) -> Result<Self> {
    let mut script_manager = ScriptManager::default();
    script_manager.load_scripts(&mut conn).await?;
    Ok(Self {
      conn,
      script_manager,
    })
  }

  fn conn(&self) -> RedisConnection {
    self.conn.clone()
  }

  async fn eval<T>(&self, name: &str, keys: &[String], args: &[RedisArg]) -> Result<T>
  where
    T: redis::FromRedisValue,
  {
    let mut conn = self.conn();
    self
      .script_manager
      .eval_script(&mut conn, name, keys, args)
      .await
  }
}

/// 空键名替换为占位键
/// Replace an empty key with a placeholder
fn key_or(key: &str, placeholder: &str) -> String {
  if key.is_empty() {
    placeholder.to_string()
  } else {
    key.to_string()
  }
}

fn shard_key(pointers: &PointerKeys) -> (String, &'static str) {
  match &pointers.shard_index {
    Some(k) => (k.clone(), "1"),
    None => (pointers.global_index.clone(), "0"),
  }
}

/// 进行中集合的 5 个键：并发索引、函数、账户、两个自定义键
/// The five in-progress keys: concurrency index, function, account and two custom keys
fn in_progress_keys(ip: &InProgressKeys) -> Vec<String> {
  let custom = |i: usize| {
    ip.custom
      .get(i)
      .cloned()
      .unwrap_or_else(|| ip.function.clone())
  };
  vec![
    ip.index.clone(),
    ip.function.clone(),
    ip.account.clone(),
    custom(0),
    custom(1),
  ]
}

fn partition_args(partitions: &[PartitionRef], global_account_index: &str) -> (Vec<String>, Vec<RedisArg>) {
  let mut keys = Vec::with_capacity(partitions.len() * 2);
  let mut args = Vec::with_capacity(partitions.len() * 3);
  for p in partitions {
    keys.push(p.zset.clone());
    keys.push(key_or(&p.account_index, global_account_index));
    args.push(RedisArg::from(&p.id));
    args.push(RedisArg::from(&p.record));
    args.push(RedisArg::from(&p.account_id));
  }
  (keys, args)
}

fn score_bound(score: i64) -> String {
  match score {
    SCORE_MIN => "-inf".to_string(),
    SCORE_MAX => "+inf".to_string(),
    s => s.to_string(),
  }
}

#[async_trait]
impl QueueStore for RedisStore {
  async fn enqueue(&self, req: &EnqueueRequest) -> Result<i64> {
    let ptr = &req.pointers;
    let (shard, has_shard) = shard_key(ptr);
    let (pkeys, pargs) = partition_args(&req.partitions, &ptr.global_account_index);
    let mut keys = vec![
      req.item_hash.clone(),
      req.idempotency_key.clone(),
      ptr.partition_hash.clone(),
      ptr.global_index.clone(),
      ptr.global_account_index.clone(),
      shard,
      req.shards_hash.clone(),
      key_or(&req.fn_metadata_key, &ptr.partition_hash),
    ];
    keys.extend(pkeys);
    keys.extend(req.indexes.iter().cloned());

    let (shard_name, shard_record) = req
      .shard
      .as_ref()
      .map(|s| (s.name.clone(), s.record.clone()))
      .unwrap_or_default();
    let mut args = vec![
      RedisArg::from(&req.item_id),
      RedisArg::from(&req.item),
      RedisArg::Int(req.score),
      RedisArg::Int(req.at_ms),
      RedisArg::Int(req.partition_time_ms),
      RedisArg::Int(req.now_ms),
      RedisArg::Int(req.partitions.len() as i64),
      RedisArg::from(has_shard),
      RedisArg::Str(shard_name),
      RedisArg::Str(shard_record),
      RedisArg::Str(req.fn_metadata.clone().unwrap_or_default()),
    ];
    args.extend(pargs);
    self.eval("enqueue", &keys, &args).await
  }

  async fn lease(&self, req: &LeaseRequest) -> Result<i64> {
    let ip = &req.in_progress;
    let mut keys = vec![req.item_hash.clone(), req.lease_hash.clone()];
    keys.extend(in_progress_keys(ip));
    let throttle = req.throttle.as_ref().filter(|t| t.limit > 0);
    keys.push(
      throttle
        .map(|t| t.key.clone())
        .unwrap_or_else(|| req.item_hash.clone()),
    );
    keys.extend(req.partition_sets.iter().cloned());

    let custom_limit = |i: usize| req.custom_limits.get(i).copied().unwrap_or(-1);
    let args = vec![
      RedisArg::from(&req.item_id),
      RedisArg::from(&req.lease_id),
      RedisArg::Int(req.now_ms),
      RedisArg::Int(req.expires_at_ms),
      RedisArg::Int(req.function_limit),
      RedisArg::Int(req.account_limit),
      RedisArg::Int(custom_limit(0)),
      RedisArg::Int(custom_limit(1)),
      RedisArg::Int(ip.custom.len().min(2) as i64),
      RedisArg::from(&ip.member),
      RedisArg::Int(throttle.map_or(0, |t| t.limit)),
      RedisArg::Int(throttle.map_or(0, |t| t.burst)),
      RedisArg::Int(throttle.map_or(0, |t| t.period_ms)),
    ];
    self.eval("lease", &keys, &args).await
  }

  async fn extend_lease(&self, req: &ExtendLeaseRequest) -> Result<i64> {
    let ip = &req.in_progress;
    let mut keys = vec![req.item_hash.clone(), req.lease_hash.clone()];
    keys.extend(in_progress_keys(ip));
    let args = vec![
      RedisArg::from(&req.item_id),
      RedisArg::from(&req.existing),
      RedisArg::from(&req.lease_id),
      RedisArg::Int(req.expires_at_ms),
      RedisArg::Int(ip.custom.len().min(2) as i64),
      RedisArg::from(&ip.member),
    ];
    self.eval("extend_lease", &keys, &args).await
  }

  async fn dequeue(&self, req: &DequeueRequest) -> Result<i64> {
    let ip = &req.in_progress;
    let mut keys = vec![
      req.item_hash.clone(),
      req.lease_hash.clone(),
      req.idempotency_key.clone(),
    ];
    keys.extend(in_progress_keys(ip));
    keys.extend(req.partition_sets.iter().cloned());
    keys.extend(req.indexes.iter().cloned());
    let args = vec![
      RedisArg::from(&req.item_id),
      RedisArg::Int(req.idempotency_ttl_secs),
      RedisArg::Int(ip.custom.len().min(2) as i64),
      RedisArg::from(&ip.member),
      RedisArg::Int(req.partition_sets.len() as i64),
    ];
    self.eval("dequeue", &keys, &args).await
  }

  async fn requeue(&self, req: &RequeueRequest) -> Result<i64> {
    let ip = &req.in_progress;
    let ptr = &req.pointers;
    let (shard, has_shard) = shard_key(ptr);
    let (pkeys, pargs) = partition_args(&req.partitions, &ptr.global_account_index);
    let mut keys = vec![req.item_hash.clone(), req.lease_hash.clone()];
    keys.extend(in_progress_keys(ip));
    keys.extend([
      ptr.partition_hash.clone(),
      ptr.global_index.clone(),
      ptr.global_account_index.clone(),
      shard,
    ]);
    keys.extend(pkeys);
    keys.extend(req.indexes.iter().cloned());

    let mut args = vec![
      RedisArg::from(&req.item_id),
      RedisArg::from(&req.item),
      RedisArg::Int(req.at_ms),
      RedisArg::Int(req.now_ms),
      RedisArg::Int(ip.custom.len().min(2) as i64),
      RedisArg::from(&ip.member),
      RedisArg::Int(req.partitions.len() as i64),
      RedisArg::from(has_shard),
    ];
    args.extend(pargs);
    self.eval("requeue", &keys, &args).await
  }

  async fn requeue_by_id(&self, req: &RequeueByIdRequest) -> Result<i64> {
    let ptr = &req.pointers;
    let (shard, has_shard) = shard_key(ptr);
    let keys = vec![
      req.item_hash.clone(),
      req.lease_hash.clone(),
      req.partition.zset.clone(),
      ptr.partition_hash.clone(),
      ptr.global_index.clone(),
      ptr.global_account_index.clone(),
      key_or(&req.partition.account_index, &ptr.global_account_index),
      shard,
    ];
    let args = vec![
      RedisArg::from(&req.item_id),
      RedisArg::from(&req.item),
      RedisArg::Int(req.at_ms),
      RedisArg::Int(req.now_ms),
      RedisArg::from(&req.partition.id),
      RedisArg::from(&req.partition.account_id),
      RedisArg::from(has_shard),
    ];
    self.eval("requeue_by_id", &keys, &args).await
  }

  async fn partition_lease(&self, req: &PartitionLeaseRequest) -> Result<(i64, i64)> {
    let ptr = &req.pointers;
    let (shard, has_shard) = shard_key(ptr);
    let placeholder = &ptr.global_index;
    let keys = vec![
      ptr.partition_hash.clone(),
      ptr.global_index.clone(),
      ptr.global_account_index.clone(),
      key_or(&req.account_index, &ptr.global_account_index),
      shard,
      req
        .fn_metadata_key
        .clone()
        .unwrap_or_else(|| placeholder.clone()),
      key_or(&req.function_in_progress, placeholder),
      key_or(&req.account_in_progress, placeholder),
      key_or(&req.custom_in_progress, placeholder),
    ];
    let args = vec![
      RedisArg::from(&req.partition_id),
      RedisArg::from(&req.lease_id),
      RedisArg::Int(req.now_ms),
      RedisArg::Int(req.expires_at_ms),
      RedisArg::Int(req.function_limit),
      RedisArg::Int(req.account_limit),
      RedisArg::Int(req.custom_limit),
      RedisArg::from(&req.account_id),
      RedisArg::from(has_shard),
      RedisArg::Int(req.force_at_ms),
      RedisArg::from(if req.fn_metadata_key.is_some() { "1" } else { "0" }),
    ];
    let (code, capacity): (i64, i64) = self.eval("partition_lease", &keys, &args).await?;
    Ok((code, capacity))
  }

  async fn partition_requeue(&self, req: &PartitionRequeueRequest) -> Result<i64> {
    let ptr = &req.pointers;
    let (shard, has_shard) = shard_key(ptr);
    let keys = vec![
      ptr.partition_hash.clone(),
      req.zset.clone(),
      ptr.global_index.clone(),
      ptr.global_account_index.clone(),
      key_or(&req.account_index, &ptr.global_account_index),
      shard,
      req.in_progress.clone(),
    ];
    let args = vec![
      RedisArg::from(&req.partition_id),
      RedisArg::Int(req.at_ms),
      RedisArg::from(if req.forced { "1" } else { "0" }),
      RedisArg::from(&req.account_id),
      RedisArg::from(has_shard),
    ];
    self.eval("partition_requeue", &keys, &args).await
  }

  async fn partition_reprioritize(
    &self,
    partition_hash: &str,
    partition_id: &str,
    priority: i32,
  ) -> Result<i64> {
    let keys = vec![partition_hash.to_string()];
    let args = vec![
      RedisArg::from(partition_id),
      RedisArg::Int(priority as i64),
    ];
    self.eval("partition_reprioritize", &keys, &args).await
  }

  async fn config_lease(&self, req: &ConfigLeaseRequest) -> Result<i64> {
    let keys = vec![req.key.clone()];
    let args = vec![
      RedisArg::Int(req.now_ms),
      RedisArg::from(&req.lease_id),
      RedisArg::Int(req.ttl_ms),
      RedisArg::Str(req.existing.clone().unwrap_or_default()),
    ];
    self.eval("config_lease", &keys, &args).await
  }

  async fn lease_shard(&self, req: &ShardLeaseRequest) -> Result<i64> {
    let keys = vec![req.shards_hash.clone()];
    let args = vec![
      RedisArg::from(&req.name),
      RedisArg::Int(req.now_ms),
      RedisArg::from(&req.lease_id),
      RedisArg::Int(req.index),
    ];
    self.eval("shard_lease", &keys, &args).await
  }

  async fn renew_shard_lease(&self, req: &RenewShardLeaseRequest) -> Result<i64> {
    let keys = vec![req.shards_hash.clone()];
    let args = vec![
      RedisArg::from(&req.name),
      RedisArg::Int(req.now_ms),
      RedisArg::from(&req.existing),
      RedisArg::from(&req.lease_id),
    ];
    self.eval("renew_shard_lease", &keys, &args).await
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut conn = self.conn();
    let _: () = conn.set(key, value).await?;
    Ok(())
  }

  async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }
    let mut conn = self.conn();
    let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
    Ok(values)
  }

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
    let mut conn = self.conn();
    Ok(conn.hget(key, field).await?)
  }

  async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
    if fields.is_empty() {
      return Ok(Vec::new());
    }
    let mut conn = self.conn();
    let values: Vec<Option<String>> = redis::cmd("HMGET")
      .arg(key)
      .arg(fields)
      .query_async(&mut conn)
      .await?;
    Ok(values)
  }

  async fn hvals(&self, key: &str) -> Result<Vec<String>> {
    let mut conn = self.conn();
    Ok(conn.hvals(key).await?)
  }

  async fn zcard(&self, key: &str) -> Result<i64> {
    let mut conn = self.conn();
    Ok(conn.zcard(key).await?)
  }

  async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<i64> {
    let mut conn = self.conn();
    Ok(
      conn
        .zcount(key, score_bound(min), score_bound(max))
        .await?,
    )
  }

  async fn zrank(&self, key: &str, member: &str) -> Result<Option<i64>> {
    let mut conn = self.conn();
    Ok(conn.zrank(key, member).await?)
  }

  async fn zrange_by_score(
    &self,
    key: &str,
    min: i64,
    max: i64,
    limit: i64,
  ) -> Result<Vec<(String, i64)>> {
    let mut conn = self.conn();
    let mut cmd = redis::cmd("ZRANGEBYSCORE");
    cmd
      .arg(key)
      .arg(score_bound(min))
      .arg(score_bound(max))
      .arg("WITHSCORES");
    if limit > 0 {
      cmd.arg("LIMIT").arg(0).arg(limit);
    }
    let values: Vec<(String, f64)> = cmd.query_async(&mut conn).await?;
    Ok(
      values
        .into_iter()
        .map(|(member, score)| (member, score as i64))
        .collect(),
    )
  }

  async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
    let mut conn = self.conn();
    Ok(conn.zrange(key, start as isize, stop as isize).await?)
  }

  async fn lrange(&self, key: &str) -> Result<Vec<String>> {
    let mut conn = self.conn();
    Ok(conn.lrange(key, 0, -1).await?)
  }

  async fn push_capped(&self, key: &str, value: &str, len: usize) -> Result<()> {
    let mut conn = self.conn();
    let len = len.max(1) as isize;
    let _: () = redis::pipe()
      .atomic()
      .rpush(key, value)
      .ignore()
      .ltrim(key, -len, -1)
      .ignore()
      .query_async(&mut conn)
      .await?;
    Ok(())
  }
}
