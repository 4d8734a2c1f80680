//! 内存 QueueStore trait 实现
//! Memory QueueStore trait implementation
//!
//! 每个复合操作与 `rdb::redis_scripts` 中同名的 Lua 脚本一一对应
//! Each compound operation mirrors the Lua script of the same name in `rdb::redis_scripts`

use crate::base::*;
use crate::error::Result;
use crate::lease::LeaseId;
use crate::memdb::memory_store::{lease_valid, MemoryStorage, MemoryStore};
use crate::partition::{FnMetadata, QueueShard};
use async_trait::async_trait;

/// 将队列项加入或移出进行中集合后刷新并发索引
/// Refresh the concurrency index after touching an item's in-progress sets
fn track(s: &mut MemoryStorage, keys: &InProgressKeys, item_id: &str, expires_at_ms: Option<i64>) {
  let sets = [&keys.function, &keys.account]
    .into_iter()
    .chain(keys.custom.iter());
  for set in sets {
    match expires_at_ms {
      Some(at) => s.zadd(set, at, item_id),
      None => s.zrem(set, item_id),
    }
  }
  s.update_concurrency_index(&keys.index, &keys.function, &keys.member);
}

/// 未过期的进行中数量是否已达上限
/// Whether the unexpired in-progress count has reached the limit
fn at_limit(s: &MemoryStorage, key: &str, limit: i64, now_ms: i64) -> bool {
  limit > 0 && s.zcount(key, now_ms + 1, SCORE_MAX) >= limit
}

#[async_trait]
impl QueueStore for MemoryStore {
  async fn enqueue(&self, req: &EnqueueRequest) -> Result<i64> {
    let mut s = self.storage.write().await;
    if s.exists(&req.idempotency_key, req.now_ms) || s.hexists(&req.item_hash, &req.item_id) {
      return Ok(1);
    }
    s.hset(&req.item_hash, &req.item_id, req.item.clone());
    for p in &req.partitions {
      s.zadd(&p.zset, req.score, &req.item_id);
      s.hsetnx(&req.pointers.partition_hash, &p.id, &p.record);
      s.update_pointer(&req.pointers, p, req.partition_time_ms, req.now_ms)?;
    }
    if let Some(shard) = &req.shard {
      s.hsetnx(&req.shards_hash, &shard.name, &shard.record);
    }
    if let Some(meta) = &req.fn_metadata {
      s.set_nx(&req.fn_metadata_key, meta, req.now_ms);
    }
    for index in &req.indexes {
      s.zadd(index, req.at_ms, &req.item_id);
    }
    Ok(0)
  }

  async fn lease(&self, req: &LeaseRequest) -> Result<i64> {
    let now = req.now_ms;
    let mut s = self.storage.write().await;
    if !s.hexists(&req.item_hash, &req.item_id) {
      return Ok(1);
    }
    if lease_valid(s.hget(&req.lease_hash, &req.item_id).as_deref(), now) {
      return Ok(2);
    }

    let ip = &req.in_progress;
    if at_limit(&s, &ip.function, req.function_limit, now) {
      return Ok(3);
    }
    if at_limit(&s, &ip.account, req.account_limit, now) {
      return Ok(4);
    }
    for (i, (key, limit)) in ip.custom.iter().zip(&req.custom_limits).enumerate() {
      if at_limit(&s, key, *limit, now) {
        return Ok(5 + i as i64);
      }
    }

    if let Some(t) = req.throttle.as_ref().filter(|t| t.limit > 0) {
      let interval = (t.period_ms / t.limit).max(1);
      let tat = s
        .get(&t.key, now)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
        .max(now);
      if tat - now > t.burst * interval {
        return Ok(7);
      }
      let next = tat + interval;
      s.set(&t.key, next.to_string(), Some(next - now), now);
    }

    s.hset(&req.lease_hash, &req.item_id, req.lease_id.clone());
    for set in &req.partition_sets {
      s.zrem(set, &req.item_id);
    }
    track(&mut s, ip, &req.item_id, Some(req.expires_at_ms));
    Ok(0)
  }

  async fn extend_lease(&self, req: &ExtendLeaseRequest) -> Result<i64> {
    let mut s = self.storage.write().await;
    if !s.hexists(&req.item_hash, &req.item_id) {
      return Ok(1);
    }
    let Some(current) = s.hget(&req.lease_hash, &req.item_id) else {
      return Ok(2);
    };
    if current != req.existing {
      return Ok(3);
    }
    s.hset(&req.lease_hash, &req.item_id, req.lease_id.clone());
    track(&mut s, &req.in_progress, &req.item_id, Some(req.expires_at_ms));
    Ok(0)
  }

  async fn dequeue(&self, req: &DequeueRequest) -> Result<i64> {
    let now = self.clock.now_ms();
    let mut s = self.storage.write().await;
    if !s.hexists(&req.item_hash, &req.item_id) {
      return Ok(1);
    }
    s.hdel(&req.item_hash, &req.item_id);
    s.hdel(&req.lease_hash, &req.item_id);
    for set in &req.partition_sets {
      s.zrem(set, &req.item_id);
    }
    track(&mut s, &req.in_progress, &req.item_id, None);
    if req.idempotency_ttl_secs > 0 {
      s.set(
        &req.idempotency_key,
        "1".to_string(),
        Some(req.idempotency_ttl_secs * 1000),
        now,
      );
    }
    for index in &req.indexes {
      s.zrem(index, &req.item_id);
    }
    Ok(0)
  }

  async fn requeue(&self, req: &RequeueRequest) -> Result<i64> {
    let mut s = self.storage.write().await;
    if !s.hexists(&req.item_hash, &req.item_id) {
      return Ok(1);
    }
    s.hset(&req.item_hash, &req.item_id, req.item.clone());
    s.hdel(&req.lease_hash, &req.item_id);
    track(&mut s, &req.in_progress, &req.item_id, None);
    for p in &req.partitions {
      s.zadd(&p.zset, req.at_ms, &req.item_id);
      s.hsetnx(&req.pointers.partition_hash, &p.id, &p.record);
      s.update_pointer(&req.pointers, p, req.at_ms, req.now_ms)?;
    }
    for index in &req.indexes {
      s.zadd(index, req.at_ms, &req.item_id);
    }
    Ok(0)
  }

  async fn requeue_by_id(&self, req: &RequeueByIdRequest) -> Result<i64> {
    let mut s = self.storage.write().await;
    if !s.hexists(&req.item_hash, &req.item_id)
      || s.zscore(&req.partition.zset, &req.item_id).is_none()
    {
      return Ok(-1);
    }
    if lease_valid(s.hget(&req.lease_hash, &req.item_id).as_deref(), req.now_ms) {
      return Ok(-2);
    }
    s.hset(&req.item_hash, &req.item_id, req.item.clone());
    s.zadd(&req.partition.zset, req.at_ms, &req.item_id);
    s.update_pointer(&req.pointers, &req.partition, req.at_ms, req.now_ms)?;
    Ok(0)
  }

  async fn partition_lease(&self, req: &PartitionLeaseRequest) -> Result<(i64, i64)> {
    let now = req.now_ms;
    let mut s = self.storage.write().await;
    let hash = &req.pointers.partition_hash;
    let Some(mut p) = s.partition(hash, &req.partition_id)? else {
      return Ok((-2, 0));
    };
    if let Some(raw) = req.fn_metadata_key.as_ref().and_then(|k| s.get(k, now)) {
      if serde_json::from_str::<FnMetadata>(&raw).is_ok_and(|m| m.paused) {
        return Ok((-4, 0));
      }
    }
    if p.is_leased(now) {
      return Ok((-3, 0));
    }

    let mut capacity: Option<i64> = None;
    for (key, limit) in [
      (&req.function_in_progress, req.function_limit),
      (&req.account_in_progress, req.account_limit),
      (&req.custom_in_progress, req.custom_limit),
    ] {
      if limit > 0 {
        let available = limit - s.zcount(key, now + 1, SCORE_MAX);
        capacity = Some(capacity.map_or(available, |c| c.min(available)));
      }
    }

    if capacity.is_some_and(|c| c <= 0) {
      p.force_at_ms = req.force_at_ms;
      s.put_partition(hash, &p)?;
      s.set_pointer(
        &req.pointers,
        &req.account_index,
        &req.account_id,
        &req.partition_id,
        req.force_at_ms,
      );
      return Ok((-1, 0));
    }

    p.lease_id = Some(req.lease_id.parse::<LeaseId>()?);
    p.last = now;
    s.put_partition(hash, &p)?;
    s.set_pointer(
      &req.pointers,
      &req.account_index,
      &req.account_id,
      &req.partition_id,
      req.expires_at_ms,
    );
    Ok((0, capacity.unwrap_or(-1)))
  }

  async fn partition_requeue(&self, req: &PartitionRequeueRequest) -> Result<i64> {
    let mut s = self.storage.write().await;
    let hash = &req.pointers.partition_hash;
    let Some(mut p) = s.partition(hash, &req.partition_id)? else {
      return Ok(1);
    };

    let queued = s.zcard(&req.zset);
    let in_progress = s.zcard(&req.in_progress);
    if queued == 0 && in_progress == 0 {
      s.hdel(hash, &req.partition_id);
      s.remove_pointer(
        &req.pointers,
        &req.account_index,
        &req.account_id,
        &req.partition_id,
      );
      return Ok(2);
    }

    p.lease_id = None;
    let mut score = req.at_ms;
    if req.forced {
      p.force_at_ms = req.at_ms;
    } else {
      p.force_at_ms = 0;
      if let Some(earliest) = s.zfirst_score(&req.zset) {
        score = score.min(earliest);
      }
    }
    s.put_partition(hash, &p)?;
    s.set_pointer(
      &req.pointers,
      &req.account_index,
      &req.account_id,
      &req.partition_id,
      score,
    );
    Ok(0)
  }

  async fn partition_reprioritize(
    &self,
    partition_hash: &str,
    partition_id: &str,
    priority: i32,
  ) -> Result<i64> {
    let mut s = self.storage.write().await;
    let Some(mut p) = s.partition(partition_hash, partition_id)? else {
      return Ok(1);
    };
    p.priority = priority;
    s.put_partition(partition_hash, &p)?;
    Ok(0)
  }

  async fn config_lease(&self, req: &ConfigLeaseRequest) -> Result<i64> {
    let mut s = self.storage.write().await;
    if let Some(current) = s.get(&req.key, req.now_ms) {
      if lease_valid(Some(current.as_str()), req.now_ms) && req.existing.as_deref() != Some(current.as_str()) {
        return Ok(1);
      }
    }
    s.set(&req.key, req.lease_id.clone(), Some(req.ttl_ms), req.now_ms);
    Ok(0)
  }

  async fn lease_shard(&self, req: &ShardLeaseRequest) -> Result<i64> {
    let mut s = self.storage.write().await;
    let Some(raw) = s.hget(&req.shards_hash, &req.name) else {
      return Ok(-1);
    };
    let mut shard: QueueShard = serde_json::from_str(&raw)?;
    shard.leases.retain(|l| l.is_valid_at(req.now_ms));
    let count = shard.leases.len() as i64;
    if req.index > count {
      return Ok(-3);
    }
    if req.index < count {
      return Ok(-2);
    }
    if req.index >= shard.guaranteed_capacity as i64 {
      return Ok(-3);
    }
    shard.leases.push(req.lease_id.parse()?);
    s.hset(&req.shards_hash, &req.name, serde_json::to_string(&shard)?);
    Ok(0)
  }

  async fn renew_shard_lease(&self, req: &RenewShardLeaseRequest) -> Result<i64> {
    let mut s = self.storage.write().await;
    let Some(raw) = s.hget(&req.shards_hash, &req.name) else {
      return Ok(-1);
    };
    let mut shard: QueueShard = serde_json::from_str(&raw)?;
    let renewed: LeaseId = req.lease_id.parse()?;
    let mut found = false;
    let mut leases = Vec::with_capacity(shard.leases.len());
    for lease in shard.leases {
      if lease.to_string() == req.existing {
        found = true;
        leases.push(renewed);
      } else if lease.is_valid_at(req.now_ms) {
        leases.push(lease);
      }
    }
    if !found {
      return Ok(-2);
    }
    shard.leases = leases;
    s.hset(&req.shards_hash, &req.name, serde_json::to_string(&shard)?);
    Ok(0)
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    let now = self.clock.now_ms();
    self
      .storage
      .write()
      .await
      .set(key, value.to_string(), None, now);
    Ok(())
  }

  async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
    let now = self.clock.now_ms();
    let s = self.storage.read().await;
    Ok(keys.iter().map(|k| s.get(k, now)).collect())
  }

  async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
    Ok(self.storage.read().await.hget(key, field))
  }

  async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
    let s = self.storage.read().await;
    Ok(fields.iter().map(|f| s.hget(key, f)).collect())
  }

  async fn hvals(&self, key: &str) -> Result<Vec<String>> {
    Ok(self.storage.read().await.hvals(key))
  }

  async fn zcard(&self, key: &str) -> Result<i64> {
    Ok(self.storage.read().await.zcard(key))
  }

  async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<i64> {
    Ok(self.storage.read().await.zcount(key, min, max))
  }

  async fn zrank(&self, key: &str, member: &str) -> Result<Option<i64>> {
    Ok(
      self
        .storage
        .read()
        .await
        .zset(key)
        .and_then(|z| z.rank(member)),
    )
  }

  async fn zrange_by_score(
    &self,
    key: &str,
    min: i64,
    max: i64,
    limit: i64,
  ) -> Result<Vec<(String, i64)>> {
    Ok(
      self
        .storage
        .read()
        .await
        .zset(key)
        .map(|z| z.range_by_score(min, max, limit))
        .unwrap_or_default(),
    )
  }

  async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
    Ok(
      self
        .storage
        .read()
        .await
        .zset(key)
        .map(|z| z.range(start, stop))
        .unwrap_or_default(),
    )
  }

  async fn lrange(&self, key: &str) -> Result<Vec<String>> {
    Ok(self.storage.read().await.lrange(key))
  }

  async fn push_capped(&self, key: &str, value: &str, len: usize) -> Result<()> {
    self.storage.write().await.push_capped(key, value, len);
    Ok(())
  }
}
