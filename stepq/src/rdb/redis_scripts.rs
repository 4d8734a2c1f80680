//! Redis Lua 脚本模块
//! Redis Lua script module
//!
//! 每个复合操作是一个脚本，保证操作的原子性。
//! 所有脚本共享同一段辅助函数，租约 ID 的过期时间从 ULID 的前 10 个字符解码。
//! One script per compound operation, which keeps every operation atomic.
//! All scripts share one block of helpers; a lease's expiry is decoded from the first
//! 10 characters of its ULID.
//!
//! 必须与 `memdb::store` 中的内存实现保持同步
//! Must stay in sync with the in-memory implementation in `memdb::store`

use crate::error::{Error, Result};
use crate::redis::RedisConnection;
use phf::phf_map;
use redis::{RedisWrite, ToRedisArgs};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub enum RedisArg {
  Int(i64),
  Str(String),
  Bool(bool),
}

impl ToRedisArgs for RedisArg {
  fn write_redis_args<W>(&self, out: &mut W)
  where
    W: ?Sized + RedisWrite,
  {
    match self {
      RedisArg::Int(i) => i.write_redis_args(out),
      RedisArg::Str(s) => s.write_redis_args(out),
      RedisArg::Bool(b) => (*b as i64).write_redis_args(out),
    }
  }
}

impl From<i64> for RedisArg {
  fn from(value: i64) -> Self {
    RedisArg::Int(value)
  }
}

impl From<bool> for RedisArg {
  fn from(value: bool) -> Self {
    RedisArg::Bool(value)
  }
}

impl From<&str> for RedisArg {
  fn from(value: &str) -> Self {
    RedisArg::Str(value.to_string())
  }
}

impl From<&String> for RedisArg {
  fn from(value: &String) -> Self {
    RedisArg::Str(value.clone())
  }
}

impl From<String> for RedisArg {
  fn from(value: String) -> Self {
    RedisArg::Str(value)
  }
}

macro_rules! helpers {
  () => {
    r#"
local function decode_ulid_time(s)
  if type(s) ~= "string" or string.len(s) < 10 then
    return 0
  end
  local alphabet = "0123456789ABCDEFGHJKMNPQRSTVWXYZ"
  local t = 0
  for i = 1, 10 do
    local idx = string.find(alphabet, string.sub(s, i, i), 1, true)
    if idx == nil then
      return 0
    end
    t = t * 32 + (idx - 1)
  end
  return t
end

local function lease_valid(lease, now)
  if not lease or lease == cjson.null then
    return false
  end
  return decode_ulid_time(lease) > now
end

local function update_account(keyGlobalAccounts, keyAccountPartitions, account)
  local earliest = redis.call("ZRANGE", keyAccountPartitions, 0, 0, "WITHSCORES")
  if #earliest == 0 then
    redis.call("ZREM", keyGlobalAccounts, account)
  else
    redis.call("ZADD", keyGlobalAccounts, earliest[2], account)
  end
end

local function update_concurrency_index(keyIndex, keyInProgress, member)
  if member == "" then
    return
  end
  local earliest = redis.call("ZRANGE", keyInProgress, 0, 0, "WITHSCORES")
  if #earliest == 0 then
    redis.call("ZREM", keyIndex, member)
  else
    redis.call("ZADD", keyIndex, earliest[2], member)
  end
end

local function track(keyIndex, keyFunction, keyAccount, keyCustom0, keyCustom1, customCount, member, itemID, expiry)
  local keys = { keyFunction, keyAccount }
  if customCount > 0 then
    table.insert(keys, keyCustom0)
  end
  if customCount > 1 then
    table.insert(keys, keyCustom1)
  end
  for _, key in ipairs(keys) do
    if expiry then
      redis.call("ZADD", key, expiry, itemID)
    else
      redis.call("ZREM", key, itemID)
    end
  end
  update_concurrency_index(keyIndex, keyFunction, member)
end

local function set_pointer(keyGlobal, keyGlobalAccounts, keyShard, keyAccountPartitions, account, id, score)
  redis.call("ZADD", keyGlobal, score, id)
  if account ~= "" then
    redis.call("ZADD", keyAccountPartitions, score, id)
    update_account(keyGlobalAccounts, keyAccountPartitions, account)
  end
  if keyShard ~= "" then
    redis.call("ZADD", keyShard, score, id)
  end
end

local function remove_pointer(keyGlobal, keyGlobalAccounts, keyShard, keyAccountPartitions, account, id)
  redis.call("ZREM", keyGlobal, id)
  if account ~= "" then
    redis.call("ZREM", keyAccountPartitions, id)
    update_account(keyGlobalAccounts, keyAccountPartitions, account)
  end
  if keyShard ~= "" then
    redis.call("ZREM", keyShard, id)
  end
end

local function update_pointer(keyPartitions, keyGlobal, keyGlobalAccounts, keyShard, keyAccountPartitions, account, id, score, now)
  local raw = redis.call("HGET", keyPartitions, id)
  if not raw then
    return
  end
  local p = cjson.decode(raw)
  if (tonumber(p.force_at_ms) or 0) > now then
    return
  end
  if lease_valid(p.lease_id, now) then
    return
  end
  local current = redis.call("ZSCORE", keyGlobal, id)
  if current == false or tonumber(current) > score then
    set_pointer(keyGlobal, keyGlobalAccounts, keyShard, keyAccountPartitions, account, id, score)
  end
end
"#
  };
}

macro_rules! lua {
  ($body:literal) => {
    concat!(helpers!(), $body)
  };
}

/// Redis Lua 脚本集合
/// Redis Lua scripts
pub mod scripts {
  /// 入队脚本
  /// Enqueue script
  /// `KEYS[1]` -> item hash
  /// `KEYS[2]` -> idempotency key
  /// `KEYS[3]` -> partition hash
  /// `KEYS[4]` -> global partition index
  /// `KEYS[5]` -> global account index
  /// `KEYS[6]` -> shard partition index
  /// `KEYS[7]` -> shards hash
  /// `KEYS[8]` -> function metadata
  /// `KEYS[9..]` -> (partition set, account partition index) per partition, then secondary indexes
  /// `ARGV[1..11]` -> id, item, score, at, partition time, now, partition count,
  ///   has shard, shard name, shard record, function metadata
  /// `ARGV[12..]` -> (partition id, record, account id) per partition
  /// Returns 0 when enqueued, 1 when the item or its idempotency marker exists
  pub const ENQUEUE: &str = lua!(
    r#"
local itemID = ARGV[1]
local score = tonumber(ARGV[3])
local at = tonumber(ARGV[4])
local partitionTime = tonumber(ARGV[5])
local now = tonumber(ARGV[6])
local partitionCount = tonumber(ARGV[7])
local keyShard = ""
if ARGV[8] == "1" then
  keyShard = KEYS[6]
end

if redis.call("EXISTS", KEYS[2]) == 1 then
  return 1
end
if redis.call("HEXISTS", KEYS[1], itemID) == 1 then
  return 1
end
redis.call("HSET", KEYS[1], itemID, ARGV[2])

for i = 0, partitionCount - 1 do
  local id = ARGV[12 + i * 3]
  redis.call("ZADD", KEYS[9 + i * 2], score, itemID)
  redis.call("HSETNX", KEYS[3], id, ARGV[13 + i * 3])
  update_pointer(KEYS[3], KEYS[4], KEYS[5], keyShard, KEYS[10 + i * 2], ARGV[14 + i * 3], id, partitionTime, now)
end

if ARGV[8] == "1" then
  redis.call("HSETNX", KEYS[7], ARGV[9], ARGV[10])
end
if ARGV[11] ~= "" then
  redis.call("SET", KEYS[8], ARGV[11], "NX")
end
for i = 9 + partitionCount * 2, #KEYS do
  redis.call("ZADD", KEYS[i], at, itemID)
end
return 0
"#
  );

  /// 租用队列项脚本
  /// Lease item script
  /// `KEYS[1..8]` -> item hash, lease hash, concurrency index, function set, account set,
  ///   custom set 0, custom set 1, throttle key
  /// `KEYS[9..]` -> partition sets
  /// `ARGV[1..13]` -> id, lease id, now, expiry, function limit, account limit,
  ///   custom limit 0, custom limit 1, custom count, index member, throttle limit,
  ///   throttle burst, throttle period (ms)
  /// Returns 0 ok, 1 not found, 2 leased, 3/4/5/6 function/account/custom limits, 7 throttled
  pub const LEASE: &str = lua!(
    r#"
local itemID = ARGV[1]
local now = tonumber(ARGV[3])
local expiry = tonumber(ARGV[4])
local customCount = tonumber(ARGV[9])

local function at_limit(key, limit)
  limit = tonumber(limit)
  return limit > 0 and redis.call("ZCOUNT", key, "(" .. ARGV[3], "+inf") >= limit
end

if redis.call("HEXISTS", KEYS[1], itemID) == 0 then
  return 1
end
if lease_valid(redis.call("HGET", KEYS[2], itemID), now) then
  return 2
end
if at_limit(KEYS[4], ARGV[5]) then
  return 3
end
if at_limit(KEYS[5], ARGV[6]) then
  return 4
end
if customCount > 0 and at_limit(KEYS[6], ARGV[7]) then
  return 5
end
if customCount > 1 and at_limit(KEYS[7], ARGV[8]) then
  return 6
end

local throttleLimit = tonumber(ARGV[11])
if throttleLimit > 0 then
  local interval = math.max(1, math.floor(tonumber(ARGV[13]) / throttleLimit))
  local tat = tonumber(redis.call("GET", KEYS[8]) or "0") or 0
  if tat < now then
    tat = now
  end
  if tat - now > tonumber(ARGV[12]) * interval then
    return 7
  end
  local nextTat = tat + interval
  redis.call("SET", KEYS[8], nextTat, "PX", nextTat - now)
end

redis.call("HSET", KEYS[2], itemID, ARGV[2])
for i = 9, #KEYS do
  redis.call("ZREM", KEYS[i], itemID)
end
track(KEYS[3], KEYS[4], KEYS[5], KEYS[6], KEYS[7], customCount, ARGV[10], itemID, expiry)
return 0
"#
  );

  /// 续租脚本
  /// Extend lease script
  /// `KEYS[1..7]` -> item hash, lease hash, concurrency index, function set, account set,
  ///   custom set 0, custom set 1
  /// `ARGV[1..6]` -> id, existing lease, new lease, expiry, custom count, index member
  /// Returns 0 ok, 1 not found, 2 not leased, 3 mismatch
  pub const EXTEND_LEASE: &str = lua!(
    r#"
local itemID = ARGV[1]
if redis.call("HEXISTS", KEYS[1], itemID) == 0 then
  return 1
end
local current = redis.call("HGET", KEYS[2], itemID)
if not current then
  return 2
end
if current ~= ARGV[2] then
  return 3
end
redis.call("HSET", KEYS[2], itemID, ARGV[3])
track(KEYS[3], KEYS[4], KEYS[5], KEYS[6], KEYS[7], tonumber(ARGV[5]), ARGV[6], itemID, tonumber(ARGV[4]))
return 0
"#
  );

  /// 出队脚本
  /// Dequeue script
  /// `KEYS[1..8]` -> item hash, lease hash, idempotency key, concurrency index,
  ///   function set, account set, custom set 0, custom set 1
  /// `KEYS[9..]` -> partition sets, then secondary indexes
  /// `ARGV[1..5]` -> id, idempotency ttl (s), custom count, index member, partition set count
  /// Returns 0 ok, 1 not found
  pub const DEQUEUE: &str = lua!(
    r#"
local itemID = ARGV[1]
local partitionCount = tonumber(ARGV[5])
if redis.call("HEXISTS", KEYS[1], itemID) == 0 then
  return 1
end
redis.call("HDEL", KEYS[1], itemID)
redis.call("HDEL", KEYS[2], itemID)
for i = 9, 8 + partitionCount do
  redis.call("ZREM", KEYS[i], itemID)
end
track(KEYS[4], KEYS[5], KEYS[6], KEYS[7], KEYS[8], tonumber(ARGV[3]), ARGV[4], itemID, nil)
if tonumber(ARGV[2]) > 0 then
  redis.call("SET", KEYS[3], "1", "EX", ARGV[2])
end
for i = 9 + partitionCount, #KEYS do
  redis.call("ZREM", KEYS[i], itemID)
end
return 0
"#
  );

  /// 重新入队脚本
  /// Requeue script
  /// `KEYS[1..11]` -> item hash, lease hash, concurrency index, function set, account set,
  ///   custom set 0, custom set 1, partition hash, global partition index,
  ///   global account index, shard partition index
  /// `KEYS[12..]` -> (partition set, account partition index) per partition, then secondary indexes
  /// `ARGV[1..8]` -> id, item, at, now, custom count, index member, partition count, has shard
  /// `ARGV[9..]` -> (partition id, record, account id) per partition
  /// Returns 0 ok, 1 not found
  pub const REQUEUE: &str = lua!(
    r#"
local itemID = ARGV[1]
local at = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local partitionCount = tonumber(ARGV[7])
local keyShard = ""
if ARGV[8] == "1" then
  keyShard = KEYS[11]
end

if redis.call("HEXISTS", KEYS[1], itemID) == 0 then
  return 1
end
redis.call("HSET", KEYS[1], itemID, ARGV[2])
redis.call("HDEL", KEYS[2], itemID)
track(KEYS[3], KEYS[4], KEYS[5], KEYS[6], KEYS[7], tonumber(ARGV[5]), ARGV[6], itemID, nil)

for i = 0, partitionCount - 1 do
  local id = ARGV[9 + i * 3]
  redis.call("ZADD", KEYS[12 + i * 2], at, itemID)
  redis.call("HSETNX", KEYS[8], id, ARGV[10 + i * 3])
  update_pointer(KEYS[8], KEYS[9], KEYS[10], keyShard, KEYS[13 + i * 2], ARGV[11 + i * 3], id, at, now)
end
for i = 12 + partitionCount * 2, #KEYS do
  redis.call("ZADD", KEYS[i], at, itemID)
end
return 0
"#
  );

  /// 按 ID 重新入队脚本
  /// Requeue by ID script
  /// `KEYS[1..8]` -> item hash, lease hash, partition set, partition hash,
  ///   global partition index, global account index, account partition index, shard index
  /// `ARGV[1..7]` -> id, item, at, now, partition id, account id, has shard
  /// Returns 0 ok, -1 not found, -2 leased
  pub const REQUEUE_BY_ID: &str = lua!(
    r#"
local itemID = ARGV[1]
local at = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local keyShard = ""
if ARGV[7] == "1" then
  keyShard = KEYS[8]
end

if redis.call("HEXISTS", KEYS[1], itemID) == 0 then
  return -1
end
if redis.call("ZSCORE", KEYS[3], itemID) == false then
  return -1
end
if lease_valid(redis.call("HGET", KEYS[2], itemID), now) then
  return -2
end
redis.call("HSET", KEYS[1], itemID, ARGV[2])
redis.call("ZADD", KEYS[3], at, itemID)
update_pointer(KEYS[4], KEYS[5], KEYS[6], keyShard, KEYS[7], ARGV[6], ARGV[5], at, now)
return 0
"#
  );

  /// 租用分区脚本
  /// Partition lease script
  /// `KEYS[1..9]` -> partition hash, global partition index, global account index,
  ///   account partition index, shard index, function metadata, function set,
  ///   account set, custom set
  /// `ARGV[1..11]` -> partition id, lease id, now, expiry, function limit, account limit,
  ///   custom limit, account id, has shard, force-at time, has function metadata
  /// Returns {code, capacity}: 0 ok, -1 concurrency limited, -2 not found, -3 leased, -4 paused
  pub const PARTITION_LEASE: &str = lua!(
    r#"
local id = ARGV[1]
local now = tonumber(ARGV[3])
local keyShard = ""
if ARGV[9] == "1" then
  keyShard = KEYS[5]
end

local raw = redis.call("HGET", KEYS[1], id)
if not raw then
  return { -2, 0 }
end
if ARGV[11] == "1" then
  local meta = redis.call("GET", KEYS[6])
  if meta then
    local m = cjson.decode(meta)
    if m.paused == true then
      return { -4, 0 }
    end
  end
end
local p = cjson.decode(raw)
if lease_valid(p.lease_id, now) then
  return { -3, 0 }
end

local capacity = nil
local function check(key, limit)
  limit = tonumber(limit)
  if limit <= 0 then
    return
  end
  local available = limit - redis.call("ZCOUNT", key, "(" .. ARGV[3], "+inf")
  if capacity == nil or available < capacity then
    capacity = available
  end
end
check(KEYS[7], ARGV[5])
check(KEYS[8], ARGV[6])
check(KEYS[9], ARGV[7])

if capacity ~= nil and capacity <= 0 then
  p.force_at_ms = tonumber(ARGV[10])
  redis.call("HSET", KEYS[1], id, cjson.encode(p))
  set_pointer(KEYS[2], KEYS[3], keyShard, KEYS[4], ARGV[8], id, ARGV[10])
  return { -1, 0 }
end

p.lease_id = ARGV[2]
p.last = now
redis.call("HSET", KEYS[1], id, cjson.encode(p))
set_pointer(KEYS[2], KEYS[3], keyShard, KEYS[4], ARGV[8], id, ARGV[4])
if capacity == nil then
  capacity = -1
end
return { 0, capacity }
"#
  );

  /// 重新入队分区脚本
  /// Partition requeue script
  /// `KEYS[1..7]` -> partition hash, partition set, global partition index,
  ///   global account index, account partition index, shard index, in-progress set
  /// `ARGV[1..5]` -> partition id, at, forced, account id, has shard
  /// Returns 0 ok, 1 not found, 2 garbage collected
  pub const PARTITION_REQUEUE: &str = lua!(
    r#"
local id = ARGV[1]
local at = tonumber(ARGV[2])
local keyShard = ""
if ARGV[5] == "1" then
  keyShard = KEYS[6]
end

local raw = redis.call("HGET", KEYS[1], id)
if not raw then
  return 1
end

local queued = redis.call("ZCARD", KEYS[2])
local inProgress = redis.call("ZCARD", KEYS[7])
if queued == 0 and inProgress == 0 then
  redis.call("HDEL", KEYS[1], id)
  remove_pointer(KEYS[3], KEYS[4], keyShard, KEYS[5], ARGV[4], id)
  return 2
end

local p = cjson.decode(raw)
p.lease_id = nil
local score = at
if ARGV[3] == "1" then
  p.force_at_ms = at
else
  p.force_at_ms = 0
  local earliest = redis.call("ZRANGE", KEYS[2], 0, 0, "WITHSCORES")
  if #earliest > 0 and tonumber(earliest[2]) < score then
    score = tonumber(earliest[2])
  end
end
redis.call("HSET", KEYS[1], id, cjson.encode(p))
set_pointer(KEYS[3], KEYS[4], keyShard, KEYS[5], ARGV[4], id, score)
return 0
"#
  );

  /// 设置分区优先级脚本
  /// Partition reprioritize script
  /// `KEYS[1]` -> partition hash
  /// `ARGV[1..2]` -> partition id, priority
  /// Returns 0 ok, 1 not found
  pub const PARTITION_REPRIORITIZE: &str = r#"
local raw = redis.call("HGET", KEYS[1], ARGV[1])
if not raw then
  return 1
end
local p = cjson.decode(raw)
p.priority = tonumber(ARGV[2])
redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(p))
return 0
"#;

  /// 配置租约脚本
  /// Config lease script
  /// `KEYS[1]` -> config key
  /// `ARGV[1..4]` -> now, new lease, ttl (ms), existing lease ("" for none)
  /// Returns 0 ok, 1 held by another process
  pub const CONFIG_LEASE: &str = lua!(
    r#"
local current = redis.call("GET", KEYS[1])
if current and lease_valid(current, tonumber(ARGV[1])) and current ~= ARGV[4] then
  return 1
end
redis.call("SET", KEYS[1], ARGV[2], "PX", ARGV[3])
return 0
"#
  );

  /// 租用分片槽位脚本
  /// Shard lease script
  /// `KEYS[1]` -> shards hash
  /// `ARGV[1..4]` -> shard name, now, new lease, slot index
  /// Returns 0 ok, -1 not found, -2 already leased, -3 invalid index
  pub const SHARD_LEASE: &str = lua!(
    r#"
local raw = redis.call("HGET", KEYS[1], ARGV[1])
if not raw then
  return -1
end
local now = tonumber(ARGV[2])
local n = tonumber(ARGV[4])
local shard = cjson.decode(raw)
local valid = {}
for _, lease in ipairs(shard.leases or {}) do
  if lease_valid(lease, now) then
    table.insert(valid, lease)
  end
end
local count = #valid
if n > count then
  return -3
end
if n < count then
  return -2
end
if n >= (tonumber(shard.guaranteed_capacity) or 0) then
  return -3
end
table.insert(valid, ARGV[3])
shard.leases = valid
redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(shard))
return 0
"#
  );

  /// 续租分片脚本
  /// Renew shard lease script
  /// `KEYS[1]` -> shards hash
  /// `ARGV[1..4]` -> shard name, now, existing lease, new lease
  /// Returns 0 ok, -1 not found, -2 lease not found
  pub const RENEW_SHARD_LEASE: &str = lua!(
    r#"
local raw = redis.call("HGET", KEYS[1], ARGV[1])
if not raw then
  return -1
end
local now = tonumber(ARGV[2])
local shard = cjson.decode(raw)
local found = false
local leases = {}
for _, lease in ipairs(shard.leases or {}) do
  if lease == ARGV[3] then
    found = true
    table.insert(leases, ARGV[4])
  elseif lease_valid(lease, now) then
    table.insert(leases, lease)
  end
end
if not found then
  return -2
end
shard.leases = leases
redis.call("HSET", KEYS[1], ARGV[1], cjson.encode(shard))
return 0
"#
  );
}

/// Redis 脚本管理器
/// Redis script manager
#[derive(Debug, Default)]
pub struct ScriptManager {
  /// 脚本 SHA 缓存
  /// Script SHA cache
  script_sha1: HashMap<&'static str, String>,
}

impl ScriptManager {
  /// 预加载所有脚本
  /// Preload every script
  pub async fn load_scripts(&mut self, conn: &mut RedisConnection) -> Result<()> {
    for (name, script) in ALL_SCRIPT.entries() {
      let sha = self.load_script(conn, script).await?;
      self.script_sha1.insert(name, sha);
    }
    Ok(())
  }

  pub async fn load_script(&self, conn: &mut RedisConnection, script: &str) -> Result<String> {
    let sha: String = redis::cmd("SCRIPT")
      .arg("LOAD")
      .arg(script)
      .query_async(conn)
      .await?;
    Ok(sha)
  }

  /// 获取脚本 SHA
  /// Get a script's SHA
  pub fn get_script_sha(&self, name: &str) -> Option<&String> {
    self.script_sha1.get(name)
  }

  /// 执行脚本；脚本缓存被清空时回退到 EVAL
  /// Run a script; falls back to EVAL when the server's script cache was flushed
  pub async fn eval_script<T>(
    &self,
    conn: &mut RedisConnection,
    script_name: &str,
    keys: &[String],
    args: &[RedisArg],
  ) -> Result<T>
  where
    T: redis::FromRedisValue,
  {
    let script = ALL_SCRIPT
      .get(script_name)
      .ok_or_else(|| Error::other(format!("Script not found: {script_name}")))?;

    if let Some(sha) = self.get_script_sha(script_name) {
      match redis::cmd("EVALSHA")
        .arg(sha)
        .arg(keys.len())
        .arg(keys)
        .arg(args)
        .query_async::<T>(conn)
        .await
      {
        Ok(result) => return Ok(result),
        Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
          tracing::debug!("script {script_name} missing from cache, reloading");
          self.load_script(conn, script).await?;
        }
        Err(e) => return Err(e.into()),
      }
    }

    let result = redis::cmd("EVAL")
      .arg(*script)
      .arg(keys.len())
      .arg(keys)
      .arg(args)
      .query_async::<T>(conn)
      .await?;
    Ok(result)
  }
}

static ALL_SCRIPT: phf::Map<&'static str, &'static str> = phf_map! {
  "enqueue" => scripts::ENQUEUE,
  "lease" => scripts::LEASE,
  "extend_lease" => scripts::EXTEND_LEASE,
  "dequeue" => scripts::DEQUEUE,
  "requeue" => scripts::REQUEUE,
  "requeue_by_id" => scripts::REQUEUE_BY_ID,
  "partition_lease" => scripts::PARTITION_LEASE,
  "partition_requeue" => scripts::PARTITION_REQUEUE,
  "partition_reprioritize" => scripts::PARTITION_REPRIORITIZE,
  "config_lease" => scripts::CONFIG_LEASE,
  "shard_lease" => scripts::SHARD_LEASE,
  "renew_shard_lease" => scripts::RENEW_SHARD_LEASE,
};
