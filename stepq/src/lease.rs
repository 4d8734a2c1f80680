//! 租约与标识符模块
//! Lease and identifier module
//!
//! 租约 ID 是嵌入过期时间的 ULID：前 48 位为过期的毫秒时间戳，
//! 因此租约无需额外字段就能判断是否有效。
//! A lease ID is a ULID whose 48-bit timestamp is the expiry time in milliseconds,
//! so a lease is self-describing: it is valid iff `now < expires_at`.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use ulid::Ulid;

/// 嵌入过期时间的租约 ID
/// A lease ID embedding its own expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Ulid);

impl LeaseId {
  /// 过期时间（毫秒）
  /// Expiry as a millisecond unix epoch
  pub fn expires_at_ms(&self) -> i64 {
    self.0.timestamp_ms() as i64
  }

  /// 租约在给定时间是否仍然有效
  /// Whether the lease is still held at `now_ms`
  pub fn is_valid_at(&self, now_ms: i64) -> bool {
    self.expires_at_ms() > now_ms
  }
}

impl From<Ulid> for LeaseId {
  fn from(value: Ulid) -> Self {
    Self(value)
  }
}

impl fmt::Display for LeaseId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

impl FromStr for LeaseId {
  type Err = crate::error::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ulid::from_string(s)
      .map(LeaseId)
      .map_err(|e| crate::error::Error::other(format!("invalid lease id '{s}': {e}")))
  }
}

/// ID 生成器，持有注入的随机源
/// ID generator holding the injected random source
///
/// 生产环境使用操作系统熵源播种，测试中可使用固定种子。
/// Production seeds from the OS entropy source; tests may pass a fixed seed.
pub struct IdGenerator {
  rng: Mutex<Box<dyn RngCore + Send>>,
}

impl fmt::Debug for IdGenerator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IdGenerator").finish_non_exhaustive()
  }
}

impl Default for IdGenerator {
  fn default() -> Self {
    Self::new(Box::new(StdRng::from_os_rng()))
  }
}

impl IdGenerator {
  pub fn new(rng: Box<dyn RngCore + Send>) -> Self {
    Self {
      rng: Mutex::new(rng),
    }
  }

  /// 使用固定种子创建确定性的生成器
  /// Deterministic generator from a fixed seed
  pub fn seeded(seed: u64) -> Self {
    Self::new(Box::new(StdRng::seed_from_u64(seed)))
  }

  /// 在随机源上执行闭包
  /// Run a closure against the random source
  pub fn with_rng<T>(&self, f: impl FnOnce(&mut dyn RngCore) -> T) -> T {
    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
    f(rng.as_mut())
  }

  /// 生成指定毫秒时间戳的 ULID
  /// Generate a ULID at the given millisecond timestamp
  pub fn ulid_at(&self, ms: i64) -> Ulid {
    let random: u128 = self.with_rng(|rng| rng.random());
    Ulid::from_parts(ms.max(0) as u64, random)
  }

  /// 生成在 `expires_at_ms` 过期的租约
  /// Generate a lease expiring at `expires_at_ms`
  pub fn lease(&self, expires_at_ms: i64) -> LeaseId {
    LeaseId(self.ulid_at(expires_at_ms))
  }

  /// [0, 1) 区间的随机浮点数
  /// Random float in [0, 1)
  pub fn float64(&self) -> f64 {
    self.with_rng(|rng| rng.random::<f64>())
  }
}

/// 将调用方提供的 ID 哈希为定长字符串（xxh64，36 进制）
/// Hash a caller-supplied ID into a fixed-width string (xxh64 in base 36)
pub fn hash_id(id: &str) -> String {
  to_base36(xxhash_rust::xxh64::xxh64(id.as_bytes(), 0))
}

fn to_base36(mut n: u64) -> String {
  const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
  if n == 0 {
    return "0".to_string();
  }
  let mut buf = Vec::with_capacity(13);
  while n > 0 {
    buf.push(DIGITS[(n % 36) as usize]);
    n /= 36;
  }
  buf.reverse();
  String::from_utf8_lossy(&buf).into_owned()
}
