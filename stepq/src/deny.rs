//! 单次扫描的租用拒绝列表
//! Per-scan-pass lease deny list
//!
//! 一旦某个并发键或限流键达到上限，同一轮扫描中共享该键的后续队列项都会被跳过，
//! 不再访问存储。
//! Once a concurrency or throttle key hits its limit, later items sharing that key in
//! the same scan pass are skipped without a store round trip.

use crate::error::Error;
use std::collections::HashSet;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Denied {
  concurrency: HashSet<String>,
  throttle: HashSet<String>,
}

/// 租用拒绝列表
/// Lease deny list
#[derive(Debug, Default)]
pub struct LeaseDenies {
  inner: RwLock<Denied>,
}

impl LeaseDenies {
  pub fn new() -> Self {
    Self::default()
  }

  /// 记录租用错误中被拒绝的键
  /// Record the key denied by a lease error
  pub fn record(&self, err: &Error) {
    let Some(key) = err.denied_key() else {
      return;
    };
    let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
    if matches!(err, Error::ItemThrottled { .. }) {
      inner.throttle.insert(key.to_string());
    } else if err.is_concurrency_limit() {
      inner.concurrency.insert(key.to_string());
    }
  }

  pub fn deny_concurrency(&self, key: &str) -> bool {
    let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
    inner.concurrency.contains(key)
  }

  pub fn deny_throttle(&self, key: &str) -> bool {
    let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
    inner.throttle.contains(key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_records_concurrency_and_throttle_keys() {
    let denies = LeaseDenies::new();
    denies.record(&Error::PartitionConcurrencyLimit { key: "fn-1".into() });
    denies.record(&Error::ItemThrottled { key: "t-1".into() });
    denies.record(&Error::ItemNotFound);

    assert!(denies.deny_concurrency("fn-1"));
    assert!(!denies.deny_concurrency("t-1"));
    assert!(denies.deny_throttle("t-1"));
    assert!(!denies.deny_throttle("fn-1"));
  }
}
