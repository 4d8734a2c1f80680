//! 时钟模块
//! Clock module
//!
//! 队列从注入的时钟读取当前时间，测试中用手动时钟模拟时间流逝。
//! The queue reads "now" from an injected clock; tests use a manual clock to simulate time.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// 时间来源
/// Source of the current time
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  /// 当前时间的毫秒时间戳
  /// Current time as a millisecond unix epoch
  fn now_ms(&self) -> i64 {
    self.now().timestamp_millis()
  }
}

/// 系统时钟
/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// 手动推进的时钟
/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// 从当前系统时间开始（截断到毫秒）
  /// Start from the current wall time, truncated to milliseconds
  pub fn starting_now() -> Self {
    let ms = Utc::now().timestamp_millis();
    Self::new(DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now))
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += chrono::Duration::milliseconds(by.as_millis() as i64);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// 时长转换为毫秒
/// Duration to whole milliseconds
pub(crate) fn millis(d: Duration) -> i64 {
  d.as_millis() as i64
}
