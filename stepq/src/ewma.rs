//! 指数加权移动平均
//! Exponentially-weighted moving average
//!
//! 与常见的 "simple EWMA" 相同：衰减系数为 2/(30+1)，第一个样本直接作为初始值。
//! The common "simple EWMA": decay of 2/(30+1), and the first sample seeds the value.

const AVG_METRIC_AGE: f64 = 30.0;
const DECAY: f64 = 2.0 / (AVG_METRIC_AGE + 1.0);

#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleEwma {
  value: f64,
}

impl SimpleEwma {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, sample: f64) {
    if self.value == 0.0 {
      self.value = sample;
    } else {
      self.value = sample * DECAY + self.value * (1.0 - DECAY);
    }
  }

  pub fn value(&self) -> f64 {
    self.value
  }

  /// 依次加入所有样本后的值
  /// Value after adding every sample in order
  pub fn over<I: IntoIterator<Item = f64>>(samples: I) -> f64 {
    let mut avg = Self::new();
    for s in samples {
      avg.add(s);
    }
    avg.value()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_sample_seeds_value() {
    let mut avg = SimpleEwma::new();
    avg.add(40.0);
    assert_eq!(avg.value(), 40.0);
  }

  #[test]
  fn test_decay_towards_new_samples() {
    let v = SimpleEwma::over([100.0, 0.0]);
    assert!((v - 100.0 * (1.0 - DECAY)).abs() < 1e-9);
    assert_eq!(SimpleEwma::over(std::iter::empty()), 0.0);
  }

  #[test]
  fn test_constant_series_is_stable() {
    let v = SimpleEwma::over(std::iter::repeat(250.0).take(10));
    assert!((v - 250.0).abs() < 1e-9);
  }
}
