//! 加权无放回抽样
//! Weighted sampling without replacement
//!
//! 每个元素的键为 `u^(1/w)`，按键降序排列即得到一次加权随机排列。
//! Each element gets the key `u^(1/w)`; sorting keys descending yields one weighted
//! random permutation.

use crate::error::{Error, Result};
use crate::lease::IdGenerator;

/// 返回按权重随机打乱的下标序列
/// Returns indices shuffled at random, favouring larger weights
pub fn weighted_shuffle(weights: &[f64], ids: &IdGenerator) -> Result<Vec<usize>> {
  if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
    return Err(Error::WeightedSampleRead);
  }
  let mut keyed: Vec<(f64, usize)> = weights
    .iter()
    .enumerate()
    .map(|(idx, w)| {
      // u 取 (0, 1]，避免 0 的幂
      let u = 1.0 - ids.float64();
      (u.powf(1.0 / w), idx)
    })
    .collect();
  keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
  Ok(keyed.into_iter().map(|(_, idx)| idx).collect())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_shuffle_is_a_permutation() {
    let ids = IdGenerator::seeded(11);
    let mut order = weighted_shuffle(&[1.0, 5.0, 10.0, 3.0], &ids).unwrap();
    order.sort();
    assert_eq!(order, vec![0, 1, 2, 3]);
  }

  #[test]
  fn test_invalid_weights() {
    let ids = IdGenerator::seeded(11);
    assert!(matches!(
      weighted_shuffle(&[1.0, 0.0], &ids),
      Err(Error::WeightedSampleRead)
    ));
    assert!(weighted_shuffle(&[f64::NAN], &ids).is_err());
    assert!(weighted_shuffle(&[], &ids).unwrap().is_empty());
  }

  #[test]
  fn test_heavier_weights_come_first_more_often() {
    let ids = IdGenerator::seeded(99);
    let mut heavy_first = 0;
    let mut light_first = 0;
    for _ in 0..2000 {
      match weighted_shuffle(&[10.0, 1.0], &ids).unwrap()[0] {
        0 => heavy_first += 1,
        _ => light_first += 1,
      }
    }
    assert!(heavy_first > light_first * 3);
    assert!(light_first > 0);
  }
}
