//! # 角度分箱
//!
//! 将 (2θ, 强度) 样本按等宽角度分箱并求平均，得到一维粉末衍射图样。
//!
//! ## 算法
//! 1. 仅使用强度非零且角度、强度均为有限值的样本
//! 2. `step = (max - min) / nbins`，样本落入 `floor((angle - min) / step)` 号箱，
//!    角度恰为 `max` 的样本归入最后一箱
//! 3. 每箱强度 = 强度和 / 像素数；空箱为 0；负值（背景扣除后的数值噪声）截断为 0 并告警
//!
//! 按固定下标顺序累加，相同输入得到逐位相同的结果。
//!
//! ## 依赖关系
//! - 被 `xrd/pattern.rs` 调用
//! - 使用 `utils/output.rs` 输出告警

use crate::error::{Result, XrdReduceError};
use crate::utils::output;

/// 一维角度图样
///
/// 箱中心严格递增，间距均为 `(max_angle - min_angle) / nbins`。
#[derive(Debug, Clone, PartialEq)]
pub struct AngularProfile {
    /// 箱中心角度（度）
    pub angles: Vec<f64>,
    /// 平均强度
    pub intensities: Vec<f64>,
    /// 每箱像素数
    pub counts: Vec<usize>,
}

impl AngularProfile {
    pub fn len(&self) -> usize {
        self.angles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }

    /// 角度范围 (最小箱中心, 最大箱中心)
    pub fn angle_range(&self) -> Option<(f64, f64)> {
        Some((*self.angles.first()?, *self.angles.last()?))
    }

    /// 箱宽
    pub fn step(&self) -> Option<f64> {
        match self.angles.as_slice() {
            [a, b, ..] => Some(b - a),
            _ => None,
        }
    }
}

/// 角度分箱
pub fn bin(angles: &[f64], intensities: &[f64], nbins: usize) -> Result<AngularProfile> {
    if nbins == 0 {
        return Err(XrdReduceError::InvalidArgument(
            "number of bins must be at least 1".to_string(),
        ));
    }
    if angles.len() != intensities.len() {
        return Err(XrdReduceError::InvalidArgument(format!(
            "angle and intensity arrays differ in length ({} vs {})",
            angles.len(),
            intensities.len()
        )));
    }

    let usable = |i: usize| {
        angles[i].is_finite() && intensities[i].is_finite() && intensities[i] != 0.0
    };

    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut n_usable = 0usize;
    for i in 0..angles.len() {
        if usable(i) {
            min = min.min(angles[i]);
            max = max.max(angles[i]);
            n_usable += 1;
        }
    }
    if n_usable == 0 || max <= min {
        return Err(XrdReduceError::InsufficientData {
            context: "angular binning".to_string(),
            available: n_usable,
            required: 2,
        });
    }

    let step = (max - min) / nbins as f64;
    let mut sums = vec![0.0; nbins];
    let mut counts = vec![0usize; nbins];
    for i in 0..angles.len() {
        if !usable(i) {
            continue;
        }
        let index = (((angles[i] - min) / step).floor() as usize).min(nbins - 1);
        sums[index] += intensities[i];
        counts[index] += 1;
    }

    let mut clamped = 0usize;
    let averages: Vec<f64> = sums
        .iter()
        .zip(&counts)
        .map(|(&sum, &count)| {
            let mean = sum / count as f64;
            if mean.is_nan() {
                0.0
            } else if mean < 0.0 {
                clamped += 1;
                0.0
            } else {
                mean
            }
        })
        .collect();

    if clamped > 0 {
        output::print_warning(&format!(
            "{} bin(s) had negative average intensity; clamped to zero",
            clamped
        ));
    }

    Ok(AngularProfile {
        angles: (0..nbins)
            .map(|k| min + (k as f64 + 0.5) * step)
            .collect(),
        intensities: averages,
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_binning_is_deterministic() {
        let angles: Vec<f64> = (0..500).map(|i| 10.0 + (i as f64 * 0.37) % 40.0).collect();
        let intensities: Vec<f64> = (0..500).map(|i| ((i * 7919) % 101) as f64 * 0.1).collect();
        let a = bin(&angles, &intensities, 37).unwrap();
        let b = bin(&angles, &intensities, 37).unwrap();
        for (x, y) in a.intensities.iter().zip(&b.intensities) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
        assert_eq!(a.angles, b.angles);
    }

    #[test]
    fn test_bin_centers_uniform() {
        let angles = [0.0, 1.0, 2.0, 3.0, 4.0];
        let intensities = [1.0, 1.0, 1.0, 1.0, 1.0];
        let profile = bin(&angles, &intensities, 4).unwrap();
        assert_eq!(profile.len(), 4);
        for (k, center) in profile.angles.iter().enumerate() {
            assert_relative_eq!(*center, k as f64 + 0.5, epsilon = 1e-12);
        }
        // 最大角度样本归入最后一箱
        assert_eq!(profile.counts, vec![1, 1, 1, 2]);
        assert_relative_eq!(profile.step().unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_and_nonfinite_samples_excluded() {
        let angles = [0.0, 0.5, f64::NAN, 1.0, 2.0];
        let intensities = [2.0, 0.0, 100.0, 4.0, f64::INFINITY];
        let profile = bin(&angles, &intensities, 2).unwrap();
        // 范围 [0, 1]，两箱各一个样本
        assert_eq!(profile.counts, vec![1, 1]);
        assert_eq!(profile.intensities, vec![2.0, 4.0]);
    }

    #[test]
    fn test_empty_bins_are_zero() {
        let angles = [0.0, 10.0];
        let intensities = [3.0, 5.0];
        let profile = bin(&angles, &intensities, 5).unwrap();
        assert_eq!(profile.intensities, vec![3.0, 0.0, 0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_negative_average_clamped() {
        let angles = [0.0, 0.1, 1.0];
        let intensities = [-3.0, 1.0, 2.0];
        let profile = bin(&angles, &intensities, 2).unwrap();
        assert_eq!(profile.intensities, vec![0.0, 2.0]);
        assert!(profile.intensities.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(matches!(
            bin(&[1.0, 2.0], &[1.0, 1.0], 0),
            Err(XrdReduceError::InvalidArgument(_))
        ));
        assert!(matches!(
            bin(&[1.0, 1.0], &[1.0, 1.0], 3),
            Err(XrdReduceError::InsufficientData { .. })
        ));
        assert!(matches!(
            bin(&[1.0, 2.0], &[0.0, 0.0], 3),
            Err(XrdReduceError::InsufficientData { .. })
        ));
    }
}
