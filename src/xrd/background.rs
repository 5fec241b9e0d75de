//! # 背景估计与扣除
//!
//! 在排除衍射环的像素上插值出平滑背景面，再从原图中扣除。
//!
//! ## 算法
//! 1. 有效像素 = 掩膜为 `true`、数值有限且非零（零为死像素标记）
//! 2. 被排除像素取最近有效像素的值（二维散点最近邻插值，网格分桶加速）
//! 3. 对插值面做可分离高斯平滑（反射边界，截断于 4σ）
//!
//! 有效像素少于 3 个时无法插值，返回 `InsufficientData`。
//!
//! ## 依赖关系
//! - 被 `xrd/pattern.rs` 调用
//! - 使用 `xrd/masking.rs` 构造粉末环掩膜

use crate::config::{DetectorGeometry, PowderAngleTable};
use crate::error::{Result, XrdReduceError};
use crate::models::{Frame, Mask};
use crate::xrd::masking;

use ndarray::{Array2, Axis, Zip};

/// 最近邻搜索的网格单元边长（像素）
const CELL_SIZE: usize = 16;

/// 插值所需的最少有效像素
const MIN_VALID_PIXELS: usize = 3;

/// 背景面
#[derive(Debug, Clone)]
pub struct BackgroundSurface {
    /// 平滑后的背景
    pub smoothed: Array2<f64>,
    /// 插值后未平滑的背景
    pub raw: Array2<f64>,
}

/// 背景估计器
#[derive(Debug, Clone, Copy)]
pub struct BackgroundEstimator {
    /// 高斯平滑标准差（像素），`<= 0` 时不平滑
    pub smoothing_sigma: f64,
}

impl BackgroundEstimator {
    pub fn new(smoothing_sigma: f64) -> Self {
        Self { smoothing_sigma }
    }

    /// 在掩膜排除的区域插值背景并平滑
    pub fn estimate(&self, frame: &Frame, mask: &Mask) -> Result<BackgroundSurface> {
        frame.check_mask(mask, "background mask")?;
        let raw = nearest_valid_fill(&frame.data, mask)?;
        let smoothed = gaussian_filter(&raw, self.smoothing_sigma);
        Ok(BackgroundSurface { smoothed, raw })
    }
}

/// 掩膜扣除背景
///
/// 合并坏像素掩膜与粉末环掩膜，在剩余像素上估计背景；坏像素处背景置零后
/// 返回 `frame - background`。
pub fn subtract_background_full_frame(
    frame: &Frame,
    geometry: &DetectorGeometry,
    powder_angles: &PowderAngleTable,
    bad_mask: &Mask,
    compounds: &[String],
    ring_width: f64,
    estimator: &BackgroundEstimator,
) -> Result<Frame> {
    if compounds.is_empty() {
        return Err(XrdReduceError::NoCompounds);
    }
    frame.check_mask(bad_mask, "bad-pixel mask")?;

    let ring_mask =
        masking::make_powder_ring_mask(geometry, powder_angles, frame, compounds, ring_width)?;
    let combined = masking::and_masks(bad_mask, &[ring_mask])?;
    let excluded = frame.masked(&combined)?;

    let mut background = estimator.estimate(&excluded, &combined)?.smoothed;
    Zip::from(&mut background)
        .and(bad_mask)
        .for_each(|b, &valid| {
            if !valid {
                *b = 0.0;
            }
        });

    Ok(Frame::new(&frame.data - &background, &frame.detector_id))
}

/// 最近有效像素插值
///
/// 有效像素保持原值，其余像素取欧氏距离最近的有效像素的值；
/// 距离相同时取行号、列号较小者。
pub fn nearest_valid_fill(data: &Array2<f64>, mask: &Mask) -> Result<Array2<f64>> {
    let (rows, cols) = data.dim();
    let is_valid = |r: usize, c: usize| {
        let v = data[[r, c]];
        mask[[r, c]] && v.is_finite() && v != 0.0
    };

    let cell_rows = rows.div_ceil(CELL_SIZE);
    let cell_cols = cols.div_ceil(CELL_SIZE);
    let mut buckets: Vec<Vec<(usize, usize)>> = vec![Vec::new(); cell_rows * cell_cols];
    let mut n_valid = 0usize;
    for r in 0..rows {
        for c in 0..cols {
            if is_valid(r, c) {
                buckets[(r / CELL_SIZE) * cell_cols + c / CELL_SIZE].push((r, c));
                n_valid += 1;
            }
        }
    }

    if n_valid < MIN_VALID_PIXELS {
        return Err(XrdReduceError::InsufficientData {
            context: "background interpolation".to_string(),
            available: n_valid,
            required: MIN_VALID_PIXELS,
        });
    }

    let max_ring = cell_rows.max(cell_cols);
    let mut filled = data.clone();
    for r in 0..rows {
        for c in 0..cols {
            if is_valid(r, c) {
                continue;
            }
            let (cr, cc) = ((r / CELL_SIZE) as isize, (c / CELL_SIZE) as isize);
            // (距离², 行, 列)
            let mut best: Option<(usize, usize, usize)> = None;

            for ring in 0..=max_ring {
                let k = ring as isize;
                for dr in -k..=k {
                    for dc in -k..=k {
                        if dr.abs() != k && dc.abs() != k {
                            continue;
                        }
                        let (br, bc) = (cr + dr, cc + dc);
                        if br < 0 || bc < 0 || br >= cell_rows as isize || bc >= cell_cols as isize
                        {
                            continue;
                        }
                        for &(vr, vc) in &buckets[br as usize * cell_cols + bc as usize] {
                            let d2 = vr.abs_diff(r).pow(2) + vc.abs_diff(c).pow(2);
                            let candidate = (d2, vr, vc);
                            if best.map_or(true, |b| candidate < b) {
                                best = Some(candidate);
                            }
                        }
                    }
                }
                // 更外层单元中的点距离至少为 ring * CELL_SIZE
                if let Some((d2, _, _)) = best {
                    if d2 <= (ring * CELL_SIZE).pow(2) {
                        break;
                    }
                }
            }

            if let Some((_, vr, vc)) = best {
                filled[[r, c]] = data[[vr, vc]];
            }
        }
    }
    Ok(filled)
}

/// 可分离高斯平滑
///
/// 边界按反射方式延拓（`d c b a | a b c d | d c b a`），核截断于 4σ 并归一化。
pub fn gaussian_filter(data: &Array2<f64>, sigma: f64) -> Array2<f64> {
    if sigma.is_nan() || sigma <= 0.0 || data.is_empty() {
        return data.clone();
    }
    let kernel = gaussian_kernel_1d(sigma);
    let along_rows = convolve_axis(data, &kernel, Axis(1));
    convolve_axis(&along_rows, &kernel, Axis(0))
}

/// 归一化的一维高斯核，长度 `2 * ceil(4σ) + 1`
fn gaussian_kernel_1d(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma).ceil() as isize;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);
    kernel
}

fn reflect_index(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let m = i.rem_euclid(period) as usize;
    if m < n {
        m
    } else {
        2 * n - 1 - m
    }
}

fn convolve_axis(data: &Array2<f64>, kernel: &[f64], axis: Axis) -> Array2<f64> {
    let radius = (kernel.len() / 2) as isize;
    let mut out = Array2::zeros(data.dim());
    for (src, mut dst) in data.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let n = src.len();
        for i in 0..n {
            let mut sum = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let j = reflect_index(i as isize + k as isize - radius, n);
                sum += w * src[j];
            }
            dst[i] = sum;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_gaussian_kernel_normalized() {
        let kernel = gaussian_kernel_1d(1.5);
        assert_eq!(kernel.len(), 2 * 6 + 1);
        assert_relative_eq!(kernel.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(kernel[6] > kernel[5] && kernel[5] > kernel[4]);
    }

    #[test]
    fn test_gaussian_filter_preserves_constant() {
        let data = Array2::from_elem((7, 9), 3.5);
        let smoothed = gaussian_filter(&data, 2.0);
        for v in smoothed.iter() {
            assert_relative_eq!(*v, 3.5, epsilon = 1e-12);
        }
        // sigma = 0 不平滑
        assert_eq!(gaussian_filter(&data, 0.0), data);
    }

    #[test]
    fn test_gaussian_filter_spreads_impulse_symmetrically() {
        let mut data = Array2::zeros((21, 21));
        data[[10, 10]] = 1.0;
        let smoothed = gaussian_filter(&data, 1.0);
        assert_relative_eq!(smoothed.sum(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(smoothed[[9, 10]], smoothed[[11, 10]], epsilon = 1e-15);
        assert_relative_eq!(smoothed[[10, 9]], smoothed[[9, 10]], epsilon = 1e-15);
        assert!(smoothed[[10, 10]] < 1.0);
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(9, 2), 1);
    }

    #[test]
    fn test_nearest_valid_fill() {
        let data = array![
            [1.0, 1.0, 9.0, 2.0, 2.0],
            [1.0, 1.0, 9.0, 2.0, 2.0],
        ];
        let mask = array![
            [true, true, false, false, true],
            [true, true, false, false, true],
        ];
        let filled = nearest_valid_fill(&data, &mask).unwrap();
        // 第 2 列距第 1 列最近，第 3 列距第 4 列最近
        assert_eq!(filled.row(0).to_vec(), vec![1.0, 1.0, 1.0, 2.0, 2.0]);
        assert_eq!(filled.row(1).to_vec(), vec![1.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_nearest_fill_across_cells() {
        // 有效像素远离被填充像素，需跨越多个网格单元
        let mut data = Array2::from_elem((40, 60), 5.0);
        let mut mask = Array2::from_elem((40, 60), false);
        data[[39, 59]] = 7.0;
        mask[[39, 59]] = true;
        mask[[0, 0]] = true;
        mask[[0, 1]] = true;
        data[[0, 0]] = 3.0;
        data[[0, 1]] = 4.0;
        let filled = nearest_valid_fill(&data, &mask).unwrap();
        assert_eq!(filled[[0, 30]], 4.0);
        assert_eq!(filled[[38, 58]], 7.0);
        assert_eq!(filled[[1, 0]], 3.0);
    }

    #[test]
    fn test_insufficient_valid_pixels() {
        let data = array![[1.0, 0.0], [0.0, 1.0]];
        let mask = Array2::from_elem((2, 2), true);
        let frame = Frame::new(data, "quad1");
        let err = BackgroundEstimator::new(1.0).estimate(&frame, &mask).unwrap_err();
        assert!(matches!(
            err,
            XrdReduceError::InsufficientData {
                available: 2,
                required: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_subtract_background_requires_compounds() {
        let geometry = DetectorGeometry::new(0.0, 0.0, 0.0, FRAC_PI_2, 100.0);
        let frame = Frame::new(Array2::from_elem((4, 4), 1.0), "quad1");
        let mask = masking::base_mask(&frame);
        let err = subtract_background_full_frame(
            &frame,
            &geometry,
            &PowderAngleTable::new(),
            &mask,
            &[],
            1.5,
            &BackgroundEstimator::new(1.0),
        )
        .unwrap_err();
        assert!(matches!(err, XrdReduceError::NoCompounds));
    }

    #[test]
    fn test_subtract_background_rejects_mismatched_mask() {
        let geometry = DetectorGeometry::new(0.0, 0.0, 0.0, FRAC_PI_2, 100.0);
        let frame = Frame::new(Array2::from_elem((4, 4), 1.0), "quad1");
        let bad_mask = Array2::from_elem((4, 5), true);
        let table = PowderAngleTable::new().with_compound("Test", &[45.0]);
        let err = subtract_background_full_frame(
            &frame,
            &geometry,
            &table,
            &bad_mask,
            &["Test".to_string()],
            1.5,
            &BackgroundEstimator::new(1.0),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            XrdReduceError::MaskShapeMismatch {
                expected: (4, 4),
                found: (4, 5),
                ..
            }
        ));
    }

    #[test]
    fn test_subtract_background_keeps_peak() {
        // 第 c 列的 2θ = atan(c / 100)，第 100 列为 45°
        let geometry = DetectorGeometry::new(0.0, 0.0, 0.0, FRAC_PI_2, 100.0);
        let mut data = Array2::from_elem((3, 200), 10.0);
        for c in 99..=101 {
            data.column_mut(c).fill(50.0);
        }
        data[[1, 0]] = 0.0;
        let frame = Frame::new(data, "quad1");
        let bad_mask = masking::base_mask(&frame);
        let table = PowderAngleTable::new().with_compound("Test", &[45.0]);

        let result = subtract_background_full_frame(
            &frame,
            &geometry,
            &table,
            &bad_mask,
            &["Test".to_string()],
            2.0,
            &BackgroundEstimator::new(2.0),
        )
        .unwrap();

        assert_relative_eq!(result.data[[0, 100]], 40.0, epsilon = 1e-9);
        assert_relative_eq!(result.data[[2, 20]], 0.0, epsilon = 1e-9);
        assert_relative_eq!(result.data[[0, 180]], 0.0, epsilon = 1e-9);
        // 坏像素不产生虚假背景
        assert_eq!(result.data[[1, 0]], 0.0);
        // 原图不变
        assert_eq!(frame.data[[0, 100]], 50.0);
    }
}
