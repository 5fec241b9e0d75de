//! # 探测器几何变换
//!
//! 将像素坐标映射为散射角 2θ（度）与到样品的距离。
//!
//! ## 模型
//! 1. 以 `(x0, y0)` 为中心将像素坐标旋转 `phi`：
//!    `x1 = dx cos φ - dy sin φ`, `y1 = dx sin φ + dy cos φ`
//! 2. 以倾角 `alpha`、距离 `r` 投影到实验室坐标（z 沿入射光）：
//!    `x2 = x1 sin α - r cos α`, `z1 = x1 cos α + r sin α`
//! 3. `2θ = atan2(sqrt(y1² + x2²), z1)`，距离 `= sqrt(x2² + y1² + z1²) = sqrt(r² + x1² + y1²)`
//!
//! `alpha = π/2` 时探测器垂直于入射光。非有限输入按 IEEE 规则传播为 NaN/Inf，
//! 由分箱步骤剔除。
//!
//! ## 依赖关系
//! - 被 `xrd/masking.rs`、`xrd/pattern.rs` 调用
//! - 使用 `config::DetectorGeometry`

use crate::config::DetectorGeometry;
use crate::models::Frame;

use ndarray::Array2;

/// 单个像素的几何映射结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelPosition {
    /// 散射角 2θ（度）
    pub two_theta: f64,
    /// 样品到像素的距离（像素单位）
    pub distance: f64,
}

/// 计算单个像素的散射角与距离
///
/// `x` 为列坐标，`y` 为行坐标。
pub fn pixel_position(geometry: &DetectorGeometry, x: f64, y: f64) -> PixelPosition {
    let (sin_phi, cos_phi) = geometry.phi.sin_cos();
    let (sin_alpha, cos_alpha) = geometry.alpha.sin_cos();

    let dx = x - geometry.x0;
    let dy = y - geometry.y0;
    let x1 = dx * cos_phi - dy * sin_phi;
    let y1 = dx * sin_phi + dy * cos_phi;

    let x2 = x1 * sin_alpha - geometry.r * cos_alpha;
    let z1 = x1 * cos_alpha + geometry.r * sin_alpha;

    PixelPosition {
        two_theta: (y1 * y1 + x2 * x2).sqrt().atan2(z1).to_degrees(),
        distance: (x2 * x2 + y1 * y1 + z1 * z1).sqrt(),
    }
}

/// 整幅图像的角度与距离映射
#[derive(Debug, Clone)]
pub struct AngleMap {
    /// 每个像素的 2θ（度）
    pub two_theta: Array2<f64>,
    /// 每个像素到样品的距离
    pub distance: Array2<f64>,
}

/// 计算给定形状探测器上每个像素的散射角与距离
pub fn angle_map(geometry: &DetectorGeometry, shape: (usize, usize)) -> AngleMap {
    let mut two_theta = Array2::zeros(shape);
    let mut distance = Array2::zeros(shape);
    for ((row, col), value) in two_theta.indexed_iter_mut() {
        let pos = pixel_position(geometry, col as f64, row as f64);
        *value = pos.two_theta;
        distance[[row, col]] = pos.distance;
    }
    AngleMap {
        two_theta,
        distance,
    }
}

/// 计算图像每个像素的散射角（度）
pub fn frame_angles(geometry: &DetectorGeometry, frame: &Frame) -> Array2<f64> {
    angle_map(geometry, frame.shape()).two_theta
}

/// 在指定角度处注入标定标记
///
/// 散射角落在任一 `(angle, width)` 的 `±width/2` 内的有效像素被置为图像最大值。
pub fn inject_fiducials(frame: &Frame, angles: &Array2<f64>, fiducials: &[(f64, f64)]) -> Frame {
    let mut out = frame.clone();
    let Some(marker) = frame.max_value() else {
        return out;
    };
    for (value, angle) in out.data.iter_mut().zip(angles.iter()) {
        if *value == 0.0 {
            continue;
        }
        if fiducials
            .iter()
            .any(|(center, width)| (angle - center).abs() <= width / 2.0)
        {
            *value = marker;
        }
    }
    out
}
