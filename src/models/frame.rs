//! # 探测器图像与掩膜
//!
//! `Frame` 为二维强度阵列（行 × 列）及其探测器标识；`Mask` 为同形状布尔阵列，
//! `true` 表示有效像素。像素坐标约定：`x` 为列号，`y` 为行号。
//!
//! ## 依赖关系
//! - 被 `xrd/`、`access/` 使用
//! - 使用 `ndarray` 存储阵列

use crate::error::{Result, XrdReduceError};

use ndarray::{Array2, Zip};
use std::collections::BTreeMap;

/// 像素掩膜（`true` = 有效像素）
pub type Mask = Array2<bool>;

/// 逐事件数据：run 号 -> 事件号 -> 数值
pub type EventData = BTreeMap<u32, BTreeMap<u32, f64>>;

/// 逐事件回调：对单个事件的图像求一个数值
pub type EventFn = dyn Fn(&Array2<f64>) -> f64 + Send + Sync;

/// 探测器图像
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// 强度阵列
    pub data: Array2<f64>,
    /// 来源探测器
    pub detector_id: String,
}

impl Frame {
    pub fn new(data: Array2<f64>, detector_id: &str) -> Self {
        Self {
            data,
            detector_id: detector_id.to_string(),
        }
    }

    /// (行数, 列数)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// 检查掩膜与图像形状一致
    pub fn check_mask(&self, mask: &Mask, source: &str) -> Result<()> {
        if mask.dim() != self.shape() {
            return Err(XrdReduceError::MaskShapeMismatch {
                detector: self.detector_id.clone(),
                path: source.to_string(),
                expected: self.shape(),
                found: mask.dim(),
            });
        }
        Ok(())
    }

    /// 将掩膜外的像素置零，返回新图像
    pub fn masked(&self, mask: &Mask) -> Result<Frame> {
        self.check_mask(mask, "in-memory mask")?;
        let mut data = self.data.clone();
        Zip::from(&mut data).and(mask).for_each(|v, &keep| {
            if !keep {
                *v = 0.0;
            }
        });
        Ok(Frame {
            data,
            detector_id: self.detector_id.clone(),
        })
    }

    /// 有限值中的最小值
    pub fn min_value(&self) -> Option<f64> {
        self.data
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.min(v))))
    }

    /// 有限值中的最大值
    pub fn max_value(&self) -> Option<f64> {
        self.data
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))))
    }
}
