//! # 数据来源
//!
//! 一个数据集要么是直接给出的图像阵列（需附带标签），
//! 要么是日志本中的数据集标签，由数据访问层解析为 run 范围后读取。
//!
//! ## 依赖关系
//! - 被 `xrd/pattern.rs` 使用
//! - 使用 `access::DataAccess` 读取带标签的数据集

use crate::access::DataAccess;
use crate::error::Result;
use crate::models::{EventData, Frame};

use ndarray::Array2;

/// 数据来源
#[derive(Debug, Clone)]
pub enum DataSource {
    /// 直接给出的图像阵列
    RawArray { data: Array2<f64>, label: String },
    /// 日志本数据集标签
    LabeledDataset { label: String },
}

impl DataSource {
    pub fn raw(data: Array2<f64>, label: &str) -> Self {
        DataSource::RawArray {
            data,
            label: label.to_string(),
        }
    }

    pub fn labeled(label: &str) -> Self {
        DataSource::LabeledDataset {
            label: label.to_string(),
        }
    }

    /// 数据集标签
    pub fn label(&self) -> &str {
        match self {
            DataSource::RawArray { label, .. } | DataSource::LabeledDataset { label } => label,
        }
    }

    /// 读取指定探测器的图像
    pub fn fetch(
        &self,
        access: &dyn DataAccess,
        detector_id: &str,
    ) -> Result<(Frame, Option<EventData>)> {
        match self {
            DataSource::RawArray { data, .. } => Ok((Frame::new(data.clone(), detector_id), None)),
            DataSource::LabeledDataset { label } => access.get_frame(label, detector_id, None),
        }
    }
}
