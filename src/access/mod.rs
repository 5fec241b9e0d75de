//! # 数据访问模块
//!
//! 约化核心只通过 `DataAccess` 这一窄接口获取原始图像与实验元数据。
//!
//! ## 子模块
//! - `logbook`: 实验日志本（CSV），标签 -> run 范围与实验参数
//! - `files`: 基于目录的 `.npy` 图像存储
//!
//! ## 依赖关系
//! - 被 `models/source.rs`、`xrd/pattern.rs`、`commands/` 使用
//! - 使用 `models/frame.rs`

pub mod files;
pub mod logbook;

pub use files::FileDataAccess;
pub use logbook::Logbook;

use crate::error::{Result, XrdReduceError};
use crate::models::{EventData, EventFn, Frame};

/// 数据访问接口
///
/// 实现必须可在线程间共享：并行约化时多个任务同时读取。
pub trait DataAccess: Send + Sync {
    /// 读取某数据集标签在指定探测器上的（平均）图像
    ///
    /// 提供 `event_fn` 时同时返回逐事件数据：对每个事件的图像调用一次回调。
    fn get_frame(
        &self,
        label: &str,
        detector_id: &str,
        event_fn: Option<&EventFn>,
    ) -> Result<(Frame, Option<EventData>)>;

    /// 读取数据集标签的实验元数据（如 `transmission`、`focal_size`）
    fn get_attribute(&self, label: &str, attribute: &str) -> Result<f64>;
}

/// 无日志本时的数据访问：只能处理直接给出的图像阵列，任何标签与属性查询都失败
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineAccess;

impl DataAccess for OfflineAccess {
    fn get_frame(
        &self,
        label: &str,
        _detector_id: &str,
        _event_fn: Option<&EventFn>,
    ) -> Result<(Frame, Option<EventData>)> {
        Err(XrdReduceError::UnknownLabel {
            label: label.to_string(),
        })
    }

    fn get_attribute(&self, label: &str, attribute: &str) -> Result<f64> {
        Err(XrdReduceError::UnknownAttribute {
            label: label.to_string(),
            attribute: attribute.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_access_rejects_lookups() {
        let access = OfflineAccess;
        assert!(matches!(
            access.get_frame("Fe3O4_low", "quad1", None),
            Err(XrdReduceError::UnknownLabel { .. })
        ));
        assert!(matches!(
            access.get_attribute("Fe3O4_low", "transmission"),
            Err(XrdReduceError::UnknownAttribute { .. })
        ));
    }
}
