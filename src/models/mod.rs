//! # 数据模型模块
//!
//! 定义探测器图像、像素掩膜与数据来源的统一表示。
//!
//! ## 依赖关系
//! - 被 `xrd/`、`access/`、`commands/` 使用
//! - 子模块: frame, source

pub mod frame;
pub mod source;

pub use frame::{EventData, EventFn, Frame, Mask};
pub use source::DataSource;
