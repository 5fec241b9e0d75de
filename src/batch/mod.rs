//! # 批量处理模块
//!
//! 并行约化多个数据集。
//!
//! ## 功能
//! - 收集 `.npy` 图像文件列表
//! - 并行约化，结果按输入顺序返回
//! - 进度反馈与失败汇总
//!
//! ## 依赖关系
//! - 被 `commands/` 使用
//! - 使用 `rayon` 进行并行处理
//! - 使用 `indicatif` 显示进度

pub mod collector;
pub mod runner;

pub use collector::FileCollector;
pub use runner::{BatchResult, BatchRunner};
