//! # XRD 约化模块
//!
//! 从探测器图像得到粉末衍射角度图样，并完成峰拟合与跨数据集归一化。
//!
//! ## 子模块
//! - `geometry`: 像素坐标 -> 散射角
//! - `masking`: 基础掩膜、额外掩膜与粉末环掩膜
//! - `background`: 掩膜插值背景估计与扣除
//! - `binning`: 角度分箱
//! - `fitting`: Levenberg-Marquardt 求解器
//! - `peak`: 峰模型、参数约束与拟合
//! - `pattern`: 图样构造、合并与属性查询
//! - `normalization`: 归一化与峰强度变化
//! - `export`: 数据导出
//!
//! ## 依赖关系
//! - 被 `commands/` 使用
//! - 使用 `config.rs`、`models/`、`access/`

pub mod background;
pub mod binning;
pub mod export;
pub mod fitting;
pub mod geometry;
pub mod masking;
pub mod normalization;
pub mod pattern;
pub mod peak;

pub use normalization::{NormalizationMode, NormalizationRegistry, PeakProgression};
pub use pattern::{Pattern, PatternOptions, XrdDataset};
pub use peak::{ParamName, PeakFit, PeakShape, PeakSizeMethod};
