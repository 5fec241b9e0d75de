//! # 统一错误处理模块
//!
//! 定义 xrdreduce 的所有错误类型，使用 `thiserror` 派生。
//!
//! ## 错误分类
//! - 配置错误：几何参数缺失、掩膜尺寸不符、未登记的化合物
//! - 数据不足：背景插值可用像素过少
//! - 参数错误：无初值的固定参数、未知归一化方式等
//!
//! ## 依赖关系
//! - 被所有其他模块使用
//! - 无外部模块依赖

use thiserror::Error;

/// xrdreduce 统一错误类型
#[derive(Error, Debug)]
pub enum XrdReduceError {
    // ─────────────────────────────────────────────────────────────
    // I/O 错误
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to read file: {path}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file: {path}")]
    FileWriteError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to read .npy array: {path}\nReason: {reason}")]
    NpyReadError { path: String, reason: String },

    #[error("Failed to parse JSON file: {path}")]
    JsonError {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    // ─────────────────────────────────────────────────────────────
    // 配置错误
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Configuration error: no geometry registered for detector '{detector}'")]
    UnknownDetector { detector: String },

    #[error(
        "Configuration error: mask '{path}' for detector '{detector}' has shape {found:?}, frame has shape {expected:?}"
    )]
    MaskShapeMismatch {
        detector: String,
        path: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Frame shape mismatch for '{label}': expected {expected:?}, found {found:?}")]
    FrameShapeMismatch {
        label: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    // ─────────────────────────────────────────────────────────────
    // 查找错误
    // ─────────────────────────────────────────────────────────────
    #[error("No reference powder angles registered for compound '{compound}'")]
    UnknownCompound { compound: String },

    #[error("Dataset label '{label}' not found in logbook")]
    UnknownLabel { label: String },

    #[error("Attribute '{attribute}' not available for label '{label}'")]
    UnknownAttribute { label: String, attribute: String },

    // ─────────────────────────────────────────────────────────────
    // 数据不足
    // ─────────────────────────────────────────────────────────────
    #[error("Insufficient data for {context}: {available} usable points, need at least {required}")]
    InsufficientData {
        context: String,
        available: usize,
        required: usize,
    },

    // ─────────────────────────────────────────────────────────────
    // 参数错误
    // ─────────────────────────────────────────────────────────────
    #[error("Cannot fix parameter '{param}' without providing a starting value")]
    UnfixableParameter { param: String },

    #[error("Unknown peak model parameter '{name}'")]
    UnknownParameter { name: String },

    #[error("Normalization function '{name}' not found")]
    UnknownNormalization { name: String },

    #[error("Invalid peak size method '{name}' (expected 'fit' or 'integral')")]
    UnknownPeakSizeMethod { name: String },

    #[error("No compounds provided: background subtraction needs at least one compound")]
    NoCompounds,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ─────────────────────────────────────────────────────────────
    // 其他
    // ─────────────────────────────────────────────────────────────
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Attribute '{attribute}' disagrees across combined datasets: {values:?}")]
    MetadataMismatch { attribute: String, values: Vec<f64> },
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, XrdReduceError>;
