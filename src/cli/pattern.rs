//! # pattern 子命令 CLI 定义
//!
//! ## 依赖关系
//! - 被 `cli/mod.rs` 使用
//! - 参数传递给 `commands/pattern.rs`

use super::ReductionArgs;

use clap::{Args, ValueEnum};
use std::path::PathBuf;

/// 图样输出格式
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum PatternFormat {
    /// CSV data file (2theta,intensity)
    #[default]
    Csv,
    /// XY data file with commented header
    Xy,
}

impl PatternFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PatternFormat::Csv => "csv",
            PatternFormat::Xy => "xy",
        }
    }
}

/// pattern 子命令参数
#[derive(Args, Debug)]
pub struct PatternArgs {
    /// Inputs: `.npy` frame files, directories of frames, or logbook labels
    #[arg(required = true)]
    pub inputs: Vec<String>,

    #[command(flatten)]
    pub reduction: ReductionArgs,

    /// Normalization: transmission, maximum, peak, or a named function such as `flux`
    #[arg(long)]
    pub normalization: Option<String>,

    /// Glob pattern for frame files in directory inputs (comma separated)
    #[arg(long, default_value = "*.npy")]
    pub pattern: String,

    /// Recurse into subdirectories of directory inputs
    #[arg(long, default_value_t = false)]
    pub recursive: bool,

    /// Output directory
    #[arg(short, long, default_value = "patterns")]
    pub output: PathBuf,

    /// Profile output format
    #[arg(short, long, value_enum, default_value = "csv")]
    pub format: PatternFormat,
}
