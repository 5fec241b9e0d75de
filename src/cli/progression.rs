//! # progression 子命令 CLI 定义
//!
//! ## 依赖关系
//! - 被 `cli/mod.rs` 使用
//! - 参数传递给 `commands/progression.rs`

use super::ReductionArgs;

use clap::Args;
use std::path::PathBuf;

/// progression 子命令参数
#[derive(Args, Debug)]
pub struct ProgressionArgs {
    /// Logbook labels to compare (requires --data-root and --logbook)
    #[arg(required = true)]
    pub labels: Vec<String>,

    #[command(flatten)]
    pub reduction: ReductionArgs,

    /// Normalization: transmission, maximum, peak, or a named function such as `flux`
    #[arg(long, default_value = "transmission")]
    pub normalization: String,

    /// Peak size measure: fit (fitted amplitude) or integral (summed window)
    #[arg(long, default_value = "fit")]
    pub method: String,

    /// Output CSV file
    #[arg(short, long, default_value = "progression.csv")]
    pub output: PathBuf,
}
