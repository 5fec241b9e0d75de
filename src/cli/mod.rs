//! # CLI 模块
//!
//! 使用 `clap` 定义命令行参数和子命令。
//!
//! ## 命令结构
//! - `pattern`: 图像 -> 角度图样，峰拟合与导出
//! - `progression`: 峰强度随能量密度的变化
//!
//! ## 依赖关系
//! - 被 `main.rs` 使用
//! - 子模块: pattern, progression

pub mod pattern;
pub mod progression;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// xrdreduce - XFEL 粉末衍射图样约化与峰拟合
#[derive(Parser)]
#[command(name = "xrdreduce")]
#[command(author = "Changjiang Wu")]
#[command(version)]
#[command(about = "Powder-pattern reduction and peak fitting for XFEL diffraction frames", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 可用的子命令
#[derive(Subcommand)]
pub enum Commands {
    /// Reduce detector frames to angular profiles and fit powder peaks
    Pattern(pattern::PatternArgs),

    /// Track peak sizes across datasets ordered by flux density
    Progression(progression::ProgressionArgs),
}

/// 两个子命令共用的约化参数
#[derive(Args, Debug, Clone)]
pub struct ReductionArgs {
    /// Experiment configuration (JSON: detector geometry, masks, powder angles)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Detector id to reduce (repeatable; default: every detector in the config)
    #[arg(short, long = "detector")]
    pub detectors: Vec<String>,

    /// Compound whose powder lines are fitted (repeatable; the first is analysed)
    #[arg(long = "compound")]
    pub compounds: Vec<String>,

    /// Root directory of run folders (`run_NNNN/<detector>.npy`)
    #[arg(long, requires = "logbook")]
    pub data_root: Option<PathBuf>,

    /// Experiment logbook CSV mapping labels to runs
    #[arg(long, requires = "data_root")]
    pub logbook: Option<PathBuf>,

    /// Number of angular bins (default from config)
    #[arg(long)]
    pub nbins: Option<usize>,

    /// Subtract the interpolated background before binning
    #[arg(long, default_value_t = false)]
    pub bgsub: bool,

    /// Do not apply the configured extra masks
    #[arg(long, default_value_t = false)]
    pub no_mask: bool,

    /// Full width of each peak fit window in degrees (default from config)
    #[arg(long)]
    pub peak_width: Option<f64>,

    /// Peak shape: gaussian or pseudo-voigt
    #[arg(long, default_value = "gaussian")]
    pub shape: String,

    /// Fix a peak parameter, e.g. `1:sigma=0.25` (repeatable)
    #[arg(long = "fix", value_name = "IDX:PARAM=VALUE")]
    pub fixes: Vec<String>,

    /// Gaussian smoothing sigma in pixels applied before binning (0 = off)
    #[arg(long, default_value_t = 0.0)]
    pub smoothing: f64,

    /// Number of parallel jobs (0 = auto)
    #[arg(short, long, default_value_t = 0)]
    pub jobs: usize,
}
