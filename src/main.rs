//! # xrdreduce - XFEL 粉末衍射图样约化
//!
//! 将探测器图像约化为一维角度图样，拟合粉末衍射峰，并在不同能量密度的
//! 数据集之间归一化比较。
//!
//! ## 子命令
//! - `pattern` - 图像 -> 角度图样，峰拟合与导出
//! - `progression` - 峰强度随能量密度的变化
//!
//! ## 依赖关系
//! ```text
//! main.rs
//!   ├── cli/        (命令行参数定义)
//!   ├── commands/   (命令执行逻辑)
//!   │     ├── batch/     (并行约化)
//!   │     ├── access/    (日志本与图像读取)
//!   │     └── xrd/       (几何、背景、分箱、峰拟合、归一化)
//!   ├── models/     (图像与数据来源)
//!   ├── config.rs   (实验配置)
//!   ├── utils/      (工具函数)
//!   └── error.rs    (错误处理)
//! ```

mod access;
mod batch;
mod cli;
mod commands;
mod config;
mod error;
mod models;
mod utils;
mod xrd;

use clap::Parser;
use cli::Cli;

fn main() {
    // Initialize colored output for Windows compatibility
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let cli = Cli::parse();

    if let Err(e) = commands::run(cli.command) {
        utils::output::print_error(&format!("{}", e));
        std::process::exit(1);
    }
}
