//! # 图样数据导出
//!
//! 导出角度图样、峰拟合结果与峰强度变化。
//!
//! ## 支持格式
//! - CSV: `2theta,intensity`（图样）、逐峰拟合参数、峰强度变化表
//! - XY: 带注释头的两列文本（2θ, intensity）
//!
//! ## 依赖关系
//! - 被 `commands/pattern.rs`、`commands/progression.rs` 调用
//! - 使用 `xrd/pattern.rs`、`xrd/normalization.rs` 的结果结构
//! - 使用 `csv` 库写入 CSV 文件

use crate::error::{Result, XrdReduceError};
use crate::xrd::normalization::PeakProgression;
use crate::xrd::pattern::Pattern;
use crate::xrd::peak::{ParamName, PeakFit};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

fn write_error(path: &Path) -> impl Fn(std::io::Error) -> XrdReduceError + '_ {
    move |e| XrdReduceError::FileWriteError {
        path: path.display().to_string(),
        source: e,
    }
}

/// 导出图样为 CSV 格式
pub fn profile_to_csv(pattern: &Pattern, output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;
    wtr.write_record(["2theta", "intensity"])?;

    for (two_theta, intensity) in pattern.angles().iter().zip(pattern.intensities()) {
        wtr.write_record(&[format!("{:.4}", two_theta), format!("{:.6}", intensity)])?;
    }

    wtr.flush().map_err(write_error(output_path))?;
    Ok(())
}

/// 导出图样为 XY 格式
pub fn profile_to_xy(pattern: &Pattern, output_path: &Path) -> Result<()> {
    let file = File::create(output_path).map_err(write_error(output_path))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "# Powder pattern: {}", pattern.label()).map_err(write_error(output_path))?;
    writeln!(out, "# Compounds: {}", pattern.compounds().join(", "))
        .map_err(write_error(output_path))?;
    writeln!(out, "# Columns: 2theta (degrees), Intensity").map_err(write_error(output_path))?;
    writeln!(out, "#").map_err(write_error(output_path))?;

    for (two_theta, intensity) in pattern.angles().iter().zip(pattern.intensities()) {
        writeln!(out, "{:.4}\t{:.6}", two_theta, intensity).map_err(write_error(output_path))?;
    }

    out.flush().map_err(write_error(output_path))?;
    Ok(())
}

/// 导出峰拟合结果为 CSV 格式
///
/// 高斯峰形没有 `fraction`，该列留空。
pub fn fits_to_csv(fits: &[PeakFit], output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;
    wtr.write_record([
        "angle",
        "amplitude",
        "center",
        "sigma",
        "slope",
        "intercept",
        "fraction",
        "converged",
        "residual",
        "iterations",
    ])?;

    let fmt = |v: Option<f64>| v.map(|x| format!("{:.6}", x)).unwrap_or_default();
    for fit in fits {
        wtr.write_record(&[
            format!("{:.4}", fit.angle),
            fmt(fit.value(ParamName::Amplitude)),
            fmt(fit.value(ParamName::Center)),
            fmt(fit.value(ParamName::Sigma)),
            fmt(fit.value(ParamName::Slope)),
            fmt(fit.value(ParamName::Intercept)),
            fmt(fit.value(ParamName::Fraction)),
            fit.converged.to_string(),
            format!("{:.6e}", fit.residual),
            fit.iterations.to_string(),
        ])?;
    }

    wtr.flush().map_err(write_error(output_path))?;
    Ok(())
}

/// 导出峰强度变化表
///
/// 每行一个标签；每个峰两列：归一化峰大小与相对第一个标签的比值。
pub fn progression_to_csv(progression: &PeakProgression, output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    let mut header = vec!["label".to_string(), "flux_density".to_string()];
    for angle in &progression.peak_angles {
        header.push(format!("{:.2}", angle));
        header.push(format!("{:.2}_relative", angle));
    }
    wtr.write_record(&header)?;

    for (j, label) in progression.labels.iter().enumerate() {
        let mut row = vec![label.clone(), format!("{:.6e}", progression.flux_densities[j])];
        for i in 0..progression.peak_angles.len() {
            row.push(format!("{:.6}", progression.progression[[i, j]]));
            row.push(format!("{:.6}", progression.relative[[i, j]]));
        }
        wtr.write_record(&row)?;
    }

    wtr.flush().map_err(write_error(output_path))?;
    Ok(())
}
