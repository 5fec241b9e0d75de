//! # pattern 子命令实现
//!
//! 将探测器图像约化为角度图样，拟合粉末衍射峰并导出结果。
//!
//! ## 功能
//! - 输入可以是 `.npy` 文件、包含 `.npy` 的目录或日志本标签
//! - 多探测器并行约化后按顺序合并
//! - 可选归一化（transmission / maximum / peak / 命名函数）
//! - 导出图样 (CSV/XY) 与峰拟合结果 (CSV)，并打印峰表
//!
//! ## 依赖关系
//! - 使用 `cli/pattern.rs` 定义的 PatternArgs
//! - 使用 `commands/reduction.rs` 的公共约化流程
//! - 使用 `batch/` 收集文件与并行处理
//! - 使用 `xrd/normalization.rs`、`xrd/export.rs`

use super::reduction::{report_failures, Reduction};
use crate::access::files::read_frame;
use crate::batch::{BatchRunner, FileCollector};
use crate::cli::pattern::{PatternArgs, PatternFormat};
use crate::error::{Result, XrdReduceError};
use crate::models::DataSource;
use crate::utils::output;
use crate::xrd::{
    export, normalization, NormalizationMode, NormalizationRegistry, ParamName, Pattern, PeakFit,
};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};

/// 峰表行
#[derive(Tabled)]
struct PeakRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "2θ ref (°)")]
    angle: String,
    #[tabled(rename = "Center (°)")]
    center: String,
    #[tabled(rename = "Amplitude")]
    amplitude: String,
    #[tabled(rename = "Sigma (°)")]
    sigma: String,
    #[tabled(rename = "Residual")]
    residual: String,
    #[tabled(rename = "Converged")]
    converged: String,
}

/// 归一化因子表行
#[derive(Tabled)]
struct FactorRow {
    #[tabled(rename = "Dataset")]
    label: String,
    #[tabled(rename = "Factor")]
    factor: String,
}

/// 执行图样约化
pub fn execute(args: PatternArgs) -> Result<()> {
    output::print_header("Powder Pattern Reduction");

    let reduction = Reduction::prepare(&args.reduction)?;
    reduction.print_summary();

    let sources = collect_sources(&args, &reduction)?;
    if sources.is_empty() {
        output::print_warning(&format!(
            "No matching frames found with pattern '{}'",
            args.pattern
        ));
        return Ok(());
    }
    output::print_info(&format!("Reducing {} datasets", sources.len()));

    let runner = BatchRunner::new(args.reduction.jobs);
    let result = reduction.reduce(&runner, sources)?;

    output::print_separator();
    output::print_success(&format!(
        "Reduction complete: {} success, {} failed",
        result.success(),
        result.failed()
    ));
    report_failures(&result);

    let mut patterns: Vec<Pattern> = result.outputs.into_iter().map(|(_, p)| p).collect();
    if patterns.is_empty() {
        return Err(XrdReduceError::InvalidArgument(
            "no dataset could be reduced".to_string(),
        ));
    }

    if let Some(name) = &args.normalization {
        let mode: NormalizationMode = name.parse()?;
        let registry = NormalizationRegistry::with_builtins(reduction.config.pulse_energy);
        let access = reduction.access.as_ref();

        let factors = normalization::get_normalization(&patterns, &mode, access, &registry)?;
        print_factor_table(&patterns, &factors, &mode);
        patterns = normalization::normalize(&patterns, &mode, access, &registry)?;
    }

    fs::create_dir_all(&args.output).map_err(|e| XrdReduceError::FileWriteError {
        path: args.output.display().to_string(),
        source: e,
    })?;

    for pattern in &patterns {
        write_pattern(pattern, &args.output, args.format)?;
    }

    output::print_done(&format!(
        "{} patterns written to '{}'",
        patterns.len(),
        args.output.display()
    ));
    Ok(())
}

/// 解析输入：存在的路径按 `.npy` 图像读取，其余视为日志本标签
fn collect_sources(args: &PatternArgs, reduction: &Reduction) -> Result<Vec<(String, DataSource)>> {
    let mut sources = Vec::new();

    for input in &args.inputs {
        let path = Path::new(input);
        if path.exists() {
            let files = FileCollector::new(path.to_path_buf())
                .with_pattern(&args.pattern)
                .recursive(args.recursive)
                .collect();
            let labels = frame_labels(path, &files);
            for (file, label) in files.iter().zip(labels) {
                if sources.iter().any(|(l, _)| *l == label) {
                    return Err(XrdReduceError::InvalidArgument(format!(
                        "'{}' and an earlier input both reduce to dataset '{}'",
                        file.display(),
                        label
                    )));
                }
                let data = read_frame(file)?;
                sources.push((label.clone(), DataSource::raw(data, &label)));
            }
        } else if reduction.has_logbook() {
            sources.push((input.clone(), DataSource::labeled(input)));
        } else {
            return Err(XrdReduceError::InvalidArgument(format!(
                "input '{}' is not a file or directory; dataset labels need --data-root and --logbook",
                input
            )));
        }
    }

    Ok(sources)
}

/// 为收集到的图像文件生成标签
///
/// 默认取文件名主干；主干重复时（如 `run_0001/quad1.npy` 与 `run_0002/quad1.npy`）
/// 改用相对 `root` 的路径，各级以 `_` 连接，保证输出文件互不覆盖。
fn frame_labels(root: &Path, files: &[PathBuf]) -> Vec<String> {
    let stem = |file: &Path| {
        file.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("frame")
            .to_string()
    };

    let mut counts: HashMap<String, usize> = HashMap::new();
    for file in files {
        *counts.entry(stem(file)).or_default() += 1;
    }

    files
        .iter()
        .map(|file| {
            let label = stem(file);
            if counts[&label] == 1 {
                return label;
            }
            let relative = file.strip_prefix(root).unwrap_or(file).with_extension("");
            relative
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect::<Vec<_>>()
                .join("_")
        })
        .collect()
}

/// 写出单个图样及其峰拟合结果
fn write_pattern(pattern: &Pattern, dir: &Path, format: PatternFormat) -> Result<()> {
    let profile_path = dir.join(format!("{}.{}", pattern.label(), format.extension()));
    match format {
        PatternFormat::Csv => export::profile_to_csv(pattern, &profile_path)?,
        PatternFormat::Xy => export::profile_to_xy(pattern, &profile_path)?,
    }
    output::print_success(&format!(
        "{} -> {}",
        pattern.label(),
        profile_path.display()
    ));

    if pattern.peaks().is_empty() {
        return Ok(());
    }

    match pattern.fit_peaks() {
        Ok(fits) => {
            let fits_path = dir.join(format!("{}_peaks.csv", pattern.label()));
            export::fits_to_csv(fits, &fits_path)?;
            print_peak_table(pattern.label(), fits);
            for fit in fits.iter().filter(|f| !f.converged) {
                output::print_warning(&format!(
                    "Peak at {:.2}° did not converge after {} iterations (residual {:.3e})",
                    fit.angle, fit.iterations, fit.residual
                ));
            }
        }
        Err(e) => output::print_warning(&format!(
            "Peak fit failed for '{}': {}",
            pattern.label(),
            e
        )),
    }
    Ok(())
}

/// 打印峰拟合表格
fn print_peak_table(label: &str, fits: &[PeakFit]) {
    let fmt = |v: Option<f64>, digits: usize| {
        v.map(|x| format!("{:.*}", digits, x))
            .unwrap_or_else(|| "-".to_string())
    };

    let rows: Vec<PeakRow> = fits
        .iter()
        .enumerate()
        .map(|(i, fit)| PeakRow {
            index: i,
            angle: format!("{:.3}", fit.angle),
            center: fmt(fit.value(ParamName::Center), 3),
            amplitude: format!("{:.4}", fit.amplitude),
            sigma: fmt(fit.value(ParamName::Sigma), 4),
            residual: format!("{:.3e}", fit.residual),
            converged: if fit.converged { "yes" } else { "no" }.to_string(),
        })
        .collect();

    if !rows.is_empty() {
        output::print_header(&format!("Fitted peaks: {}", label));
        println!("{}", Table::new(&rows));
    }
}

/// 打印归一化因子表格
fn print_factor_table(patterns: &[Pattern], factors: &[f64], mode: &NormalizationMode) {
    let rows: Vec<FactorRow> = patterns
        .iter()
        .zip(factors)
        .map(|(p, f)| FactorRow {
            label: p.label().to_string(),
            factor: format!("{:.6e}", f),
        })
        .collect();

    output::print_header(&format!("Normalization ({})", mode));
    println!("{}", Table::new(&rows));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_labels_use_stem_when_unique() {
        let root = Path::new("/data");
        let files = vec![
            PathBuf::from("/data/run_0001/quad1.npy"),
            PathBuf::from("/data/run_0001/quad2.npy"),
        ];
        assert_eq!(frame_labels(root, &files), vec!["quad1", "quad2"]);
    }

    #[test]
    fn test_frame_labels_disambiguate_repeated_stems() {
        let root = Path::new("/data");
        let files = vec![
            PathBuf::from("/data/run_0001/quad1.npy"),
            PathBuf::from("/data/run_0002/quad1.npy"),
            PathBuf::from("/data/run_0002/quad2.npy"),
        ];
        assert_eq!(
            frame_labels(root, &files),
            vec!["run_0001_quad1", "run_0002_quad1", "quad2"]
        );
    }

    #[test]
    fn test_frame_labels_single_file_input() {
        let file = PathBuf::from("/data/run_0001/quad1.npy");
        assert_eq!(frame_labels(&file, std::slice::from_ref(&file)), vec!["quad1"]);
    }
}
