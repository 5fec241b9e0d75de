//! # progression 子命令实现
//!
//! 约化一组日志本数据集，按能量密度排序并比较各粉末衍射峰的大小。
//!
//! ## 依赖关系
//! - 使用 `cli/progression.rs` 定义的 ProgressionArgs
//! - 使用 `commands/reduction.rs` 的公共约化流程
//! - 使用 `xrd/normalization.rs` 计算峰强度变化
//! - 使用 `xrd/export.rs` 导出 CSV

use super::reduction::{report_failures, Reduction};
use crate::batch::BatchRunner;
use crate::cli::progression::ProgressionArgs;
use crate::error::{Result, XrdReduceError};
use crate::models::DataSource;
use crate::utils::{output, progress};
use crate::xrd::{
    export, normalization, NormalizationMode, NormalizationRegistry, Pattern, PeakProgression,
    PeakSizeMethod,
};

use tabled::{Table, Tabled};

/// 结果表行
#[derive(Tabled)]
struct ProgressionRow {
    #[tabled(rename = "Dataset")]
    label: String,
    #[tabled(rename = "Flux density (J/cm²)")]
    flux_density: String,
    #[tabled(rename = "Relative peak sizes")]
    relative: String,
}

/// 执行峰强度变化分析
pub fn execute(args: ProgressionArgs) -> Result<()> {
    output::print_header("Peak Progression");

    let reduction = Reduction::prepare(&args.reduction)?;
    if !reduction.has_logbook() {
        return Err(XrdReduceError::InvalidArgument(
            "progression reads datasets by label: --data-root and --logbook are required"
                .to_string(),
        ));
    }
    if reduction.compounds.is_empty() {
        return Err(XrdReduceError::InvalidArgument(
            "progression needs at least one --compound".to_string(),
        ));
    }

    let mode: NormalizationMode = args.normalization.parse()?;
    let method: PeakSizeMethod = args.method.parse()?;
    reduction.print_summary();
    output::print_field("Normalization", &mode.to_string());

    let sources: Vec<(String, DataSource)> = args
        .labels
        .iter()
        .map(|label| (label.clone(), DataSource::labeled(label)))
        .collect();

    let runner = BatchRunner::new(args.reduction.jobs);
    let result = reduction.reduce(&runner, sources)?;
    if result.failed() > 0 {
        report_failures(&result);
        return Err(XrdReduceError::InvalidArgument(format!(
            "{} of {} datasets could not be reduced",
            result.failed(),
            result.total()
        )));
    }
    let patterns: Vec<Pattern> = result.outputs.into_iter().map(|(_, p)| p).collect();

    let spinner = progress::create_spinner("Fitting peaks...");
    let registry = NormalizationRegistry::with_builtins(reduction.config.pulse_energy);
    let progression = normalization::peak_progression(
        &patterns,
        &mode,
        method,
        reduction.access.as_ref(),
        &registry,
        reduction.config.pulse_energy,
    );
    spinner.finish_and_clear();
    let progression = progression?;

    print_progression_table(&progression);

    export::progression_to_csv(&progression, &args.output)?;
    output::print_success(&format!(
        "Peak progression saved to '{}'",
        args.output.display()
    ));
    Ok(())
}

/// 打印结果表格
fn print_progression_table(progression: &PeakProgression) {
    let rows: Vec<ProgressionRow> = progression
        .labels
        .iter()
        .enumerate()
        .map(|(j, label)| ProgressionRow {
            label: label.clone(),
            flux_density: format!("{:.4e}", progression.flux_densities[j]),
            relative: progression
                .peak_angles
                .iter()
                .enumerate()
                .map(|(i, angle)| format!("{:.2}°: {:.3}", angle, progression.relative[[i, j]]))
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();

    output::print_header(&format!(
        "{}: {} peaks across {} datasets",
        progression.compound,
        progression.peak_angles.len(),
        progression.labels.len()
    ));
    println!("{}", Table::new(&rows));
}
