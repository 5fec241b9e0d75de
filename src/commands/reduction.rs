//! # 约化公共流程
//!
//! `pattern` 与 `progression` 共用的准备与并行约化步骤。
//!
//! ## 流程
//! 1. 加载配置，按命令行参数覆盖处理选项
//! 2. 有日志本时建立 `FileDataAccess`，否则只能处理直接给出的阵列
//! 3. 每个 (数据集, 探测器) 组合作为一个任务并行约化
//! 4. 同一数据集的各探测器图样按输入顺序用 `+` 依次合并
//!
//! ## 依赖关系
//! - 被 `commands/pattern.rs`、`commands/progression.rs` 调用
//! - 使用 `batch/`、`access/`、`xrd/pattern.rs`

use crate::access::{DataAccess, FileDataAccess, Logbook, OfflineAccess};
use crate::batch::{BatchResult, BatchRunner};
use crate::cli::ReductionArgs;
use crate::config::ExperimentConfig;
use crate::error::{Result, XrdReduceError};
use crate::models::DataSource;
use crate::utils::output;
use crate::xrd::{ParamName, Pattern, PatternOptions, PeakShape, XrdDataset};

/// 命令行 `--fix` 约束
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedParam {
    pub index: usize,
    pub param: ParamName,
    pub value: f64,
}

/// 解析 `IDX:PARAM=VALUE`
pub fn parse_fix(text: &str) -> Result<FixedParam> {
    let invalid = || {
        XrdReduceError::InvalidArgument(format!(
            "invalid --fix '{}' (expected IDX:PARAM=VALUE, e.g. 1:sigma=0.25)",
            text
        ))
    };

    let (index, rest) = text.split_once(':').ok_or_else(invalid)?;
    let (param, value) = rest.split_once('=').ok_or_else(invalid)?;

    Ok(FixedParam {
        index: index.trim().parse().map_err(|_| invalid())?,
        param: param.parse()?,
        value: value.trim().parse().map_err(|_| invalid())?,
    })
}

/// 准备好的约化上下文
pub struct Reduction {
    pub config: ExperimentConfig,
    pub access: Box<dyn DataAccess>,
    pub options: PatternOptions,
    pub detectors: Vec<String>,
    pub compounds: Vec<String>,
    pub apply_mask: bool,
    pub fixes: Vec<FixedParam>,
    has_logbook: bool,
}

impl Reduction {
    /// 由命令行参数准备约化上下文
    pub fn prepare(args: &ReductionArgs) -> Result<Self> {
        let config = ExperimentConfig::from_file(&args.config)?;

        let detectors: Vec<String> = if args.detectors.is_empty() {
            config.detectors.keys().cloned().collect()
        } else {
            args.detectors.clone()
        };
        if detectors.is_empty() {
            return Err(XrdReduceError::ConfigurationError(format!(
                "no detectors defined in '{}'",
                args.config.display()
            )));
        }
        for id in &detectors {
            config.detector(id)?;
        }
        for compound in &args.compounds {
            config.powder_angles.get(compound)?;
        }

        let mut options = PatternOptions::from_config(&config);
        if let Some(nbins) = args.nbins {
            options.nbins = nbins;
        }
        if let Some(width) = args.peak_width {
            options.peak_width = width;
        }
        options.shape = args.shape.parse::<PeakShape>()?;
        options.pre_integration_smoothing = args.smoothing;
        options.bgsub = args.bgsub;
        if options.bgsub && args.compounds.is_empty() {
            output::print_warning("No compounds provided: disabling background subtraction");
            options.bgsub = false;
        }

        let fixes = args
            .fixes
            .iter()
            .map(String::as_str)
            .map(parse_fix)
            .collect::<Result<Vec<_>>>()?;

        let (access, has_logbook): (Box<dyn DataAccess>, bool) =
            match (&args.data_root, &args.logbook) {
                (Some(root), Some(logbook)) => {
                    let logbook = Logbook::from_csv(logbook, config.best_focus_size)?;
                    (Box::new(FileDataAccess::new(root.clone(), logbook)), true)
                }
                _ => (Box::new(OfflineAccess), false),
            };

        Ok(Self {
            config,
            access,
            options,
            detectors,
            compounds: args.compounds.clone(),
            apply_mask: !args.no_mask,
            fixes,
            has_logbook,
        })
    }

    /// 是否可以按标签读取数据集
    pub fn has_logbook(&self) -> bool {
        self.has_logbook
    }

    /// 打印处理参数
    pub fn print_summary(&self) {
        output::print_field("Detectors", &self.detectors.join(", "));
        let compounds = if self.compounds.is_empty() {
            "(none)".to_string()
        } else {
            self.compounds.join(", ")
        };
        output::print_field("Compounds", &compounds);
        output::print_field("Bins", &self.options.nbins.to_string());
        output::print_field("Peak width", &format!("{:.3}°", self.options.peak_width));
        output::print_field("Peak shape", &self.options.shape.to_string());
        output::print_field(
            "Background",
            if self.options.bgsub { "subtracted" } else { "kept" },
        );
    }

    /// 直接给出的阵列只属于一个探测器：使用第一个探测器
    fn detectors_for(&self, source: &DataSource) -> &[String] {
        match source {
            DataSource::RawArray { .. } => &self.detectors[..1],
            DataSource::LabeledDataset { .. } => &self.detectors,
        }
    }

    /// 并行约化所有数据集，结果按输入顺序排列
    pub fn reduce(
        &self,
        runner: &BatchRunner,
        sources: Vec<(String, DataSource)>,
    ) -> Result<BatchResult<Pattern>> {
        if self.detectors.len() > 1
            && sources
                .iter()
                .any(|(_, s)| matches!(s, DataSource::RawArray { .. }))
        {
            output::print_warning(&format!(
                "Raw frame inputs are reduced on detector '{}' only",
                self.detectors[0]
            ));
        }

        // 任务按数据集在输入中的位置归属，标签可以重复
        let mut owners = Vec::new();
        let mut jobs = Vec::new();
        for (index, (_, source)) in sources.iter().enumerate() {
            for detector in self.detectors_for(source) {
                owners.push(index);
                jobs.push(
                    XrdDataset::new(source.clone(), detector, &self.compounds)
                        .with_mask(self.apply_mask),
                );
            }
        }

        let access = self.access.as_ref();
        let contributions = runner.run(&jobs, |dataset| {
            Pattern::from_dataset(dataset, access, &self.config, &self.options)
        })?;

        Ok(self.merge(sources, &owners, contributions))
    }

    /// 合并同一数据集的各探测器图样并应用 `--fix` 约束
    ///
    /// `owners[i]` 是第 `i` 个任务所属数据集在 `sources` 中的下标。
    /// 任一探测器失败时整个数据集记为失败。
    fn merge(
        &self,
        sources: Vec<(String, DataSource)>,
        owners: &[usize],
        contributions: Vec<Result<Pattern>>,
    ) -> BatchResult<Pattern> {
        let mut grouped: Vec<Vec<Result<Pattern>>> = sources.iter().map(|_| Vec::new()).collect();
        for (&owner, result) in owners.iter().zip(contributions) {
            grouped[owner].push(result);
        }

        let mut merged = BatchResult::default();
        for ((label, _), parts) in sources.into_iter().zip(grouped) {
            let result = parts
                .into_iter()
                .collect::<Result<Vec<_>>>()
                .and_then(|parts| {
                    parts.into_iter().reduce(|acc, next| acc + next).ok_or_else(|| {
                        XrdReduceError::InvalidArgument(format!("no detectors for '{}'", label))
                    })
                })
                .and_then(|mut pattern| {
                    for fix in &self.fixes {
                        pattern.constrain(fix.index, fix.param, fix.value)?;
                    }
                    Ok(pattern)
                });
            merged.merge(label, result);
        }

        merged
    }
}

/// 打印失败汇总
pub fn report_failures<R>(result: &BatchResult<R>) {
    if result.failures.is_empty() {
        return;
    }
    output::print_warning("Failed datasets:");
    for (label, err) in result.failures.iter().take(10) {
        output::print_error(&format!("  {}: {}", label, err));
    }
    if result.failures.len() > 10 {
        output::print_warning(&format!("  ... and {} more", result.failures.len() - 10));
    }
}
