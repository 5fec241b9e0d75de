//! # 粉末衍射图样
//!
//! 由一个或多个探测器/数据集贡献组成的一维角度图样，持有峰集合并支持
//! 相加合并与归一化。
//!
//! ## 处理流程
//! 原始图像 → 掩膜 → （可选）背景扣除 → （可选）预平滑 → （可选）标定标记
//! → 几何变换 → 角度分箱 → 峰位查找
//!
//! ## 生命周期
//! - 构造后不可变；合并（`+`）与归一化都返回新图样
//! - 峰拟合在首次访问时执行并缓存；修改峰约束会清除缓存
//!
//! ## 依赖关系
//! - 使用 `xrd/` 下的几何、掩膜、背景、分箱与峰模型
//! - 使用 `access::DataAccess` 读取图像与元数据
//! - 被 `xrd/normalization.rs`、`commands/` 使用

use crate::access::DataAccess;
use crate::config::ExperimentConfig;
use crate::error::{Result, XrdReduceError};
use crate::models::{DataSource, Frame};
use crate::xrd::background::{self, BackgroundEstimator};
use crate::xrd::binning::{self, AngularProfile};
use crate::xrd::fitting::FitOptions;
use crate::xrd::geometry;
use crate::xrd::masking;
use crate::xrd::peak::{ParamName, PeakFit, PeakSet, PeakShape, PeakSizeMethod, StartingValues};

use std::ops::Add;
use std::sync::OnceLock;

/// 单个探测器上的数据集
#[derive(Debug, Clone)]
pub struct XrdDataset {
    pub source: DataSource,
    pub detector_id: String,
    /// 化合物列表，第一个为分析对象
    pub compounds: Vec<String>,
    /// 是否应用配置中的额外掩膜
    pub apply_mask: bool,
}

impl XrdDataset {
    pub fn new(source: DataSource, detector_id: &str, compounds: &[String]) -> Self {
        Self {
            source,
            detector_id: detector_id.to_string(),
            compounds: compounds.to_vec(),
            apply_mask: true,
        }
    }

    pub fn with_mask(mut self, apply_mask: bool) -> Self {
        self.apply_mask = apply_mask;
        self
    }

    pub fn label(&self) -> &str {
        self.source.label()
    }

    /// 读取图像并应用掩膜
    ///
    /// 掩膜后若最小值为负，非零像素整体上移 `|min|`，零值像素保持为零。
    pub fn load(&self, access: &dyn DataAccess, config: &ExperimentConfig) -> Result<Frame> {
        let (frame, _events) = self.source.fetch(access, &self.detector_id)?;
        let mut frame = if self.apply_mask {
            let info = config.detector(&self.detector_id)?;
            let combined = masking::combine_masks(&frame, &info.extra_masks)?;
            frame.masked(&combined.mask)?
        } else {
            frame
        };

        if let Some(min) = frame.min_value() {
            if min < 0.0 {
                frame.data.mapv_inplace(|v| if v != 0.0 { v - min } else { v });
            }
        }
        Ok(frame)
    }
}

/// 实数闭区间的并集
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealMask {
    intervals: Vec<(f64, f64)>,
}

impl RealMask {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            intervals: vec![(start, end)],
        }
    }

    pub fn intervals(&self) -> &[(f64, f64)] {
        &self.intervals
    }

    /// 是否落在任一区间内
    pub fn includes(&self, value: f64) -> bool {
        self.intervals
            .iter()
            .any(|&(lo, hi)| value >= lo && value <= hi)
    }
}

impl Add for RealMask {
    type Output = RealMask;

    fn add(mut self, other: RealMask) -> RealMask {
        self.intervals.extend(other.intervals);
        self
    }
}

/// 图样处理选项
#[derive(Debug, Clone)]
pub struct PatternOptions {
    pub nbins: usize,
    /// 是否扣除背景
    pub bgsub: bool,
    /// 分箱前高斯平滑的标准差（像素），0 表示不平滑
    pub pre_integration_smoothing: f64,
    /// 标定标记 `(angle, width)`
    pub fiducial_ellipses: Vec<(f64, f64)>,
    /// 峰拟合窗口全宽（度）
    pub peak_width: f64,
    pub shape: PeakShape,
    /// 每个峰的参数初值
    pub starting_values: Vec<StartingValues>,
    /// 每个峰的固定参数
    pub fixed_params: Vec<Vec<ParamName>>,
    pub fit: FitOptions,
}

impl Default for PatternOptions {
    fn default() -> Self {
        Self {
            nbins: 1000,
            bgsub: false,
            pre_integration_smoothing: 0.0,
            fiducial_ellipses: Vec::new(),
            peak_width: 1.5,
            shape: PeakShape::Gaussian,
            starting_values: Vec::new(),
            fixed_params: Vec::new(),
            fit: FitOptions::default(),
        }
    }
}

impl PatternOptions {
    /// 以实验配置中的默认值初始化
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            nbins: config.nbins,
            peak_width: config.peak_width,
            fit: config.fit,
            ..Self::default()
        }
    }
}

/// 图样的一个贡献来源
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub label: String,
    pub detector_id: String,
}

/// 粉末衍射图样
#[derive(Debug, Clone)]
pub struct Pattern {
    contributions: Vec<Contribution>,
    peak_width: f64,
    compounds: Vec<String>,
    /// 各贡献的角度图样，按合并顺序排列
    profiles: Vec<AngularProfile>,
    angle_mask: RealMask,
    peak_angles: Vec<f64>,
    peaks: PeakSet,
    label: String,
    fit_options: FitOptions,
    fits: OnceLock<Vec<PeakFit>>,
}

impl Pattern {
    /// 从数据集构造
    pub fn from_dataset(
        dataset: &XrdDataset,
        access: &dyn DataAccess,
        config: &ExperimentConfig,
        options: &PatternOptions,
    ) -> Result<Self> {
        let frame = dataset.load(access, config)?;
        Self::from_frame(frame, dataset.label(), &dataset.compounds, config, options)
    }

    /// 从（已掩膜的）图像构造
    pub fn from_frame(
        frame: Frame,
        label: &str,
        compounds: &[String],
        config: &ExperimentConfig,
        options: &PatternOptions,
    ) -> Result<Self> {
        let detector_geometry = config.detector(&frame.detector_id)?.geometry;
        let mut frame = frame;

        if options.bgsub {
            let bad_mask = masking::base_mask(&frame);
            frame = background::subtract_background_full_frame(
                &frame,
                &detector_geometry,
                &config.powder_angles,
                &bad_mask,
                compounds,
                config.ring_width(),
                &BackgroundEstimator::new(config.background.smoothing_sigma),
            )?;
        }

        if options.pre_integration_smoothing > 0.0 {
            let valid = masking::base_mask(&frame);
            let smoothed = Frame::new(
                background::gaussian_filter(&frame.data, options.pre_integration_smoothing),
                &frame.detector_id,
            );
            frame = smoothed.masked(&valid)?;
        }

        let angles = geometry::frame_angles(&detector_geometry, &frame);
        if !options.fiducial_ellipses.is_empty() {
            frame = geometry::inject_fiducials(&frame, &angles, &options.fiducial_ellipses);
        }

        let angle_values: Vec<f64> = angles.iter().copied().collect();
        let intensity_values: Vec<f64> = frame.data.iter().copied().collect();
        let profile = binning::bin(&angle_values, &intensity_values, options.nbins)?;

        let angle_mask = match profile.angle_range() {
            Some((lo, hi)) => RealMask::new(lo, hi),
            None => RealMask::default(),
        };
        let peak_angles = match compounds.first() {
            Some(compound) => config
                .powder_angles
                .filtered(compound, |a| angle_mask.includes(a))?,
            None => Vec::new(),
        };
        let peaks = PeakSet::new(
            &peak_angles,
            &options.starting_values,
            &options.fixed_params,
            options.shape,
            options.peak_width,
        )?;

        Ok(Self {
            contributions: vec![Contribution {
                label: label.to_string(),
                detector_id: frame.detector_id.clone(),
            }],
            peak_width: options.peak_width,
            compounds: compounds.to_vec(),
            profiles: vec![profile],
            angle_mask,
            peak_angles,
            peaks,
            label: label.to_string(),
            fit_options: options.fit,
            fits: OnceLock::new(),
        })
    }

    /// 从多个数据集构造并依次合并
    pub fn from_multiple(
        datasets: &[XrdDataset],
        access: &dyn DataAccess,
        config: &ExperimentConfig,
        options: &PatternOptions,
    ) -> Result<Self> {
        let mut patterns = datasets
            .iter()
            .map(|ds| Self::from_dataset(ds, access, config, options));
        let first = patterns.next().ok_or_else(|| {
            XrdReduceError::InvalidArgument("at least one dataset is required".to_string())
        })??;
        patterns.try_fold(first, |acc, next| -> Result<Pattern> { Ok(acc + next?) })
    }

    /// 合并两个图样，返回新图样
    ///
    /// # Panics
    /// 拟合窗口宽度或化合物列表不同时 panic。
    pub fn combine(a: &Pattern, b: &Pattern) -> Pattern {
        assert!(
            a.peak_width == b.peak_width,
            "cannot combine patterns with different peak widths ({} vs {})",
            a.peak_width,
            b.peak_width
        );
        assert!(
            a.compounds == b.compounds,
            "cannot combine patterns with different compound lists ({:?} vs {:?})",
            a.compounds,
            b.compounds
        );

        Pattern {
            contributions: [a.contributions.as_slice(), b.contributions.as_slice()].concat(),
            peak_width: a.peak_width,
            compounds: a.compounds.clone(),
            profiles: [a.profiles.as_slice(), b.profiles.as_slice()].concat(),
            angle_mask: a.angle_mask.clone() + b.angle_mask.clone(),
            peak_angles: [a.peak_angles.as_slice(), b.peak_angles.as_slice()].concat(),
            peaks: a.peaks.clone() + b.peaks.clone(),
            label: a.label.clone(),
            fit_options: a.fit_options,
            fits: OnceLock::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn contributions(&self) -> &[Contribution] {
        &self.contributions
    }

    pub fn compounds(&self) -> &[String] {
        &self.compounds
    }

    /// 分析化合物（化合物列表的第一个）
    pub fn compound(&self) -> Option<&str> {
        self.compounds.first().map(String::as_str)
    }

    pub fn peak_width(&self) -> f64 {
        self.peak_width
    }

    pub fn profiles(&self) -> &[AngularProfile] {
        &self.profiles
    }

    pub fn angle_mask(&self) -> &RealMask {
        &self.angle_mask
    }

    pub fn peak_angles(&self) -> &[f64] {
        &self.peak_angles
    }

    pub fn peaks(&self) -> &PeakSet {
        &self.peaks
    }

    /// 所有贡献的角度，按合并顺序拼接
    pub fn angles(&self) -> Vec<f64> {
        self.profiles
            .iter()
            .flat_map(|p| p.angles.iter().copied())
            .collect()
    }

    /// 所有贡献的强度，按合并顺序拼接
    pub fn intensities(&self) -> Vec<f64> {
        self.profiles
            .iter()
            .flat_map(|p| p.intensities.iter().copied())
            .collect()
    }

    /// 拟合所有有效峰（首次调用后缓存）
    pub fn fit_peaks(&self) -> Result<&[PeakFit]> {
        if let Some(fits) = self.fits.get() {
            return Ok(fits);
        }
        let fits = self.peaks.fit_peaks(
            &self.angles(),
            &self.intensities(),
            self.peak_width,
            &self.fit_options,
        )?;
        Ok(self.fits.get_or_init(|| fits))
    }

    /// 峰大小
    ///
    /// `Fit` 只包含有效峰；`Integral` 包含全部峰。
    pub fn peak_sizes(&self, method: PeakSizeMethod) -> Result<Vec<f64>> {
        match method {
            PeakSizeMethod::Fit => Ok(self.fit_peaks()?.iter().map(|f| f.amplitude).collect()),
            PeakSizeMethod::Integral => {
                let (x, y) = (self.angles(), self.intensities());
                Ok(self.peaks.peaks().iter().map(|p| p.integrate(&x, &y)).collect())
            }
        }
    }

    /// 固定第 `index` 个峰的参数，并清除拟合缓存
    pub fn constrain(&mut self, index: usize, param: ParamName, value: f64) -> Result<()> {
        self.peaks.constrain(index, param, value)?;
        self.fits = OnceLock::new();
        Ok(())
    }

    /// 读取所有贡献的元数据，要求取值一致
    pub fn get_attribute(&self, access: &dyn DataAccess, attribute: &str) -> Result<f64> {
        let values = self
            .contributions
            .iter()
            .map(|c| access.get_attribute(&c.label, attribute))
            .collect::<Result<Vec<f64>>>()?;
        let Some(&first) = values.first() else {
            return Err(XrdReduceError::UnknownAttribute {
                label: self.label.clone(),
                attribute: attribute.to_string(),
            });
        };
        if values.iter().all(|&v| v == first) {
            Ok(first)
        } else {
            Err(XrdReduceError::MetadataMismatch {
                attribute: attribute.to_string(),
                values,
            })
        }
    }

    /// 返回强度除以 `scale` 的新图样
    pub fn normalize(&self, scale: f64) -> Pattern {
        let mut normalized = self.clone();
        for profile in normalized.profiles.iter_mut() {
            profile.intensities.iter_mut().for_each(|v| *v /= scale);
        }
        normalized.fits = OnceLock::new();
        normalized
    }

    /// 背景水平：第一个峰拟合窗口以下的强度之和
    pub fn background_level(&self) -> Result<f64> {
        let first = self.peaks.peaks().first().ok_or_else(|| {
            XrdReduceError::InvalidArgument(format!(
                "pattern '{}' has no peaks to bound the background region",
                self.label
            ))
        })?;
        let max_angle = first.angle - self.peak_width / 2.0;
        Ok(self
            .angles()
            .iter()
            .zip(self.intensities())
            .filter(|(a, _)| **a < max_angle)
            .map(|(_, v)| v)
            .sum())
    }
}

impl Add<&Pattern> for &Pattern {
    type Output = Pattern;

    fn add(self, other: &Pattern) -> Pattern {
        Pattern::combine(self, other)
    }
}

impl Add for Pattern {
    type Output = Pattern;

    fn add(self, other: Pattern) -> Pattern {
        Pattern::combine(&self, &other)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DetectorGeometry;
    use crate::models::{EventData, EventFn};
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};
    use std::collections::BTreeMap;
    use std::f64::consts::FRAC_PI_2;

    /// 内存中的数据访问
    #[derive(Default)]
    pub(crate) struct MemoryAccess {
        pub frames: BTreeMap<String, Array2<f64>>,
        pub attributes: BTreeMap<(String, String), f64>,
    }

    impl MemoryAccess {
        pub fn with_attribute(mut self, label: &str, attribute: &str, value: f64) -> Self {
            self.attributes
                .insert((label.to_string(), attribute.to_string()), value);
            self
        }
    }

    impl DataAccess for MemoryAccess {
        fn get_frame(
            &self,
            label: &str,
            detector_id: &str,
            _event_fn: Option<&EventFn>,
        ) -> Result<(Frame, Option<EventData>)> {
            let data = self
                .frames
                .get(label)
                .ok_or_else(|| XrdReduceError::UnknownLabel {
                    label: label.to_string(),
                })?;
            Ok((Frame::new(data.clone(), detector_id), None))
        }

        fn get_attribute(&self, label: &str, attribute: &str) -> Result<f64> {
            self.attributes
                .get(&(label.to_string(), attribute.to_string()))
                .copied()
                .ok_or_else(|| XrdReduceError::UnknownAttribute {
                    label: label.to_string(),
                    attribute: attribute.to_string(),
                })
        }
    }

    /// 垂直入射、探测器中心在 (0, 0) 的单行探测器：第 c 列 2θ = atan(c / 1000)
    pub(crate) fn strip_config() -> ExperimentConfig {
        ExperimentConfig::new()
            .with_detector(
                "strip",
                DetectorGeometry::new(0.0, 0.0, 0.0, FRAC_PI_2, 1000.0),
                vec![],
            )
            .with_compound("Test", &[20.0, 35.0, 45.0, 80.0])
    }

    /// 在 35° 与 45° 处带高斯峰的单行图像
    pub(crate) fn strip_frame(scale: f64) -> Frame {
        let mut data = Array2::zeros((1, 3000));
        for c in 1..3000 {
            let angle = (c as f64 / 1000.0).atan().to_degrees();
            let peak = |center: f64, amp: f64| {
                amp * (-(angle - center).powi(2) / (2.0 * 0.3_f64.powi(2))).exp()
            };
            data[[0, c]] = scale * (1.0 + peak(35.0, 5.0) + peak(45.0, 8.0));
        }
        Frame::new(data, "strip")
    }

    pub(crate) fn strip_pattern(label: &str, scale: f64) -> Pattern {
        let config = strip_config();
        let options = PatternOptions::from_config(&config);
        Pattern::from_frame(
            strip_frame(scale),
            label,
            &["Test".to_string()],
            &config,
            &options,
        )
        .unwrap()
    }

    #[test]
    fn test_real_mask() {
        let mask = RealMask::new(10.0, 20.0) + RealMask::new(30.0, 40.0);
        assert!(mask.includes(10.0));
        assert!(mask.includes(35.0));
        assert!(!mask.includes(25.0));
        assert_eq!(mask.intervals().len(), 2);
    }

    #[test]
    fn test_flat_frame_gives_flat_profile() {
        let config = ExperimentConfig::new().with_detector(
            "quad1",
            DetectorGeometry::new(0.0, 50.0, 50.0, 0.0, 1000.0),
            vec![],
        );
        let options = PatternOptions {
            nbins: 10,
            ..PatternOptions::default()
        };
        let frame = Frame::new(Array2::from_elem((100, 100), 7.0), "quad1");
        let pattern = Pattern::from_frame(frame, "flat", &[], &config, &options).unwrap();

        let intensities = pattern.intensities();
        assert_eq!(intensities.len(), 10);
        for v in intensities {
            assert_relative_eq!(v, 7.0, epsilon = 1e-9);
        }
        assert!(pattern.peaks().is_empty());
    }

    #[test]
    fn test_peak_angles_filtered_by_range() {
        let pattern = strip_pattern("a", 1.0);
        // 最大角度 atan(2.999) ≈ 71.6°，80° 被排除
        assert_eq!(pattern.peak_angles(), &[20.0, 35.0, 45.0]);
        assert_eq!(pattern.compound(), Some("Test"));
    }

    #[test]
    fn test_fit_peaks_and_sizes() {
        let pattern = strip_pattern("a", 1.0);
        let fits = pattern.fit_peaks().unwrap();
        // 20° 的窗口 [19.25, 20.75] 在范围内
        assert_eq!(fits.len(), 3);
        assert_relative_eq!(fits[1].value(ParamName::Center).unwrap(), 35.0, epsilon = 0.05);
        assert!(fits[2].amplitude > fits[1].amplitude);

        let sizes = pattern.peak_sizes(PeakSizeMethod::Fit).unwrap();
        assert_eq!(sizes.len(), 3);
        let integrals = pattern.peak_sizes(PeakSizeMethod::Integral).unwrap();
        assert!(integrals[2] > integrals[0]);

        // 缓存结果与重新拟合一致
        let again = pattern.fit_peaks().unwrap();
        assert_eq!(fits[1].values, again[1].values);
    }

    #[test]
    fn test_combination_is_associative() {
        let a = strip_pattern("a", 1.0);
        let b = strip_pattern("b", 2.0);
        let c = strip_pattern("c", 3.0);

        let left = &(&a + &b) + &c;
        let right = &a + &(&b + &c);
        assert_eq!(left.angles(), right.angles());
        assert_eq!(left.intensities(), right.intensities());
        assert_eq!(left.peaks(), right.peaks());
        assert_eq!(left.peak_angles().len(), 9);
        assert_eq!(left.contributions().len(), 3);
        // 原图样不受影响
        assert_eq!(a.contributions().len(), 1);
    }

    #[test]
    #[should_panic(expected = "different compound lists")]
    fn test_combining_different_compounds_panics() {
        let config = strip_config();
        let options = PatternOptions::from_config(&config);
        let a = strip_pattern("a", 1.0);
        let b = Pattern::from_frame(strip_frame(1.0), "b", &[], &config, &options).unwrap();
        let _ = &a + &b;
    }

    #[test]
    fn test_normalize_returns_new_pattern() {
        let a = strip_pattern("a", 2.0);
        let n = a.normalize(2.0);
        let original = a.intensities();
        for (x, y) in original.iter().zip(n.intensities()) {
            assert_relative_eq!(x / 2.0, y, epsilon = 1e-12);
        }
        assert_eq!(n.label(), "a");
    }

    #[test]
    fn test_background_level() {
        let pattern = strip_pattern("a", 1.0);
        let expected: f64 = pattern
            .angles()
            .iter()
            .zip(pattern.intensities())
            .filter(|(a, _)| **a < 19.25)
            .map(|(_, v)| v)
            .sum();
        assert!(expected > 0.0);
        assert_relative_eq!(pattern.background_level().unwrap(), expected);
    }

    #[test]
    fn test_constrain_resets_fit_cache() {
        let mut pattern = strip_pattern("a", 1.0);
        let free_sigma = pattern.fit_peaks().unwrap()[1].value(ParamName::Sigma).unwrap();
        pattern.constrain(1, ParamName::Sigma, 0.5).unwrap();
        let fixed_sigma = pattern.fit_peaks().unwrap()[1].value(ParamName::Sigma).unwrap();
        assert_eq!(fixed_sigma, 0.5);
        assert!((free_sigma - 0.5).abs() > 1e-3);
    }

    #[test]
    fn test_get_attribute_requires_agreement() {
        let a = strip_pattern("a", 1.0);
        let b = strip_pattern("b", 1.0);
        let combined = &a + &b;

        let agree = MemoryAccess::default()
            .with_attribute("a", "transmission", 0.5)
            .with_attribute("b", "transmission", 0.5);
        assert_eq!(combined.get_attribute(&agree, "transmission").unwrap(), 0.5);

        let disagree = MemoryAccess::default()
            .with_attribute("a", "transmission", 0.5)
            .with_attribute("b", "transmission", 0.1);
        assert!(matches!(
            combined.get_attribute(&disagree, "transmission"),
            Err(XrdReduceError::MetadataMismatch { .. })
        ));
    }

    #[test]
    fn test_bgsub_without_compounds_fails() {
        let config = strip_config();
        let options = PatternOptions {
            bgsub: true,
            ..PatternOptions::from_config(&config)
        };
        let err = Pattern::from_frame(strip_frame(1.0), "a", &[], &config, &options).unwrap_err();
        assert!(matches!(err, XrdReduceError::NoCompounds));
    }

    #[test]
    fn test_dataset_load_shifts_negative_values() {
        let mut access = MemoryAccess::default();
        access
            .frames
            .insert("neg".to_string(), array![[0.0, -2.0], [1.0, 3.0]]);
        let config = strip_config();
        let dataset = XrdDataset::new(DataSource::labeled("neg"), "strip", &[]);
        let frame = dataset.load(&access, &config).unwrap();
        assert_eq!(frame.data, array![[0.0, 0.0], [3.0, 5.0]]);

        let raw = XrdDataset::new(DataSource::raw(array![[1.0, 2.0]], "raw"), "strip", &[]);
        assert_eq!(raw.load(&access, &config).unwrap().data, array![[1.0, 2.0]]);
        assert_eq!(raw.label(), "raw");
    }

    #[test]
    fn test_from_multiple_folds_datasets() {
        let mut access = MemoryAccess::default();
        access.frames.insert("a".to_string(), strip_frame(1.0).data);
        access.frames.insert("b".to_string(), strip_frame(2.0).data);
        let config = strip_config();
        let compounds = vec!["Test".to_string()];
        let datasets = vec![
            XrdDataset::new(DataSource::labeled("a"), "strip", &compounds),
            XrdDataset::new(DataSource::labeled("b"), "strip", &compounds),
        ];
        let options = PatternOptions::from_config(&config);
        let pattern = Pattern::from_multiple(&datasets, &access, &config, &options).unwrap();
        assert_eq!(pattern.profiles().len(), 2);
        assert_eq!(pattern.label(), "a");

        assert!(Pattern::from_multiple(&[], &access, &config, &options).is_err());
    }
}
