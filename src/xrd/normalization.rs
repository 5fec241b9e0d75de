//! # 图样归一化
//!
//! 计算每个图样的归一化因子，使不同通量下的数据可以比较。
//!
//! ## 归一化方式
//! | 名称 | 计算 |
//! |------|------|
//! | `transmission` | 日志本中的透过率 |
//! | `maximum` | 2θ > 15° 范围内的最大强度 |
//! | `peak` | 第二个峰（下标 1）的拟合振幅 |
//! | `background` | 保留，未实现 |
//! | 其他名称 | 注册表中同名函数，参数为数据集标签 |
//!
//! ## 依赖关系
//! - 使用 `xrd/pattern.rs`
//! - 使用 `access::DataAccess` 读取元数据
//! - 被 `commands/` 使用

use crate::access::DataAccess;
use crate::error::{Result, XrdReduceError};
use crate::xrd::pattern::Pattern;
use crate::xrd::peak::PeakSizeMethod;

use ndarray::Array2;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// `maximum` 模式只考虑高于该角度的强度
const MAXIMUM_MIN_ANGLE: f64 = 15.0;

/// 归一化方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizationMode {
    Transmission,
    Maximum,
    Peak,
    /// 保留
    Background,
    /// 注册表中的命名函数
    Named(String),
}

impl FromStr for NormalizationMode {
    type Err = XrdReduceError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "transmission" => NormalizationMode::Transmission,
            "maximum" => NormalizationMode::Maximum,
            "peak" => NormalizationMode::Peak,
            "background" => NormalizationMode::Background,
            other => NormalizationMode::Named(other.to_string()),
        })
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizationMode::Transmission => f.write_str("transmission"),
            NormalizationMode::Maximum => f.write_str("maximum"),
            NormalizationMode::Peak => f.write_str("peak"),
            NormalizationMode::Background => f.write_str("background"),
            NormalizationMode::Named(name) => f.write_str(name),
        }
    }
}

/// 命名归一化函数：(数据访问, 标签) -> 因子
pub type NormalizationFn = Box<dyn Fn(&dyn DataAccess, &str) -> Result<f64> + Send + Sync>;

/// 命名归一化函数注册表
#[derive(Default)]
pub struct NormalizationRegistry {
    functions: BTreeMap<String, NormalizationFn>,
}

impl NormalizationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置函数（`flux`）
    pub fn with_builtins(pulse_energy: f64) -> Self {
        let mut registry = Self::new();
        registry.register("flux", move |access, label| flux(access, label, pulse_energy));
        registry
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&dyn DataAccess, &str) -> Result<f64> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Box::new(function));
    }

    pub fn get(&self, name: &str) -> Result<&NormalizationFn> {
        self.functions
            .get(name)
            .ok_or_else(|| XrdReduceError::UnknownNormalization {
                name: name.to_string(),
            })
    }
}

impl fmt::Debug for NormalizationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.functions.keys()).finish()
    }
}

/// 焦斑面积（cm²），`focal_size` 为直径（微米）
fn focal_area(focal_size: f64) -> f64 {
    PI * (focal_size * 0.5 * 1e-4).powi(2)
}

/// 样品处的能量密度（J/cm²）
///
/// `pulse_energy · transmission / (π (focal_size / 2)²)`
pub fn flux(access: &dyn DataAccess, label: &str, pulse_energy: f64) -> Result<f64> {
    let transmission = access.get_attribute(label, "transmission")?;
    let focal_size = access.get_attribute(label, "focal_size")?;
    Ok(pulse_energy * transmission / focal_area(focal_size))
}

/// 图样的能量密度，要求所有贡献的元数据一致
pub fn flux_density(pattern: &Pattern, access: &dyn DataAccess, pulse_energy: f64) -> Result<f64> {
    let transmission = pattern.get_attribute(access, "transmission")?;
    let focal_size = pattern.get_attribute(access, "focal_size")?;
    Ok(pulse_energy * transmission / focal_area(focal_size))
}

fn maximum_above(pattern: &Pattern, min_angle: f64) -> Result<f64> {
    pattern
        .angles()
        .iter()
        .zip(pattern.intensities())
        .filter(|(a, _)| **a > min_angle)
        .map(|(_, v)| v)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
        .ok_or_else(|| XrdReduceError::InsufficientData {
            context: format!("maximum normalization of '{}' (angles > {}°)", pattern.label(), min_angle),
            available: 0,
            required: 1,
        })
}

/// 计算每个图样的归一化因子
pub fn get_normalization(
    patterns: &[Pattern],
    mode: &NormalizationMode,
    access: &dyn DataAccess,
    registry: &NormalizationRegistry,
) -> Result<Vec<f64>> {
    match mode {
        NormalizationMode::Maximum => patterns
            .iter()
            .map(|p| maximum_above(p, MAXIMUM_MIN_ANGLE))
            .collect(),
        NormalizationMode::Transmission => patterns
            .iter()
            .map(|p| p.get_attribute(access, "transmission"))
            .collect(),
        NormalizationMode::Background => Err(XrdReduceError::NotImplemented(
            "background normalization".to_string(),
        )),
        NormalizationMode::Peak => patterns
            .iter()
            .map(|p| {
                let sizes = p.peak_sizes(PeakSizeMethod::Fit)?;
                sizes.get(1).copied().ok_or_else(|| {
                    XrdReduceError::InvalidArgument(format!(
                        "peak normalization needs at least 2 fitted peaks, pattern '{}' has {}",
                        p.label(),
                        sizes.len()
                    ))
                })
            })
            .collect(),
        NormalizationMode::Named(name) => {
            let function = registry.get(name)?;
            patterns.iter().map(|p| function(access, p.label())).collect()
        }
    }
}

/// 返回归一化后的新图样
pub fn normalize(
    patterns: &[Pattern],
    mode: &NormalizationMode,
    access: &dyn DataAccess,
    registry: &NormalizationRegistry,
) -> Result<Vec<Pattern>> {
    let factors = get_normalization(patterns, mode, access, registry)?;
    Ok(patterns
        .iter()
        .zip(factors)
        .map(|(p, scale)| p.normalize(scale))
        .collect())
}

/// 峰强度随能量密度的变化
#[derive(Debug, Clone)]
pub struct PeakProgression {
    /// 分析化合物
    pub compound: String,
    /// 峰位角
    pub peak_angles: Vec<f64>,
    /// 按能量密度升序排列的标签
    pub labels: Vec<String>,
    /// 对应的能量密度
    pub flux_densities: Vec<f64>,
    /// 归一化后的峰大小（峰 × 标签）
    pub progression: Array2<f64>,
    /// 再除以第一个标签的峰大小
    pub relative: Array2<f64>,
}

fn sizes_with_angles(pattern: &Pattern, method: PeakSizeMethod) -> Result<(Vec<f64>, Vec<f64>)> {
    match method {
        PeakSizeMethod::Fit => {
            let fits = pattern.fit_peaks()?;
            Ok((
                fits.iter().map(|f| f.angle).collect(),
                fits.iter().map(|f| f.amplitude).collect(),
            ))
        }
        PeakSizeMethod::Integral => Ok((
            pattern.peaks().peaks().iter().map(|p| p.angle).collect(),
            pattern.peak_sizes(PeakSizeMethod::Integral)?,
        )),
    }
}

/// 按能量密度排序并计算各峰大小的变化
pub fn peak_progression(
    patterns: &[Pattern],
    mode: &NormalizationMode,
    method: PeakSizeMethod,
    access: &dyn DataAccess,
    registry: &NormalizationRegistry,
    pulse_energy: f64,
) -> Result<PeakProgression> {
    let compound = match patterns.first().and_then(Pattern::compound) {
        Some(c) if patterns.iter().all(|p| p.compound() == Some(c)) => c.to_string(),
        _ => {
            return Err(XrdReduceError::InvalidArgument(
                "pattern compounds missing, or mismatching".to_string(),
            ))
        }
    };

    let mut keyed = Vec::with_capacity(patterns.len());
    for (index, pattern) in patterns.iter().enumerate() {
        keyed.push((flux_density(pattern, access, pulse_energy)?, index));
    }
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
    let sorted: Vec<Pattern> = keyed.iter().map(|&(_, i)| patterns[i].clone()).collect();

    let mut peak_angles: Option<Vec<f64>> = None;
    let mut sizes = Vec::with_capacity(sorted.len());
    for pattern in &sorted {
        let (angles, values) = sizes_with_angles(pattern, method)?;
        match &peak_angles {
            None => peak_angles = Some(angles),
            Some(first) if *first != angles => {
                return Err(XrdReduceError::InvalidArgument(format!(
                    "pattern '{}' covers different peaks than '{}'",
                    pattern.label(),
                    sorted[0].label()
                )))
            }
            Some(_) => {}
        }
        sizes.push(values);
    }
    let peak_angles = peak_angles.unwrap_or_default();
    let factors = get_normalization(&sorted, mode, access, registry)?;

    let (n_peaks, n_labels) = (peak_angles.len(), sorted.len());
    let progression =
        Array2::from_shape_fn((n_peaks, n_labels), |(i, j)| sizes[j][i] / factors[j]);
    let relative =
        Array2::from_shape_fn((n_peaks, n_labels), |(i, j)| progression[[i, j]] / progression[[i, 0]]);

    Ok(PeakProgression {
        compound,
        peak_angles,
        labels: sorted.iter().map(|p| p.label().to_string()).collect(),
        flux_densities: keyed.iter().map(|(f, _)| *f).collect(),
        progression,
        relative,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Frame;
    use crate::xrd::pattern::tests::{strip_config, strip_frame, strip_pattern, MemoryAccess};
    use crate::xrd::pattern::PatternOptions;
    use approx::assert_relative_eq;
    use ndarray::s;

    fn flux_access() -> MemoryAccess {
        MemoryAccess::default()
            .with_attribute("high", "transmission", 1.0)
            .with_attribute("high", "focal_size", 2.0)
            .with_attribute("low", "transmission", 0.1)
            .with_attribute("low", "focal_size", 2.0)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "maximum".parse::<NormalizationMode>().unwrap(),
            NormalizationMode::Maximum
        );
        assert_eq!(
            "flux".parse::<NormalizationMode>().unwrap(),
            NormalizationMode::Named("flux".to_string())
        );
    }

    #[test]
    fn test_unknown_normalization_names_function() {
        let patterns = vec![strip_pattern("a", 1.0)];
        let mode: NormalizationMode = "bogus".parse().unwrap();
        let err = normalize(
            &patterns,
            &mode,
            &MemoryAccess::default(),
            &NormalizationRegistry::with_builtins(1e-3),
        )
        .unwrap_err();
        assert!(matches!(err, XrdReduceError::UnknownNormalization { .. }));
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_background_mode_not_implemented() {
        let patterns = vec![strip_pattern("a", 1.0)];
        let err = get_normalization(
            &patterns,
            &NormalizationMode::Background,
            &MemoryAccess::default(),
            &NormalizationRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, XrdReduceError::NotImplemented(_)));
    }

    #[test]
    fn test_maximum_and_transmission() {
        let patterns = vec![strip_pattern("a", 1.0), strip_pattern("b", 3.0)];
        let access = MemoryAccess::default()
            .with_attribute("a", "transmission", 0.5)
            .with_attribute("b", "transmission", 0.25);
        let registry = NormalizationRegistry::new();

        let maxima =
            get_normalization(&patterns, &NormalizationMode::Maximum, &access, &registry).unwrap();
        assert_relative_eq!(maxima[1] / maxima[0], 3.0, epsilon = 1e-9);

        let normalized =
            normalize(&patterns, &NormalizationMode::Transmission, &access, &registry).unwrap();
        let before = patterns[1].intensities();
        let after = normalized[1].intensities();
        assert_relative_eq!(after[500], before[500] / 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_peak_mode_uses_second_peak() {
        let patterns = vec![strip_pattern("a", 2.0)];
        let factors = get_normalization(
            &patterns,
            &NormalizationMode::Peak,
            &MemoryAccess::default(),
            &NormalizationRegistry::new(),
        )
        .unwrap();
        let expected = patterns[0].fit_peaks().unwrap()[1].amplitude;
        assert_relative_eq!(factors[0], expected);
    }

    #[test]
    fn test_flux_function() {
        let access = MemoryAccess::default()
            .with_attribute("a", "transmission", 0.5)
            .with_attribute("a", "focal_size", 2.0);
        let access: &dyn DataAccess = &access;
        let registry = NormalizationRegistry::with_builtins(1e-3);
        let flux_fn = registry.get("flux").unwrap();
        let value = flux_fn(access, "a").unwrap();
        // 面积 = π (1e-4 cm)²
        assert_relative_eq!(value, 1e-3 * 0.5 / (PI * 1e-8), epsilon = 1e-3);
        assert!(matches!(
            registry.get("fluence"),
            Err(XrdReduceError::UnknownNormalization { .. })
        ));
    }

    #[test]
    fn test_peak_progression_sorted_by_flux() {
        let patterns = vec![strip_pattern("high", 2.0), strip_pattern("low", 1.0)];
        let access = MemoryAccess::default()
            .with_attribute("high", "transmission", 1.0)
            .with_attribute("high", "focal_size", 2.0)
            .with_attribute("low", "transmission", 0.1)
            .with_attribute("low", "focal_size", 2.0);
        let progression = peak_progression(
            &patterns,
            &NormalizationMode::Transmission,
            PeakSizeMethod::Integral,
            &access,
            &NormalizationRegistry::new(),
            1e-3,
        )
        .unwrap();

        assert_eq!(progression.compound, "Test");
        assert_eq!(progression.labels, vec!["low", "high"]);
        assert!(progression.flux_densities[0] < progression.flux_densities[1]);
        assert_eq!(progression.peak_angles, vec![20.0, 35.0, 45.0]);
        assert_eq!(progression.progression.dim(), (3, 2));
        for i in 0..3 {
            assert_relative_eq!(progression.relative[[i, 0]], 1.0);
            // high: 2 倍强度 / 透过率 1.0；low: 1 倍强度 / 透过率 0.1
            assert_relative_eq!(progression.relative[[i, 1]], 0.2, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_peak_progression_with_fitted_sizes() {
        let patterns = vec![strip_pattern("high", 2.0), strip_pattern("low", 1.0)];
        let progression = peak_progression(
            &patterns,
            &NormalizationMode::Transmission,
            PeakSizeMethod::Fit,
            &flux_access(),
            &NormalizationRegistry::new(),
            1e-3,
        )
        .unwrap();

        assert_eq!(progression.labels, vec!["low", "high"]);
        assert_eq!(progression.peak_angles, vec![20.0, 35.0, 45.0]);
        // 35° 与 45° 处有真实峰；拟合振幅随强度线性变化
        for i in 1..3 {
            assert!(progression.progression[[i, 0]] > 0.0);
            assert_relative_eq!(progression.relative[[i, 1]], 0.2, epsilon = 1e-4);
        }
        assert!(progression.progression[[2, 0]] > progression.progression[[1, 0]]);
    }

    #[test]
    fn test_peak_progression_rejects_mismatched_peaks() {
        let config = strip_config();
        let options = PatternOptions::from_config(&config);
        // 只覆盖到约 31°，仅包含 20° 峰
        let narrow = Frame::new(strip_frame(1.0).data.slice(s![.., ..600]).to_owned(), "strip");
        let low = Pattern::from_frame(narrow, "low", &["Test".to_string()], &config, &options)
            .unwrap();
        assert_eq!(low.peaks().peaks().len(), 1);

        let patterns = vec![strip_pattern("high", 2.0), low];
        let err = peak_progression(
            &patterns,
            &NormalizationMode::Transmission,
            PeakSizeMethod::Integral,
            &flux_access(),
            &NormalizationRegistry::new(),
            1e-3,
        )
        .unwrap_err();

        match err {
            XrdReduceError::InvalidArgument(msg) => {
                assert!(msg.contains("covers different peaks"), "{}", msg)
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
