//! # 实验配置
//!
//! 探测器几何标定、额外掩膜路径、化合物粉末衍射角表及默认处理参数。
//! 配置从 JSON 文件加载，加载后不可变，以引用形式传入各个处理组件。
//!
//! ## 文件格式
//! ```json
//! {
//!   "detectors": {
//!     "quad1": {
//!       "geometry": {"phi": 0.0, "x0": 409.0, "y0": 187.0, "alpha": 2.33874, "r": 1041.4},
//!       "extra_masks": ["masks/quad1.npy"]
//!     }
//!   },
//!   "powder_angles": {"Fe3O4": [27.2, 32.1, 33.47, 38.9]},
//!   "peak_width": 1.5
//! }
//! ```
//!
//! ## 依赖关系
//! - 被 `xrd/`、`access/`、`commands/` 使用
//! - 使用 `serde_json` 解析配置文件

use crate::error::{Result, XrdReduceError};
use crate::xrd::fitting::FitOptions;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// 探测器几何标定参数
///
/// `phi` 与 `alpha` 为弧度，`x0`、`y0`、`r` 为像素单位。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorGeometry {
    /// 探测器平面内旋转角
    pub phi: f64,
    /// 旋转中心列坐标
    pub x0: f64,
    /// 旋转中心行坐标
    pub y0: f64,
    /// 探测器倾角
    pub alpha: f64,
    /// 样品到探测器距离
    pub r: f64,
}

impl DetectorGeometry {
    pub fn new(phi: f64, x0: f64, y0: f64, alpha: f64, r: f64) -> Self {
        Self {
            phi,
            x0,
            y0,
            alpha,
            r,
        }
    }

    fn validate(&self, detector: &str) -> Result<()> {
        let values = [self.phi, self.x0, self.y0, self.alpha, self.r];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(XrdReduceError::ConfigurationError(format!(
                "detector '{}': geometry parameters must be finite",
                detector
            )));
        }
        if self.r <= 0.0 {
            return Err(XrdReduceError::ConfigurationError(format!(
                "detector '{}': sample-to-detector distance must be positive, got {}",
                detector, self.r
            )));
        }
        Ok(())
    }
}

/// 单个探测器的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorInfo {
    pub geometry: DetectorGeometry,
    /// 额外掩膜文件（布尔型 .npy），与零值像素掩膜按逻辑与合并
    #[serde(default)]
    pub extra_masks: Vec<PathBuf>,
}

/// 化合物 -> 粉末衍射角（度）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PowderAngleTable {
    angles: BTreeMap<String, Vec<f64>>,
}

impl PowderAngleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记化合物的衍射角
    pub fn with_compound(mut self, compound: &str, angles: &[f64]) -> Self {
        self.angles.insert(compound.to_string(), angles.to_vec());
        self
    }

    /// 查找化合物的衍射角
    pub fn get(&self, compound: &str) -> Result<&[f64]> {
        self.angles
            .get(compound)
            .map(Vec::as_slice)
            .ok_or_else(|| XrdReduceError::UnknownCompound {
                compound: compound.to_string(),
            })
    }

    /// 返回落在过滤条件内的衍射角
    pub fn filtered<F>(&self, compound: &str, keep: F) -> Result<Vec<f64>>
    where
        F: Fn(f64) -> bool,
    {
        Ok(self
            .get(compound)?
            .iter()
            .copied()
            .filter(|a| keep(*a))
            .collect())
    }
}

/// 背景扣除参数
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// 背景面高斯平滑的标准差（像素）
    #[serde(default = "default_smoothing_sigma")]
    pub smoothing_sigma: f64,
    /// 粉末环掩膜全宽（度）；缺省时使用 `peak_width`
    #[serde(default)]
    pub ring_width: Option<f64>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            smoothing_sigma: default_smoothing_sigma(),
            ring_width: None,
        }
    }
}

/// 实验配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub detectors: BTreeMap<String, DetectorInfo>,
    #[serde(default)]
    pub powder_angles: PowderAngleTable,
    /// 峰拟合窗口全宽（度）
    #[serde(default = "default_peak_width")]
    pub peak_width: f64,
    /// 角度分箱数
    #[serde(default = "default_nbins")]
    pub nbins: usize,
    #[serde(default)]
    pub background: BackgroundConfig,
    /// 单脉冲能量（J），用于通量密度计算
    #[serde(default = "default_pulse_energy")]
    pub pulse_energy: f64,
    /// 日志中焦斑尺寸记为 `best` 时采用的尺寸（µm）
    #[serde(default = "default_best_focus_size")]
    pub best_focus_size: f64,
    #[serde(default)]
    pub fit: FitOptions,
}

fn default_peak_width() -> f64 {
    1.5
}

fn default_nbins() -> usize {
    1000
}

fn default_smoothing_sigma() -> f64 {
    5.0
}

fn default_pulse_energy() -> f64 {
    1e-3
}

fn default_best_focus_size() -> f64 {
    2.0
}

impl ExperimentConfig {
    /// 创建仅包含默认参数的空配置
    pub fn new() -> Self {
        Self {
            detectors: BTreeMap::new(),
            powder_angles: PowderAngleTable::new(),
            peak_width: default_peak_width(),
            nbins: default_nbins(),
            background: BackgroundConfig::default(),
            pulse_energy: default_pulse_energy(),
            best_focus_size: default_best_focus_size(),
            fit: FitOptions::default(),
        }
    }

    /// 登记探测器
    pub fn with_detector(mut self, id: &str, geometry: DetectorGeometry, masks: Vec<PathBuf>) -> Self {
        self.detectors.insert(
            id.to_string(),
            DetectorInfo {
                geometry,
                extra_masks: masks,
            },
        );
        self
    }

    /// 登记化合物衍射角
    pub fn with_compound(mut self, compound: &str, angles: &[f64]) -> Self {
        self.powder_angles = self.powder_angles.with_compound(compound, angles);
        self
    }

    /// 从 JSON 文件加载并校验配置
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                XrdReduceError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                XrdReduceError::FileReadError {
                    path: path.display().to_string(),
                    source: e,
                }
            }
        })?;
        let mut config: ExperimentConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| XrdReduceError::JsonError {
                path: path.display().to_string(),
                source: e,
            })?;

        // 掩膜路径相对于配置文件所在目录
        if let Some(base) = path.parent() {
            for info in config.detectors.values_mut() {
                for mask in info.extra_masks.iter_mut() {
                    if mask.is_relative() {
                        *mask = base.join(&*mask);
                    }
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        for (id, info) in &self.detectors {
            info.geometry.validate(id)?;
        }
        if !(self.peak_width.is_finite() && self.peak_width > 0.0) {
            return Err(XrdReduceError::ConfigurationError(format!(
                "peak_width must be positive, got {}",
                self.peak_width
            )));
        }
        if self.nbins == 0 {
            return Err(XrdReduceError::ConfigurationError(
                "nbins must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// 获取探测器配置
    pub fn detector(&self, id: &str) -> Result<&DetectorInfo> {
        self.detectors
            .get(id)
            .ok_or_else(|| XrdReduceError::UnknownDetector {
                detector: id.to_string(),
            })
    }

    /// 粉末环掩膜宽度
    pub fn ring_width(&self) -> f64 {
        self.background.ring_width.unwrap_or(self.peak_width)
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "detectors": {{
                    "quad1": {{
                        "geometry": {{"phi": 0.0, "x0": 409.0, "y0": 187.0, "alpha": 2.33874, "r": 1041.4}},
                        "extra_masks": ["quad1_mask.npy"]
                    }}
                }},
                "powder_angles": {{"Fe3O4": [27.2, 32.1, 33.47]}}
            }}"#
        )
        .unwrap();

        let config = ExperimentConfig::from_file(&path).unwrap();
        assert_eq!(config.peak_width, 1.5);
        assert_eq!(config.nbins, 1000);
        assert_eq!(config.ring_width(), 1.5);
        assert_eq!(config.best_focus_size, 2.0);
        let quad = config.detector("quad1").unwrap();
        assert_eq!(quad.geometry.r, 1041.4);
        assert_eq!(quad.extra_masks[0], dir.path().join("quad1_mask.npy"));
        assert_eq!(config.powder_angles.get("Fe3O4").unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_detector_and_compound() {
        let config = ExperimentConfig::new();
        assert!(matches!(
            config.detector("quad9"),
            Err(XrdReduceError::UnknownDetector { .. })
        ));
        let err = config.powder_angles.get("Unobtainium").unwrap_err();
        assert!(err.to_string().contains("Unobtainium"));
    }

    #[test]
    fn test_rejects_nonpositive_distance() {
        let config = ExperimentConfig::new().with_detector(
            "quad1",
            DetectorGeometry::new(0.0, 0.0, 0.0, 0.0, -5.0),
            vec![],
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("quad1"));
    }

    #[test]
    fn test_missing_config_file() {
        let err = ExperimentConfig::from_file(Path::new("/nonexistent/experiment.json"))
            .unwrap_err();
        assert!(matches!(err, XrdReduceError::FileNotFound { .. }));
    }
}
