//! # 衍射峰模型
//!
//! 单峰为高斯（或赝 Voigt）加线性背景：
//! `amplitude / (√(2π) σ) · exp(-(x - center)² / (2σ²)) + slope · x + intercept`
//!
//! ## 参数约定
//! - 默认初值：amplitude 4，center 为峰位角，sigma 0.2，slope 0，intercept 1，fraction 0.5
//! - 固定参数集合必须与给出初值的参数集合完全相同
//! - 拟合窗口为 `angle ± peak_width/2`
//! - 拟合得到的 amplitude 与 sigma 同为负时，两者一起取反
//!
//! ## 依赖关系
//! - 被 `xrd/pattern.rs` 使用
//! - 使用 `xrd/fitting.rs` 求解

use crate::error::{Result, XrdReduceError};
use crate::xrd::fitting::{levenberg_marquardt, FitOptions};

use std::collections::BTreeMap;
use std::f64::consts::{LN_2, PI};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

/// 峰模型参数名
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamName {
    Amplitude,
    Center,
    Sigma,
    Slope,
    Intercept,
    /// 赝 Voigt 的洛伦兹成分比例
    Fraction,
}

impl ParamName {
    pub const ALL: [ParamName; 6] = [
        ParamName::Amplitude,
        ParamName::Center,
        ParamName::Sigma,
        ParamName::Slope,
        ParamName::Intercept,
        ParamName::Fraction,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamName::Amplitude => "amplitude",
            ParamName::Center => "center",
            ParamName::Sigma => "sigma",
            ParamName::Slope => "slope",
            ParamName::Intercept => "intercept",
            ParamName::Fraction => "fraction",
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamName {
    type Err = XrdReduceError;

    fn from_str(s: &str) -> Result<Self> {
        ParamName::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| XrdReduceError::UnknownParameter {
                name: s.to_string(),
            })
    }
}

/// 峰形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeakShape {
    #[default]
    Gaussian,
    /// 高斯与洛伦兹按 `fraction` 线性混合
    PseudoVoigt,
}

impl PeakShape {
    /// 模型使用的参数
    pub fn params(&self) -> &'static [ParamName] {
        match self {
            PeakShape::Gaussian => &ParamName::ALL[..5],
            PeakShape::PseudoVoigt => &ParamName::ALL,
        }
    }

    /// 计算模型值，`p` 按 `ParamName::ALL` 顺序排列
    pub fn evaluate(&self, x: f64, p: &[f64]) -> f64 {
        let (amplitude, center, sigma) = (p[0], p[1], p[2]);
        let line = p[3] * x + p[4];
        let dx = x - center;
        match self {
            PeakShape::Gaussian => gaussian(dx, amplitude, sigma) + line,
            PeakShape::PseudoVoigt => {
                let fraction = p[5];
                let sigma_g = sigma / (2.0 * LN_2).sqrt();
                let lorentzian = amplitude / PI * sigma / (dx * dx + sigma * sigma);
                (1.0 - fraction) * gaussian(dx, amplitude, sigma_g) + fraction * lorentzian + line
            }
        }
    }
}

fn gaussian(dx: f64, amplitude: f64, sigma: f64) -> f64 {
    amplitude / ((2.0 * PI).sqrt() * sigma) * (-dx * dx / (2.0 * sigma * sigma)).exp()
}

impl FromStr for PeakShape {
    type Err = XrdReduceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gaussian" | "gauss" => Ok(PeakShape::Gaussian),
            "pseudo-voigt" | "pseudovoigt" | "voigt" => Ok(PeakShape::PseudoVoigt),
            other => Err(XrdReduceError::InvalidArgument(format!(
                "Unknown peak shape '{}' (expected 'gaussian' or 'pseudo-voigt')",
                other
            ))),
        }
    }
}

impl fmt::Display for PeakShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeakShape::Gaussian => f.write_str("gaussian"),
            PeakShape::PseudoVoigt => f.write_str("pseudo-voigt"),
        }
    }
}

/// 单个峰拟合结果
#[derive(Debug, Clone)]
pub struct PeakFit {
    /// 参考峰位角
    pub angle: f64,
    /// 线性背景斜率
    pub slope: f64,
    /// 线性背景截距
    pub intercept: f64,
    /// 峰面积（振幅）
    pub amplitude: f64,
    /// 拟合窗口内的角度
    pub xfit: Vec<f64>,
    /// 模型在 `xfit` 上的取值
    pub yfit: Vec<f64>,
    /// 全部模型参数的最优值
    pub values: BTreeMap<ParamName, f64>,
    pub converged: bool,
    /// 拟合窗口内的残差平方和
    pub residual: f64,
    pub iterations: usize,
}

impl PeakFit {
    pub fn value(&self, param: ParamName) -> Option<f64> {
        self.values.get(&param).copied()
    }
}

/// amplitude 与 sigma 同时为负时一起取反
pub fn correct_sign_flip(values: &mut BTreeMap<ParamName, f64>) {
    let amplitude = values.get(&ParamName::Amplitude).copied();
    let sigma = values.get(&ParamName::Sigma).copied();
    if let (Some(a), Some(s)) = (amplitude, sigma) {
        if a < 0.0 && s < 0.0 {
            values.insert(ParamName::Amplitude, -a);
            values.insert(ParamName::Sigma, -s);
        }
    }
}

/// 峰大小的提取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeakSizeMethod {
    /// 拟合得到的振幅
    #[default]
    Fit,
    /// 拟合窗口内强度直接求和
    Integral,
}

impl FromStr for PeakSizeMethod {
    type Err = XrdReduceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fit" => Ok(PeakSizeMethod::Fit),
            "integral" => Ok(PeakSizeMethod::Integral),
            other => Err(XrdReduceError::UnknownPeakSizeMethod {
                name: other.to_string(),
            }),
        }
    }
}

/// 参数初值
pub type StartingValues = BTreeMap<ParamName, f64>;

/// 单个衍射峰
#[derive(Debug, Clone, PartialEq)]
pub struct Peak {
    /// 参考峰位角（度）
    pub angle: f64,
    /// 拟合窗口全宽（度）
    pub peak_width: f64,
    pub shape: PeakShape,
    values: [f64; 6],
    fixed: [bool; 6],
}

impl Peak {
    /// 创建峰
    ///
    /// `starting_values` 中的参数全部固定；`fixed` 必须与其键集合一致。
    pub fn new(
        angle: f64,
        starting_values: &StartingValues,
        fixed: &[ParamName],
        shape: PeakShape,
        peak_width: f64,
    ) -> Result<Self> {
        for param in fixed {
            if !starting_values.contains_key(param) {
                return Err(XrdReduceError::UnfixableParameter {
                    param: param.to_string(),
                });
            }
        }
        for param in starting_values.keys() {
            if !fixed.contains(param) {
                return Err(XrdReduceError::InvalidArgument(format!(
                    "starting value given for '{}' but the parameter is not fixed",
                    param
                )));
            }
        }

        let mut values = [4.0, angle, 0.2, 0.0, 1.0, 0.5];
        let mut fixed_flags = [false; 6];
        for (param, value) in starting_values {
            values[param.index()] = *value;
            fixed_flags[param.index()] = true;
        }

        Ok(Self {
            angle,
            peak_width,
            shape,
            values,
            fixed: fixed_flags,
        })
    }

    /// 以默认初值创建全部参数自由的峰
    pub fn free(angle: f64, shape: PeakShape, peak_width: f64) -> Self {
        Self {
            angle,
            peak_width,
            shape,
            values: [4.0, angle, 0.2, 0.0, 1.0, 0.5],
            fixed: [false; 6],
        }
    }

    /// 参数当前值
    pub fn value(&self, param: ParamName) -> f64 {
        self.values[param.index()]
    }

    pub fn is_fixed(&self, param: ParamName) -> bool {
        self.fixed[param.index()]
    }

    /// 将参数固定为给定值
    pub fn constrain(&mut self, param: ParamName, value: f64) {
        self.values[param.index()] = value;
        self.fixed[param.index()] = true;
    }

    /// 拟合窗口内的样本下标
    pub fn crop_indices(&self, x: &[f64]) -> Vec<usize> {
        let lo = self.angle - self.peak_width / 2.0;
        let hi = self.angle + self.peak_width / 2.0;
        (0..x.len()).filter(|&i| x[i] >= lo && x[i] <= hi).collect()
    }

    /// 拟合窗口内强度直接求和
    pub fn integrate(&self, x: &[f64], y: &[f64]) -> f64 {
        self.crop_indices(x).iter().map(|&i| y[i]).sum()
    }

    /// 在拟合窗口内拟合峰模型
    pub fn peak_fit(&self, x: &[f64], y: &[f64], options: &FitOptions) -> Result<PeakFit> {
        let indices = self.crop_indices(x);
        let xfit: Vec<f64> = indices.iter().map(|&i| x[i]).collect();
        let ywin: Vec<f64> = indices.iter().map(|&i| y[i]).collect();

        let shape = self.shape;
        let mut free = [false; 6];
        for param in shape.params() {
            free[param.index()] = !self.fixed[param.index()];
        }

        let report = levenberg_marquardt(
            |xi, p| shape.evaluate(xi, p),
            &xfit,
            &ywin,
            &self.values,
            &free,
            options,
        )?;

        let yfit = xfit.iter().map(|&xi| shape.evaluate(xi, &report.params)).collect();
        let mut values: BTreeMap<ParamName, f64> = shape
            .params()
            .iter()
            .map(|p| (*p, report.params[p.index()]))
            .collect();
        correct_sign_flip(&mut values);

        Ok(PeakFit {
            angle: self.angle,
            slope: values[&ParamName::Slope],
            intercept: values[&ParamName::Intercept],
            amplitude: values[&ParamName::Amplitude],
            xfit,
            yfit,
            values,
            converged: report.converged,
            residual: report.cost,
            iterations: report.iterations,
        })
    }
}

/// 有序峰集合
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeakSet {
    peaks: Vec<Peak>,
}

impl PeakSet {
    /// 为每个峰位角创建峰
    ///
    /// 第 i 个峰使用 `starting_values[i]` 与 `fixed_params[i]`，缺省时全部参数自由。
    pub fn new(
        angles: &[f64],
        starting_values: &[StartingValues],
        fixed_params: &[Vec<ParamName>],
        shape: PeakShape,
        peak_width: f64,
    ) -> Result<Self> {
        let empty = StartingValues::new();
        let peaks = angles
            .iter()
            .enumerate()
            .map(|(i, &angle)| {
                Peak::new(
                    angle,
                    starting_values.get(i).unwrap_or(&empty),
                    fixed_params.get(i).map(Vec::as_slice).unwrap_or(&[]),
                    shape,
                    peak_width,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { peaks })
    }

    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// 拟合窗口完全落在 `[min(x), max(x)]` 内的峰
    pub fn valid_peaks(&self, x: &[f64], peak_width: f64) -> Vec<&Peak> {
        let lo = x.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        self.peaks
            .iter()
            .filter(|p| p.angle - peak_width / 2.0 >= lo && p.angle + peak_width / 2.0 <= hi)
            .collect()
    }

    /// 拟合所有有效峰，超出角度范围的峰跳过
    pub fn fit_peaks(
        &self,
        x: &[f64],
        y: &[f64],
        peak_width: f64,
        options: &FitOptions,
    ) -> Result<Vec<PeakFit>> {
        self.valid_peaks(x, peak_width)
            .into_iter()
            .map(|peak| peak.peak_fit(x, y, options))
            .collect()
    }

    /// 固定第 `index` 个峰的参数
    pub fn constrain(&mut self, index: usize, param: ParamName, value: f64) -> Result<()> {
        let count = self.peaks.len();
        let peak = self.peaks.get_mut(index).ok_or_else(|| {
            XrdReduceError::InvalidArgument(format!(
                "peak index {} out of range ({} peaks)",
                index, count
            ))
        })?;
        peak.constrain(param, value);
        Ok(())
    }
}

impl Add for PeakSet {
    type Output = PeakSet;

    fn add(mut self, other: PeakSet) -> PeakSet {
        self.peaks.extend(other.peaks);
        self
    }
}
