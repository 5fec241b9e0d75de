//! # 非线性最小二乘
//!
//! Levenberg-Marquardt 求解器，对模型的自由参数做最小二乘拟合。
//!
//! ## 算法
//! - 中心差分数值雅可比
//! - 阻尼项 `λ · diag(JᵀJ)`，接受步长时 λ 缩小 10 倍，拒绝时放大 10 倍
//! - 正规方程优先 Cholesky 分解，失败时退回 LU
//! - 相对残差下降或步长小于容差时收敛；迭代次数由 `FitOptions` 限定
//!
//! 求解器不持有状态，同一输入总是得到同一结果。
//!
//! ## 依赖关系
//! - 被 `xrd/peak.rs` 调用
//! - 使用 `nalgebra` 的动态矩阵

use crate::error::{Result, XrdReduceError};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// 拟合选项
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// 最大迭代次数
    pub max_iterations: usize,
    /// 收敛容差
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
        }
    }
}

/// 拟合结果
#[derive(Debug, Clone)]
pub struct FitReport {
    /// 全部参数（固定参数保持初值）
    pub params: Vec<f64>,
    /// 残差平方和
    pub cost: f64,
    /// 实际迭代次数
    pub iterations: usize,
    /// 是否满足收敛条件
    pub converged: bool,
}

const INITIAL_LAMBDA: f64 = 1e-3;
const MAX_LAMBDA: f64 = 1e12;
/// 相对步长收敛阈值
const STEP_TOLERANCE: f64 = 1.5e-8;

/// Levenberg-Marquardt 拟合
///
/// `model(x, params)` 返回模型值；`free[k]` 为 `false` 的参数保持 `initial[k]`。
pub fn levenberg_marquardt<F>(
    model: F,
    x: &[f64],
    y: &[f64],
    initial: &[f64],
    free: &[bool],
    options: &FitOptions,
) -> Result<FitReport>
where
    F: Fn(f64, &[f64]) -> f64,
{
    if x.len() != y.len() || initial.len() != free.len() {
        return Err(XrdReduceError::InvalidArgument(
            "fit inputs have inconsistent lengths".to_string(),
        ));
    }

    let free_idx: Vec<usize> = (0..free.len()).filter(|&k| free[k]).collect();
    let n_free = free_idx.len();
    let mut params = initial.to_vec();

    let cost_of = |p: &[f64]| -> f64 {
        x.iter()
            .zip(y)
            .map(|(&xi, &yi)| {
                let r = yi - model(xi, p);
                r * r
            })
            .sum()
    };

    if n_free == 0 {
        return Ok(FitReport {
            cost: cost_of(&params),
            params,
            iterations: 0,
            converged: true,
        });
    }
    if x.len() < n_free {
        return Err(XrdReduceError::InsufficientData {
            context: "peak fit window".to_string(),
            available: x.len(),
            required: n_free,
        });
    }

    let mut cost = cost_of(&params);
    if !cost.is_finite() {
        return Err(XrdReduceError::InvalidArgument(
            "fit starting values produce non-finite residuals".to_string(),
        ));
    }

    let mut lambda = INITIAL_LAMBDA;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        iterations += 1;

        let jacobian = numeric_jacobian(&model, x, &params, &free_idx);
        let residuals = DVector::from_iterator(
            x.len(),
            x.iter().zip(y).map(|(&xi, &yi)| yi - model(xi, &params)),
        );
        let jtj = jacobian.transpose() * &jacobian;
        let gradient = jacobian.transpose() * &residuals;

        // 在同一线性化点上调整 λ，直到找到下降步长或 λ 过大
        let mut accepted = false;
        while lambda <= MAX_LAMBDA {
            let mut damped = jtj.clone();
            for k in 0..n_free {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }
            let Some(step) = solve_normal(damped, &gradient) else {
                lambda *= 10.0;
                continue;
            };

            let mut trial = params.clone();
            for (k, &idx) in free_idx.iter().enumerate() {
                trial[idx] += step[k];
            }
            let trial_cost = cost_of(&trial);

            if trial_cost.is_finite() && trial_cost < cost {
                let decrease = cost - trial_cost;
                let step_norm = step.norm();
                let param_norm = free_idx
                    .iter()
                    .map(|&i| trial[i] * trial[i])
                    .sum::<f64>()
                    .sqrt();

                params = trial;
                cost = trial_cost;
                lambda = (lambda / 10.0).max(1e-15);
                accepted = true;

                if decrease <= options.tolerance * cost
                    || step_norm <= STEP_TOLERANCE * (param_norm + STEP_TOLERANCE)
                {
                    converged = true;
                }
                break;
            }
            lambda *= 10.0;
        }

        // 无法继续下降：已处于局部极小
        if !accepted {
            converged = true;
            break;
        }
        if converged {
            break;
        }
    }

    Ok(FitReport {
        params,
        cost,
        iterations,
        converged,
    })
}

fn numeric_jacobian<F>(model: &F, x: &[f64], params: &[f64], free_idx: &[usize]) -> DMatrix<f64>
where
    F: Fn(f64, &[f64]) -> f64,
{
    let mut jacobian = DMatrix::zeros(x.len(), free_idx.len());
    let mut p = params.to_vec();
    for (k, &idx) in free_idx.iter().enumerate() {
        let h = 1e-6 * params[idx].abs().max(1e-3);
        p[idx] = params[idx] + h;
        let upper: Vec<f64> = x.iter().map(|&xi| model(xi, &p)).collect();
        p[idx] = params[idx] - h;
        for (i, &xi) in x.iter().enumerate() {
            jacobian[(i, k)] = (upper[i] - model(xi, &p)) / (2.0 * h);
        }
        p[idx] = params[idx];
    }
    jacobian
}

fn solve_normal(matrix: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    let step = match matrix.clone().cholesky() {
        Some(chol) => Some(chol.solve(rhs)),
        None => matrix.lu().solve(rhs),
    }?;
    step.iter().all(|v| v.is_finite()).then_some(step)
}
