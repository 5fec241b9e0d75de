//! # 像素掩膜
//!
//! 组合零值像素掩膜、软件坏像素掩膜与粉末环掩膜。
//!
//! ## 规则
//! - 基础掩膜排除原始值恰为 0 的像素（探测器死像素标记）
//! - 多个掩膜按逻辑与合并：结果的有效像素集是每个输入有效像素集的子集
//! - 粉末环掩膜排除散射角落在化合物衍射角 `±width/2` 内的像素
//!
//! ## 依赖关系
//! - 被 `xrd/background.rs`、`xrd/pattern.rs` 调用
//! - 使用 `xrd/geometry.rs` 计算像素角度
//! - 使用 `access/files.rs` 读取 `.npy` 掩膜文件

use crate::access::files::read_mask;
use crate::config::{DetectorGeometry, PowderAngleTable};
use crate::error::{Result, XrdReduceError};
use crate::models::{Frame, Mask};
use crate::utils::output;
use crate::xrd::geometry;

use ndarray::Zip;
use std::path::PathBuf;

/// 零值像素掩膜
pub fn base_mask(frame: &Frame) -> Mask {
    frame.data.mapv(|v| v != 0.0)
}

/// 将若干掩膜与基础掩膜按逻辑与合并
pub fn and_masks(base: &Mask, others: &[Mask]) -> Result<Mask> {
    let mut combined = base.clone();
    for (i, mask) in others.iter().enumerate() {
        if mask.dim() != base.dim() {
            return Err(XrdReduceError::InvalidArgument(format!(
                "mask #{} has shape {:?}, base mask has shape {:?}",
                i,
                mask.dim(),
                base.dim()
            )));
        }
        Zip::from(&mut combined)
            .and(mask)
            .for_each(|c, &m| *c = *c && m);
    }
    Ok(combined)
}

/// 合并后的掩膜及输出的提示
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedMask {
    pub mask: Mask,
    pub notice: String,
}

/// 读取额外掩膜文件并与零值像素掩膜合并
///
/// 掩膜文件形状与图像不符时返回配置错误；无额外掩膜时返回基础掩膜并输出提示。
pub fn combine_masks(frame: &Frame, extra_mask_paths: &[PathBuf]) -> Result<CombinedMask> {
    let base = base_mask(frame);
    if extra_mask_paths.is_empty() {
        let notice = "No additional masks provided".to_string();
        output::print_info(&notice);
        return Ok(CombinedMask { mask: base, notice });
    }

    let mut masks = Vec::with_capacity(extra_mask_paths.len());
    for path in extra_mask_paths {
        let mask = read_mask(path)?;
        if mask.dim() != frame.shape() {
            return Err(XrdReduceError::MaskShapeMismatch {
                detector: frame.detector_id.clone(),
                path: path.display().to_string(),
                expected: frame.shape(),
                found: mask.dim(),
            });
        }
        masks.push(mask);
    }

    let names: Vec<String> = extra_mask_paths
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let notice = format!("Applying mask(s): {}", names.join(", "));
    output::print_info(&notice);

    Ok(CombinedMask {
        mask: and_masks(&base, &masks)?,
        notice,
    })
}

/// 粉末环掩膜：排除各化合物衍射角附近的像素
pub fn make_powder_ring_mask(
    geometry: &DetectorGeometry,
    powder_angles: &PowderAngleTable,
    frame: &Frame,
    compounds: &[String],
    width: f64,
) -> Result<Mask> {
    let mut peak_angles = Vec::new();
    for compound in compounds {
        peak_angles.extend_from_slice(powder_angles.get(compound)?);
    }

    let angles = geometry::frame_angles(geometry, frame);
    let half = width / 2.0;
    Ok(angles.mapv(|a| !peak_angles.iter().any(|p| (a - p).abs() <= half)))
}
