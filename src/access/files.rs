//! # 基于目录的数据访问
//!
//! 图像按 run 存放为 `<root>/run_<NNNN>/<detector>.npy`（`f64` 二维阵列）。
//! 数据集标签经日志本解析为 run 列表，读取所有 run 的图像后取平均。
//!
//! ## 依赖关系
//! - 实现 `access::DataAccess`
//! - 使用 `access/logbook.rs` 解析标签
//! - 使用 `ndarray-npy` 读取 `.npy` 文件

use crate::access::{DataAccess, Logbook};
use crate::error::{Result, XrdReduceError};
use crate::models::{EventData, EventFn, Frame};

use ndarray::Array2;
use ndarray_npy::ReadNpyExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// 基于目录与日志本的数据访问
pub struct FileDataAccess {
    /// 数据根目录
    root: PathBuf,
    /// 实验日志本
    logbook: Logbook,
}

impl FileDataAccess {
    pub fn new(root: PathBuf, logbook: Logbook) -> Self {
        Self { root, logbook }
    }

    /// 单个 run 的图像路径
    pub fn run_path(&self, run: u32, detector_id: &str) -> PathBuf {
        self.root
            .join(format!("run_{:04}", run))
            .join(format!("{}.npy", detector_id))
    }
}

impl DataAccess for FileDataAccess {
    /// 每个 run 文件存放的是该 run 的平均图像，逐事件数据以事件号 0 记录
    fn get_frame(
        &self,
        label: &str,
        detector_id: &str,
        event_fn: Option<&EventFn>,
    ) -> Result<(Frame, Option<EventData>)> {
        let runs = self.logbook.entry(label)?.run_numbers();
        if runs.is_empty() {
            return Err(XrdReduceError::InsufficientData {
                context: format!("dataset '{}'", label),
                available: 0,
                required: 1,
            });
        }

        let mut sum: Option<Array2<f64>> = None;
        let mut events = event_fn.map(|_| EventData::new());
        for run in &runs {
            let frame = read_frame(&self.run_path(*run, detector_id))?;
            if let (Some(f), Some(events)) = (event_fn, events.as_mut()) {
                events.entry(*run).or_default().insert(0, f(&frame));
            }
            sum = Some(match sum {
                None => frame,
                Some(acc) => {
                    if acc.dim() != frame.dim() {
                        return Err(XrdReduceError::FrameShapeMismatch {
                            label: format!("{} (run {})", label, run),
                            expected: acc.dim(),
                            found: frame.dim(),
                        });
                    }
                    acc + frame
                }
            });
        }

        let data = sum.map(|s| s / runs.len() as f64).unwrap_or_default();
        Ok((Frame::new(data, detector_id), events))
    }

    fn get_attribute(&self, label: &str, attribute: &str) -> Result<f64> {
        self.logbook.attribute(label, attribute)
    }
}

/// 读取 `f64` 二维 `.npy` 图像
pub fn read_frame(path: &Path) -> Result<Array2<f64>> {
    let file = open(path)?;
    Array2::<f64>::read_npy(file).map_err(|e| XrdReduceError::NpyReadError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// 读取布尔二维 `.npy` 掩膜
pub fn read_mask(path: &Path) -> Result<Array2<bool>> {
    let file = open(path)?;
    Array2::<bool>::read_npy(file).map_err(|e| XrdReduceError::NpyReadError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
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
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_npy::WriteNpyExt;
    use std::fs;

    fn write_npy(path: &Path, data: &Array2<f64>) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        data.write_npy(File::create(path).unwrap()).unwrap();
    }

    #[test]
    fn test_label_frames_are_averaged_over_runs() {
        let dir = tempfile::tempdir().unwrap();
        let logbook_path = dir.path().join("logbook.csv");
        fs::write(&logbook_path, "runs,label,transmission\n10-11,sample,0.25\n").unwrap();
        let logbook = Logbook::from_csv(&logbook_path, 2.0).unwrap();
        let access = FileDataAccess::new(dir.path().to_path_buf(), logbook);

        write_npy(&access.run_path(10, "quad1"), &array![[1.0, 2.0], [3.0, 4.0]]);
        write_npy(&access.run_path(11, "quad1"), &array![[3.0, 2.0], [1.0, 0.0]]);

        let (frame, events) = access.get_frame("sample", "quad1", None).unwrap();
        assert_eq!(frame.data, array![[2.0, 2.0], [2.0, 2.0]]);
        assert_eq!(frame.detector_id, "quad1");
        assert!(events.is_none());
        assert_eq!(access.get_attribute("sample", "transmission").unwrap(), 0.25);

        let total: &EventFn = &|data: &Array2<f64>| data.sum();
        let (_, events) = access.get_frame("sample", "quad1", Some(total)).unwrap();
        let events = events.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[&10][&0], 10.0);
        assert_eq!(events[&11][&0], 6.0);
    }

    #[test]
    fn test_missing_run_file() {
        let dir = tempfile::tempdir().unwrap();
        let logbook_path = dir.path().join("logbook.csv");
        fs::write(&logbook_path, "runs,label\n5,sample\n").unwrap();
        let logbook = Logbook::from_csv(&logbook_path, 2.0).unwrap();
        let access = FileDataAccess::new(dir.path().to_path_buf(), logbook);

        assert!(matches!(
            access.get_frame("sample", "quad1", None),
            Err(XrdReduceError::FileNotFound { .. })
        ));
        assert!(matches!(
            access.get_frame("other", "quad1", None),
            Err(XrdReduceError::UnknownLabel { .. })
        ));
    }
}
