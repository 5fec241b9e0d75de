//! # 批量执行器
//!
//! 并行执行约化任务，结果按输入顺序返回。
//!
//! ## 功能
//! - 基于 rayon 的并行迭代（`par_iter().collect()` 保持输入顺序）
//! - 进度条显示
//! - `BatchResult` 汇总成功与失败
//!
//! 合并各任务结果由调用方按顺序折叠完成，与线程调度无关。
//!
//! ## 依赖关系
//! - 被 `commands/pattern.rs`、`commands/progression.rs` 调用
//! - 使用 `utils/progress.rs` 创建进度条
//! - 使用 `rayon` 进行并行计算

use crate::error::{Result, XrdReduceError};
use crate::utils::progress;

use rayon::prelude::*;

/// 批量处理结果
#[derive(Debug)]
pub struct BatchResult<R> {
    /// 成功结果 `(名称, 输出)`，按输入顺序
    pub outputs: Vec<(String, R)>,
    /// 失败详情 `(名称, 错误信息)`
    pub failures: Vec<(String, String)>,
}

impl<R> Default for BatchResult<R> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<R> BatchResult<R> {
    /// 合并单个任务结果
    pub fn merge(&mut self, name: String, result: Result<R>) {
        match result {
            Ok(output) => self.outputs.push((name, output)),
            Err(e) => self.failures.push((name, e.to_string())),
        }
    }

    pub fn success(&self) -> usize {
        self.outputs.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// 总处理数量
    pub fn total(&self) -> usize {
        self.success() + self.failed()
    }
}

/// 批量执行器
pub struct BatchRunner {
    /// 并行作业数
    jobs: usize,
}

impl BatchRunner {
    /// 创建新的批量执行器，`jobs == 0` 时使用全部 CPU
    pub fn new(jobs: usize) -> Self {
        let jobs = if jobs == 0 { num_cpus::get() } else { jobs };
        Self { jobs }
    }

    /// 并行处理任务列表，第 `i` 个结果对应第 `i` 个任务
    pub fn run<T, R, F>(&self, items: &[T], processor: F) -> Result<Vec<Result<R>>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Result<R> + Sync + Send,
    {
        let pb = progress::create_progress_bar(items.len() as u64, "Reducing");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .map_err(|e| {
                XrdReduceError::ConfigurationError(format!("failed to build thread pool: {}", e))
            })?;

        let results: Vec<Result<R>> = pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    let result = processor(item);
                    pb.inc(1);
                    result
                })
                .collect()
        });

        pb.finish_and_clear();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_keep_input_order() {
        let items: Vec<u64> = (0..64).collect();
        let results = BatchRunner::new(4)
            .run(&items, |&i| {
                if i % 10 == 3 {
                    Err(XrdReduceError::InvalidArgument(format!("bad {}", i)))
                } else {
                    Ok(i * i)
                }
            })
            .unwrap();

        assert_eq!(results.len(), 64);
        for (i, result) in results.iter().enumerate() {
            let i = i as u64;
            match result {
                Ok(v) => assert_eq!(*v, i * i),
                Err(_) => assert_eq!(i % 10, 3),
            }
        }
    }

    #[test]
    fn test_batch_result_counts() {
        let mut summary = BatchResult::default();
        summary.merge("a".to_string(), Ok(1));
        summary.merge(
            "b".to_string(),
            Err(XrdReduceError::InvalidArgument("bad".to_string())),
        );
        summary.merge("c".to_string(), Ok(3));
        assert_eq!(summary.success(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.failures[0].0, "b");
    }
}
