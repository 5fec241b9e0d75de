//! # 实验日志本
//!
//! 解析 CSV 格式的实验日志本。每行描述一段 run 范围及其实验参数，
//! 一行可以带多个数据集标签（多个标签列）。
//!
//! ## 列识别
//! 列名通过正则表达式识别：
//! - runs: `.*[rR]un.*`，格式 `N` 或 `N-M`
//! - labels: `.*[lL]abel.*`（可有多列）
//! - transmission: `.*[tT]ransmission.*`
//! - focal_size: `.*[Ss]ize.*`，支持 `best focus` 与 `um` 后缀
//! - 其余列按列名作为数值属性保存
//!
//! ## 依赖关系
//! - 被 `access/files.rs` 使用
//! - 使用 `csv` 读取文件，`regex` 匹配列名

use crate::error::{Result, XrdReduceError};

use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

static RUNS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^.*[rR]un.*$").unwrap());
static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*[lL]abel.*|.*[hH]eader.*$").unwrap());
static TRANSMISSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*[tT]ransmission.*$").unwrap());
static FOCAL_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^.*[Ss]ize.*$").unwrap());

/// 列角色
#[derive(Debug, Clone, PartialEq)]
enum Column {
    Runs,
    Label,
    Transmission,
    FocalSize,
    Other(String),
}

impl Column {
    fn classify(title: &str) -> Column {
        let title = title.trim();
        if RUNS_RE.is_match(title) {
            Column::Runs
        } else if LABEL_RE.is_match(title) {
            Column::Label
        } else if TRANSMISSION_RE.is_match(title) {
            Column::Transmission
        } else if FOCAL_SIZE_RE.is_match(title) {
            Column::FocalSize
        } else {
            Column::Other(title.to_string())
        }
    }
}

/// 单个标签的记录
#[derive(Debug, Clone, Default)]
pub struct LabelEntry {
    /// run 范围（闭区间），去重并保持出现顺序
    pub runs: Vec<(u32, u32)>,
    /// 数值属性
    pub attributes: BTreeMap<String, f64>,
}

impl LabelEntry {
    /// 展开的 run 号列表
    pub fn run_numbers(&self) -> Vec<u32> {
        self.runs
            .iter()
            .flat_map(|&(start, end)| start..=end)
            .collect()
    }
}

/// 实验日志本
#[derive(Debug, Clone, Default)]
pub struct Logbook {
    entries: BTreeMap<String, LabelEntry>,
}

impl Logbook {
    /// 从 CSV 文件解析
    ///
    /// `best_focus_size` 用于把 `best focus` 记法换算为焦斑尺寸（微米）。
    pub fn from_csv(path: &Path, best_focus_size: f64) -> Result<Self> {
        if !path.exists() {
            return Err(XrdReduceError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let columns: Vec<Column> = reader.headers()?.iter().map(Column::classify).collect();

        let mut logbook = Logbook::default();
        for record in reader.records() {
            let record = record?;
            logbook.add_row(&columns, &record, best_focus_size)?;
        }
        Ok(logbook)
    }

    fn add_row(
        &mut self,
        columns: &[Column],
        record: &csv::StringRecord,
        best_focus_size: f64,
    ) -> Result<()> {
        let field = |i: usize| record.get(i).unwrap_or("").trim();

        let run_range = match columns.iter().position(|c| *c == Column::Runs) {
            Some(i) if !field(i).is_empty() => Some(parse_run_range(field(i))?),
            _ => None,
        };

        let mut labels: Vec<String> = columns
            .iter()
            .enumerate()
            .filter(|(i, c)| **c == Column::Label && !field(*i).is_empty())
            .map(|(i, _)| field(i).to_string())
            .collect();
        // 无标签的行以 run 范围文本作为标签
        if labels.is_empty() {
            match run_range {
                Some((start, end)) => labels.push(format!("{}-{}", start, end)),
                None => return Ok(()),
            }
        }

        for label in labels {
            let entry = self.entries.entry(label).or_default();
            if let Some(range) = run_range {
                if !entry.runs.contains(&range) {
                    entry.runs.push(range);
                }
            }
            for (i, column) in columns.iter().enumerate() {
                let raw = field(i);
                if raw.is_empty() {
                    continue;
                }
                let (key, value) = match column {
                    Column::Transmission => ("transmission".to_string(), parse_float(raw)?),
                    Column::FocalSize => (
                        "focal_size".to_string(),
                        parse_focal_size(raw, best_focus_size)?,
                    ),
                    Column::Other(name) => match raw.parse::<f64>() {
                        Ok(v) => (name.clone(), v),
                        // 非数值列（如过滤函数名）不作为数值属性
                        Err(_) => continue,
                    },
                    Column::Runs | Column::Label => continue,
                };
                // 同一标签的重复属性保留首次出现的值
                entry.attributes.entry(key).or_insert(value);
            }
        }
        Ok(())
    }

    /// 查找标签记录
    pub fn entry(&self, label: &str) -> Result<&LabelEntry> {
        self.entries
            .get(label)
            .ok_or_else(|| XrdReduceError::UnknownLabel {
                label: label.to_string(),
            })
    }

    /// 查找标签的数值属性
    pub fn attribute(&self, label: &str, attribute: &str) -> Result<f64> {
        self.entry(label)?
            .attributes
            .get(attribute)
            .copied()
            .ok_or_else(|| XrdReduceError::UnknownAttribute {
                label: label.to_string(),
                attribute: attribute.to_string(),
            })
    }
}

/// 解析 `N` 或 `N-M` 形式的 run 范围
fn parse_run_range(text: &str) -> Result<(u32, u32)> {
    let invalid = || XrdReduceError::InvalidArgument(format!("Invalid run range format: {}", text));
    let parts: Vec<&str> = text.split('-').map(str::trim).collect();
    let numbers = parts
        .iter()
        .map(|p| p.parse::<u32>().map_err(|_| invalid()))
        .collect::<Result<Vec<u32>>>()?;
    match numbers.as_slice() {
        [run] => Ok((*run, *run)),
        [start, end] if start <= end => Ok((*start, *end)),
        _ => Err(invalid()),
    }
}

fn parse_float(text: &str) -> Result<f64> {
    text.parse::<f64>()
        .map_err(|_| XrdReduceError::InvalidArgument(format!("Invalid number in logbook: {}", text)))
}

fn parse_focal_size(text: &str, best_focus_size: f64) -> Result<f64> {
    if text.contains("best focus") {
        return Ok(best_focus_size);
    }
    parse_float(text.trim_end_matches("um").trim())
}
