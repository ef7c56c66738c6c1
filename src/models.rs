//! 数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 同步水位（上次成功同步的开始时间）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub last_sync_timestamp: Option<DateTime<Utc>>,
}

/// 待归档的源数据条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateItem {
    pub id: i64,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub group_label: Option<String>,
}

/// 条目的完整内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPayload {
    pub html_body: Option<String>,
    pub subject: Option<String>,
    pub sender_name: Option<String>,
    pub sender_address: Option<String>,
}

impl ItemPayload {
    /// 取出非空正文
    pub fn body(&self) -> Option<&str> {
        self.html_body.as_deref().filter(|b| !b.trim().is_empty())
    }
}

/// 归档位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePlacement {
    /// [年, 月, 分组]
    pub container_path: Vec<String>,
    pub file_base_name: String,
}

impl ArchivePlacement {
    pub fn html_name(&self) -> String {
        format!("{}.html", self.file_base_name)
    }

    pub fn metadata_name(&self) -> String {
        format!("{}-metadata.json", self.file_base_name)
    }
}

/// 单个条目的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 新上传，携带新节点 ID
    Uploaded(String),
    /// 已归档，携带已存在节点 ID
    AlreadyExists(String),
    /// 处理失败，携带原因
    Failed(String),
}

/// 批处理汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// 新上传数
    pub succeeded: u32,
    /// 已存在而跳过数
    pub skipped: u32,
    pub failed: u32,
    pub failed_ids: BTreeSet<i64>,
}

impl BatchOutcome {
    pub fn record(&mut self, id: i64, outcome: &Outcome) {
        match outcome {
            Outcome::Uploaded(_) => self.succeeded += 1,
            Outcome::AlreadyExists(_) => self.skipped += 1,
            Outcome::Failed(_) => {
                self.failed += 1;
                self.failed_ids.insert(id);
            }
        }
    }

    pub fn total(&self) -> u32 {
        self.succeeded + self.skipped + self.failed
    }
}

/// 一次同步运行的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub total_candidates: u32,
    /// 新上传数
    pub succeeded: u32,
    pub failed: u32,
    /// 已归档而跳过数
    pub skipped: u32,
    pub failed_ids: BTreeSet<i64>,
    /// 本次查询窗口的起点
    pub since: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// 水位是否写入成功（没有候选条目时不写水位）
    pub watermark_saved: bool,
}

impl RunResult {
    /// 对外汇总口径：新上传与已存在合计
    pub fn processed(&self) -> u32 {
        self.succeeded + self.skipped
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}
