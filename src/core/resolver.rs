//! 变更集解析 - 计算查询窗口并筛选候选条目

use super::retry::RetryExecutor;
use crate::models::{CandidateItem, SyncState};
use crate::source::SourceSystem;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// 查询窗口起点：有水位用水位，否则回溯 `lookback_days` 天
pub fn window_start(state: &SyncState, lookback_days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    state
        .last_sync_timestamp
        .unwrap_or_else(|| now - Duration::days(i64::from(lookback_days)))
}

/// 保留 `updated_at >= since` 的条目（边界相等也保留），按 ID 去重并保持原顺序
pub fn filter_changed(items: Vec<CandidateItem>, since: DateTime<Utc>) -> Vec<CandidateItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| item.updated_at >= since)
        .filter(|item| seen.insert(item.id))
        .collect()
}

pub struct ChangeSetResolver {
    source: Arc<dyn SourceSystem>,
    retry: RetryExecutor,
}

impl ChangeSetResolver {
    pub fn new(source: Arc<dyn SourceSystem>, retry: RetryExecutor) -> Self {
        Self { source, retry }
    }

    /// 返回 (窗口起点, 候选条目)；列表获取失败时返回错误
    pub async fn resolve(
        &self,
        state: &SyncState,
        lookback_days: u32,
    ) -> Result<(DateTime<Utc>, Vec<CandidateItem>)> {
        let since = window_start(state, lookback_days, Utc::now());
        match state.last_sync_timestamp {
            Some(_) => info!("增量同步，窗口起点: {}", since.to_rfc3339()),
            None => info!("首次同步，回溯 {} 天至 {}", lookback_days, since.to_rfc3339()),
        }

        let source = self.source.as_ref();
        let listed = self
            .retry
            .execute("列出候选条目", || source.list_changed_since(since))
            .await?;
        let listed_count = listed.len();

        let candidates = filter_changed(listed, since);
        debug!("源系统返回 {} 条，筛选后 {} 条", listed_count, candidates.len());
        info!("发现 {} 个待处理条目", candidates.len());

        Ok((since, candidates))
    }
}
