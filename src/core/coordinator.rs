//! 同步协调器 - 一次完整的增量同步运行
//!
//! 流程：读取水位 → 解析变更集 → 批处理 → 写回水位 → 汇总结果。
//! 水位总是写入本次运行的开始时间，运行期间源端发生的修改会在下一次运行中被捡到。

use super::batch::BatchRunner;
use super::materializer::ItemMaterializer;
use super::resolver::ChangeSetResolver;
use super::retry::RetryExecutor;
use super::state_store::SyncStateStore;
use crate::config::{AppConfig, SyncSettings};
use crate::models::{BatchOutcome, RunResult, SyncState};
use crate::source::{create_source, SourceSystem};
use crate::target::{create_target, TargetSystem};
use anyhow::Result;
use chrono::{SubsecRound, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub struct SyncCoordinator {
    source: Arc<dyn SourceSystem>,
    target: Arc<dyn TargetSystem>,
    settings: SyncSettings,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    pub fn new(
        source: Arc<dyn SourceSystem>,
        target: Arc<dyn TargetSystem>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            source,
            target,
            settings: settings.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// 按配置创建数据源和归档目标
    pub async fn from_config(config: &AppConfig, cancel: CancellationToken) -> Result<Self> {
        let source = create_source(&config.source)?;
        let target = create_target(&config.target).await?;
        Ok(Self::new(source, target, &config.sync).with_cancellation(cancel))
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn retry(&self) -> RetryExecutor {
        RetryExecutor::new(self.settings.retry.policy()).with_cancellation(self.cancel.clone())
    }

    fn state_store(&self) -> SyncStateStore {
        SyncStateStore::new(self.target.clone(), self.retry())
    }

    /// 当前保存的水位
    pub async fn load_state(&self) -> SyncState {
        self.state_store().load().await
    }

    /// 执行一次同步
    ///
    /// 列表获取失败（重试耗尽）或被取消时返回错误，水位不前进。
    /// 单个条目的失败只记录在结果中。
    pub async fn run_sync(&self) -> Result<RunResult> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("sync_run", run_id = %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: String) -> Result<RunResult> {
        // 水位以毫秒精度保存
        let started_at = Utc::now().trunc_subsecs(3);
        info!(
            "开始同步: {} -> {}",
            self.source.name(),
            self.target.name()
        );

        let store = self.state_store();
        let state = store.load().await;

        let resolver = ChangeSetResolver::new(self.source.clone(), self.retry());
        let (since, candidates) = resolver
            .resolve(&state, self.settings.lookback_days)
            .await?;

        let mut batch = BatchOutcome::default();
        let mut watermark_saved = false;

        if candidates.is_empty() {
            info!("没有需要归档的条目");
        } else {
            let materializer =
                ItemMaterializer::new(self.source.clone(), self.target.clone(), self.retry());
            let runner = BatchRunner::new(materializer, self.settings.item_delay())
                .with_cancellation(self.cancel.clone());
            batch = runner.run(&candidates).await?;

            match store.save(started_at).await {
                Ok(()) => watermark_saved = true,
                Err(e) => warn!("保存同步水位失败，下次运行将重新处理本窗口: {:#}", e),
            }
        }

        let total_candidates = candidates.len() as u32;
        debug_assert_eq!(batch.total(), total_candidates);

        let finished_at = Utc::now();
        let result = RunResult {
            run_id,
            total_candidates,
            succeeded: batch.succeeded,
            failed: batch.failed,
            skipped: batch.skipped,
            failed_ids: batch.failed_ids,
            since,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            watermark_saved,
        };

        info!(
            "同步完成: 共 {} 条, 上传 {}, 跳过 {}, 失败 {}, 耗时 {}ms",
            result.total_candidates,
            result.succeeded,
            result.skipped,
            result.failed,
            result.duration_ms
        );
        if result.has_failures() {
            warn!("失败条目: {:?}", result.failed_ids);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateItem, ItemPayload};
    use crate::source::MemorySource;
    use crate::target::MemoryTarget;

    fn settings() -> SyncSettings {
        let mut settings = SyncSettings {
            item_delay_ms: 0,
            ..Default::default()
        };
        settings.retry.max_attempts = 1;
        settings
    }

    fn item(id: i64) -> CandidateItem {
        let now = Utc::now();
        CandidateItem {
            id,
            display_name: format!("Email {}", id),
            created_at: now,
            updated_at: now,
            group_label: None,
        }
    }

    #[tokio::test]
    async fn run_counts_and_saves_start_instant() {
        let source = Arc::new(MemorySource::new());
        let target = Arc::new(MemoryTarget::new());
        for id in 1..=2 {
            let payload = ItemPayload {
                html_body: Some("<p/>".into()),
                ..Default::default()
            };
            source.upsert(item(id), Some(payload)).await;
        }

        let coordinator = SyncCoordinator::new(source, target, &settings());
        let result = coordinator.run_sync().await.unwrap();

        assert_eq!(result.total_candidates, 2);
        assert_eq!(result.succeeded, 2);
        assert!(result.watermark_saved);
        assert_eq!(
            coordinator.load_state().await.last_sync_timestamp,
            Some(result.started_at)
        );
    }

    #[tokio::test]
    async fn empty_run_leaves_watermark_alone() {
        let coordinator = SyncCoordinator::new(
            Arc::new(MemorySource::new()),
            Arc::new(MemoryTarget::new()),
            &settings(),
        );
        let result = coordinator.run_sync().await.unwrap();

        assert_eq!(result.total_candidates, 0);
        assert!(!result.watermark_saved);
        assert!(coordinator.load_state().await.last_sync_timestamp.is_none());
    }
}
