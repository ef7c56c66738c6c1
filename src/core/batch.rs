//! 批处理 - 顺序处理候选条目，单条失败不影响其余条目

use super::materializer::ItemMaterializer;
use super::retry::cancellable_sleep;
use crate::error::ArchiveError;
use crate::models::{BatchOutcome, CandidateItem, Outcome};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BatchRunner {
    materializer: ItemMaterializer,
    item_delay: Duration,
    cancel: CancellationToken,
}

impl BatchRunner {
    pub fn new(materializer: ItemMaterializer, item_delay: Duration) -> Self {
        Self {
            materializer,
            item_delay,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 按给定顺序逐个处理；只有取消会中断批处理
    pub async fn run(&self, candidates: &[CandidateItem]) -> Result<BatchOutcome, ArchiveError> {
        let total = candidates.len();
        let mut batch = BatchOutcome::default();

        for (index, candidate) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("同步已取消，已处理 {}/{}", index, total);
                return Err(ArchiveError::Cancelled);
            }

            let outcome = self.materializer.materialize(candidate).await;
            match &outcome {
                Outcome::Uploaded(node) => {
                    debug!("[{}/{}] 上传 {} -> {}", index + 1, total, candidate.id, node)
                }
                Outcome::AlreadyExists(node) => {
                    debug!("[{}/{}] 跳过 {} ({})", index + 1, total, candidate.id, node)
                }
                Outcome::Failed(reason) => {
                    warn!("[{}/{}] 失败 {}: {}", index + 1, total, candidate.id, reason)
                }
            }
            batch.record(candidate.id, &outcome);

            // 节流；最后一个条目之后不再等待，已完成的批次不会因取消而作废
            if index + 1 < total {
                cancellable_sleep(self.item_delay, &self.cancel).await?;
            }
        }

        info!(
            "批处理完成: 上传 {}, 跳过 {}, 失败 {}",
            batch.succeeded, batch.skipped, batch.failed
        );
        Ok(batch)
    }
}
