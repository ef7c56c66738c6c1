//! 同步水位存储 - 归档根目录下的单个标记节点

use super::retry::RetryExecutor;
use crate::models::SyncState;
use crate::target::{Properties, TargetSystem};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 标记节点名称
pub const MARKER_NAME: &str = "sync-state.json";
/// 保存水位的属性名
pub const LAST_SYNC_PROPERTY: &str = "archive:lastSyncTimestamp";

pub struct SyncStateStore {
    target: Arc<dyn TargetSystem>,
    retry: RetryExecutor,
}

impl SyncStateStore {
    pub fn new(target: Arc<dyn TargetSystem>, retry: RetryExecutor) -> Self {
        Self { target, retry }
    }

    /// 读取水位；标记不存在或无法读取时按首次运行处理，不返回错误
    pub async fn load(&self) -> SyncState {
        match self.try_load().await {
            Ok(state) => state,
            Err(e) => {
                warn!("读取同步水位失败，按首次运行处理: {:#}", e);
                SyncState::default()
            }
        }
    }

    async fn try_load(&self) -> Result<SyncState> {
        let target = self.target.as_ref();
        let Some(marker) = self.find_marker().await? else {
            info!("未找到同步水位，按首次运行处理");
            return Ok(SyncState::default());
        };

        let properties = self
            .retry
            .execute("读取同步水位", || target.get_properties(&marker))
            .await?;
        let raw = properties
            .get(LAST_SYNC_PROPERTY)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("marker has no {} property", LAST_SYNC_PROPERTY))?;
        let timestamp = DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("invalid watermark {:?}", raw))?
            .with_timezone(&Utc);

        debug!("同步水位: {}", raw);
        Ok(SyncState {
            last_sync_timestamp: Some(timestamp),
        })
    }

    /// 返回 (根容器 ID, 标记节点 ID)
    async fn locate(&self) -> Result<(String, Option<String>)> {
        let target = self.target.as_ref();
        let root = self
            .retry
            .execute("解析归档根目录", || target.ensure_container_path(&[]))
            .await?;
        let marker = self
            .retry
            .execute("查找同步水位", || target.find_child_by_name(&root, MARKER_NAME))
            .await?;
        Ok((root, marker))
    }

    async fn find_marker(&self) -> Result<Option<String>> {
        Ok(self.locate().await?.1)
    }

    /// 写入水位（存在则更新属性，否则创建标记节点）
    pub async fn save(&self, timestamp: DateTime<Utc>) -> Result<()> {
        let target = self.target.as_ref();
        let value = timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut properties = Properties::new();
        properties.insert(LAST_SYNC_PROPERTY.to_string(), value.clone().into());

        match self.locate().await? {
            (_, Some(marker)) => {
                self.retry
                    .execute("更新同步水位", || {
                        target.set_properties(&marker, properties.clone())
                    })
                    .await?;
            }
            (root, None) => {
                let body = serde_json::to_vec_pretty(&serde_json::json!({
                    "lastSyncTimestamp": value,
                }))?;
                self.retry
                    .execute("创建同步水位", || {
                        target.create_child(&root, MARKER_NAME, body.clone(), properties.clone())
                    })
                    .await?;
            }
        }

        info!("同步水位已更新: {}", value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::RetryPolicy;
    use crate::target::MemoryTarget;
    use chrono::TimeZone;
    use serde_json::json;

    fn store(target: Arc<MemoryTarget>) -> SyncStateStore {
        SyncStateStore::new(target, RetryExecutor::new(RetryPolicy::no_retry()))
    }

    #[tokio::test]
    async fn missing_marker_means_first_run() {
        let store = store(Arc::new(MemoryTarget::new()));
        assert_eq!(store.load().await, SyncState::default());
    }

    #[tokio::test]
    async fn save_then_load_roundtrip_and_upsert() {
        let target = Arc::new(MemoryTarget::new());
        let store = store(target.clone());

        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 2, 1, 12, 30, 0).unwrap();

        store.save(first).await.unwrap();
        assert_eq!(store.load().await.last_sync_timestamp, Some(first));

        store.save(second).await.unwrap();
        assert_eq!(store.load().await.last_sync_timestamp, Some(second));

        // 只创建一次标记节点
        assert_eq!(target.create_count().await, 1);
        assert_eq!(target.node_ids().await, vec![MARKER_NAME.to_string()]);
    }

    #[tokio::test]
    async fn corrupt_marker_degrades_to_first_run() {
        let target = Arc::new(MemoryTarget::new());
        let mut props = Properties::new();
        props.insert(LAST_SYNC_PROPERTY.into(), json!("not a timestamp"));
        target
            .create_child("", MARKER_NAME, vec![], props)
            .await
            .unwrap();

        let store = store(target);
        assert_eq!(store.load().await, SyncState::default());
    }

    #[tokio::test]
    async fn marker_without_property_degrades_to_first_run() {
        let target = Arc::new(MemoryTarget::new());
        target
            .create_child("", MARKER_NAME, vec![], Properties::new())
            .await
            .unwrap();

        let store = store(target);
        assert!(store.load().await.last_sync_timestamp.is_none());
    }
}
