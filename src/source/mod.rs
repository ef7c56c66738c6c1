pub mod memory;
pub mod rest;

use crate::models::{CandidateItem, ItemPayload};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemorySource;
pub use rest::RestSource;

/// 营销平台（数据源）接口
#[async_trait]
pub trait SourceSystem: Send + Sync {
    /// 列出候选条目，内部须翻页到底
    ///
    /// `since` 仅作提示，返回结果不保证已按时间过滤。
    async fn list_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<CandidateItem>>;

    /// 获取条目内容，不存在时返回 None
    async fn fetch_payload(&self, id: i64) -> Result<Option<ItemPayload>>;

    /// 连通性检查（如认证），默认不做任何事
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    /// 数据源名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建数据源
pub fn create_source(
    config: &crate::config::SourceConfig,
) -> Result<std::sync::Arc<dyn SourceSystem>> {
    tracing::info!("初始化数据源: {}", config.base_url);
    Ok(std::sync::Arc::new(RestSource::new(config)?) as std::sync::Arc<dyn SourceSystem>)
}
