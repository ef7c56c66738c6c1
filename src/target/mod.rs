pub mod memory;
pub mod storage;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

pub use memory::MemoryTarget;
pub use storage::StorageTarget;

/// 节点属性（键有序，便于审计比对）
pub type Properties = BTreeMap<String, serde_json::Value>;

/// 文档库（归档目标）接口
///
/// 容器路径相对于归档根目录；空路径即根目录本身。
#[async_trait]
pub trait TargetSystem: Send + Sync {
    /// 确保容器路径存在（逐级创建），返回容器 ID；对已存在的路径重复调用是安全的
    async fn ensure_container_path(&self, segments: &[String]) -> Result<String>;

    /// 按名称查找容器下的子节点
    async fn find_child_by_name(&self, container_id: &str, name: &str) -> Result<Option<String>>;

    /// 在容器下创建子节点，返回节点 ID
    async fn create_child(
        &self,
        container_id: &str,
        name: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<String>;

    /// 合并更新节点属性
    async fn set_properties(&self, node_id: &str, properties: Properties) -> Result<()>;

    /// 读取节点属性
    async fn get_properties(&self, node_id: &str) -> Result<Properties>;

    /// 目标名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建归档目标
pub async fn create_target(
    config: &crate::config::StorageConfig,
) -> Result<std::sync::Arc<dyn TargetSystem>> {
    let storage = crate::storage::create_storage(config).await?;
    Ok(std::sync::Arc::new(StorageTarget::new(storage)) as std::sync::Arc<dyn TargetSystem>)
}
