pub mod local;
pub mod s3;
pub mod webdav;

use anyhow::Result;
use async_trait::async_trait;

pub use local::LocalStorage;
pub use s3::S3Storage;
pub use webdav::WebDavStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, create_dir 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 文件元数据
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
}

/// 存储抽象接口（路径均为相对根目录、以 / 分隔）
#[async_trait]
pub trait Storage: Send + Sync {
    /// 获取文件或目录元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>>;

    /// 读取整个文件
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// 写入整个文件（覆盖）
    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// 创建目录
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建存储实例
pub async fn create_storage(
    config: &crate::config::StorageConfig,
) -> Result<std::sync::Arc<dyn Storage>> {
    match config.typ {
        crate::config::StorageType::Local => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local storage requires path"))?;
            tracing::info!("初始化本地存储: {}", path);
            Ok(std::sync::Arc::new(LocalStorage::new(path)?) as std::sync::Arc<dyn Storage>)
        }
        crate::config::StorageType::S3 => {
            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let access_key = config
                .access_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
            let secret_key = config
                .secret_key
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(std::sync::Arc::new(S3Storage::new(
                bucket,
                region,
                access_key,
                secret_key,
                config.endpoint.clone(),
                config.prefix.clone(),
            )?) as std::sync::Arc<dyn Storage>)
        }
        crate::config::StorageType::WebDav => {
            let endpoint = config
                .webdav_endpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires endpoint"))?;
            let username = config
                .username
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires username"))?;
            let password = config
                .password
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires password"))?;
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
            Ok(std::sync::Arc::new(
                WebDavStorage::new(endpoint, username, password, config.root.clone()).await?,
            ) as std::sync::Arc<dyn Storage>)
        }
    }
}
