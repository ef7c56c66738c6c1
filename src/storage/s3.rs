use super::{FileMeta, Storage, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use anyhow::Result;
use async_trait::async_trait;
use opendal::{layers::TimeoutLayer, Operator};
use std::time::Duration;

pub struct S3Storage {
    operator: Operator,
    name: String,
}

impl S3Storage {
    pub fn new(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default()
        );

        Ok(Self { operator, name })
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        match self.operator.stat(path).await {
            Ok(meta) => Ok(Some(FileMeta {
                size: meta.content_length(),
                modified_time: meta.last_modified().map_or(0, |t| t.timestamp()),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let data = self.operator.read(path).await?;
        Ok(data.to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.operator.write(path, data).await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        // S3 没有真正的目录，写一个占位对象，使 stat 能识别
        let dir_path = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        self.operator.write(&dir_path, Vec::<u8>::new()).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
