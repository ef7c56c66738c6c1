use super::{FileMeta, Storage, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use anyhow::Result;
use async_trait::async_trait;
use opendal::{layers::TimeoutLayer, Operator};
use std::time::Duration;

pub struct WebDavStorage {
    operator: Operator,
    name: String,
}

impl WebDavStorage {
    pub async fn new(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        // 尝试创建根目录（某些 WebDAV 服务器需要）
        // 忽略错误，目录可能已存在或不需要创建
        let _ = operator.create_dir("/").await;

        Ok(Self { operator, name })
    }

    fn normalize(path: &str) -> String {
        path.replace('\\', "/").trim_start_matches('/').to_string()
    }
}

#[async_trait]
impl Storage for WebDavStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        match self.operator.stat(&Self::normalize(path)).await {
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
        let data = self.operator.read(&Self::normalize(path)).await?;
        Ok(data.to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let path = Self::normalize(path);

        // 确保父目录存在（逐级创建）
        if let Some((parent, _)) = path.rsplit_once('/') {
            let mut current_path = String::new();
            for part in parent.split('/').filter(|s| !s.is_empty()) {
                current_path.push_str(part);
                current_path.push('/');
                // 忽略创建目录的错误（可能已存在）
                let _ = self.operator.create_dir(&current_path).await;
            }
        }

        self.operator.write(&path, data).await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let path = Self::normalize(path);
        let dir_path = if path.ends_with('/') {
            path
        } else {
            format!("{}/", path)
        };
        self.operator.create_dir(&dir_path).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
