use super::{FileMeta, Storage};
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        let full_path = self.resolve_path(path);

        match fs::metadata(&full_path).await {
            Ok(metadata) => {
                let modified = metadata
                    .modified()?
                    .duration_since(std::time::UNIX_EPOCH)?
                    .as_secs() as i64;

                Ok(Some(FileMeta {
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                    modified_time: modified,
                    is_dir: metadata.is_dir(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let data = fs::read(self.resolve_path(path)).await?;
        Ok(data)
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let mut temp_name = full_path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, &full_path).await?;

        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
