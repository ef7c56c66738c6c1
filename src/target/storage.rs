//! 基于存储后端（本地 / S3 / WebDAV）的归档目标
//!
//! 容器即目录，节点即文件，节点 ID 为相对根目录的路径。
//! 节点属性保存在同目录的 `{节点}.properties.json` 中。

use super::{Properties, TargetSystem};
use crate::error::ArchiveError;
use crate::storage::Storage;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const PROPERTIES_SUFFIX: &str = ".properties.json";

pub struct StorageTarget {
    storage: Arc<dyn Storage>,
    name: String,
}

impl StorageTarget {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let name = format!("archive@{}", storage.name());
        Self { storage, name }
    }

    fn join(container_id: &str, name: &str) -> String {
        if container_id.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", container_id.trim_end_matches('/'), name)
        }
    }

    fn properties_path(node_id: &str) -> String {
        format!("{}{}", node_id, PROPERTIES_SUFFIX)
    }

    /// 名称不能为空，也不能跨越目录层级
    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            bail!("invalid node name: {:?}", name);
        }
        Ok(())
    }

    async fn read_properties(&self, node_id: &str) -> Result<Properties> {
        let path = Self::properties_path(node_id);
        if !self.storage.exists(&path).await? {
            return Ok(Properties::new());
        }
        let data = self.storage.read(&path).await?;
        serde_json::from_slice(&data).with_context(|| format!("corrupt properties file {}", path))
    }

    async fn write_properties(&self, node_id: &str, properties: &Properties) -> Result<()> {
        let data = serde_json::to_vec_pretty(properties)?;
        self.storage
            .write(&Self::properties_path(node_id), data)
            .await
    }

    async fn require_node(&self, node_id: &str) -> Result<()> {
        if self.storage.exists(node_id).await? {
            Ok(())
        } else {
            Err(ArchiveError::remote(Some(404), format!("node not found: {}", node_id)).into())
        }
    }
}

#[async_trait]
impl TargetSystem for StorageTarget {
    async fn ensure_container_path(&self, segments: &[String]) -> Result<String> {
        let mut current = String::new();

        for segment in segments {
            Self::check_name(segment)?;
            current = Self::join(&current, segment);
            let dir_path = format!("{}/", current);

            match self.storage.stat(&dir_path).await? {
                Some(meta) if meta.is_dir => continue,
                Some(_) => bail!("{} exists but is not a container", current),
                None => {}
            }

            if let Err(e) = self.storage.create_dir(&current).await {
                // 可能被并发创建，重新确认
                match self.storage.stat(&dir_path).await {
                    Ok(Some(meta)) if meta.is_dir => {
                        debug!("容器已被并发创建: {}", current);
                    }
                    _ => {
                        return Err(e.context(format!("failed to create container {}", current)))
                    }
                }
            } else {
                debug!("创建容器: {}", current);
            }
        }

        Ok(current)
    }

    async fn find_child_by_name(&self, container_id: &str, name: &str) -> Result<Option<String>> {
        Self::check_name(name)?;
        let path = Self::join(container_id, name);
        Ok(self.storage.stat(&path).await?.map(|_| path))
    }

    async fn create_child(
        &self,
        container_id: &str,
        name: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<String> {
        Self::check_name(name)?;
        let path = Self::join(container_id, name);
        if self.storage.exists(&path).await? {
            // 上一次尝试已写入相同内容（如响应丢失后重试），补齐属性即可
            if self.storage.read(&path).await? == content {
                if !properties.is_empty() {
                    self.write_properties(&path, &properties).await?;
                }
                debug!("节点已存在且内容一致: {}", path);
                return Ok(path);
            }
            return Err(
                ArchiveError::remote(Some(409), format!("node already exists: {}", path)).into(),
            );
        }

        // 先写属性再写内容：内容可见时属性一定已就绪
        if !properties.is_empty() {
            self.write_properties(&path, &properties).await?;
        }
        self.storage.write(&path, content).await?;
        debug!("创建节点: {}", path);
        Ok(path)
    }

    async fn set_properties(&self, node_id: &str, properties: Properties) -> Result<()> {
        self.require_node(node_id).await?;
        let mut merged = self.read_properties(node_id).await?;
        merged.extend(properties);
        self.write_properties(node_id, &merged).await
    }

    async fn get_properties(&self, node_id: &str) -> Result<Properties> {
        self.require_node(node_id).await?;
        self.read_properties(node_id).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use serde_json::json;

    fn target(dir: &tempfile::TempDir) -> StorageTarget {
        let storage = LocalStorage::new(dir.path().to_str().unwrap()).unwrap();
        StorageTarget::new(Arc::new(storage))
    }

    fn segments(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn ensure_container_path_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir);
        let path = segments(&["2024", "01", "Spring"]);

        let first = target.ensure_container_path(&path).await.unwrap();
        let second = target.ensure_container_path(&path).await.unwrap();

        assert_eq!(first, "2024/01/Spring");
        assert_eq!(first, second);
        assert!(dir.path().join("2024/01/Spring").is_dir());
        assert_eq!(target.ensure_container_path(&[]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn rejects_names_that_escape_the_container() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir);

        assert!(target
            .ensure_container_path(&segments(&["2024", ".."]))
            .await
            .is_err());
        assert!(target.find_child_by_name("", "a/b").await.is_err());
    }

    #[tokio::test]
    async fn create_find_and_properties() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir);
        let container = target
            .ensure_container_path(&segments(&["2024", "01"]))
            .await
            .unwrap();

        assert!(target
            .find_child_by_name(&container, "1-a.html")
            .await
            .unwrap()
            .is_none());

        let mut props = Properties::new();
        props.insert("archive:emailId".into(), json!(1));
        let node = target
            .create_child(&container, "1-a.html", b"<p/>".to_vec(), props)
            .await
            .unwrap();

        assert_eq!(
            target.find_child_by_name(&container, "1-a.html").await.unwrap(),
            Some(node.clone())
        );
        assert_eq!(std::fs::read(dir.path().join(&node)).unwrap(), b"<p/>");

        let mut update = Properties::new();
        update.insert("archive:note".into(), json!("checked"));
        target.set_properties(&node, update).await.unwrap();

        let stored = target.get_properties(&node).await.unwrap();
        assert_eq!(stored.get("archive:emailId"), Some(&json!(1)));
        assert_eq!(stored.get("archive:note"), Some(&json!("checked")));
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir);

        target
            .create_child("", "x.json", b"{}".to_vec(), Properties::new())
            .await
            .unwrap();
        let err = target
            .create_child("", "x.json", b"{\"a\":1}".to_vec(), Properties::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::Remote {
                status: Some(409),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn repeated_create_with_same_content_completes_properties() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir);
        std::fs::write(dir.path().join("1-a.html"), b"<p/>").unwrap();

        let mut props = Properties::new();
        props.insert("archive:emailId".into(), json!(1));
        let node = target
            .create_child("", "1-a.html", b"<p/>".to_vec(), props)
            .await
            .unwrap();

        assert_eq!(node, "1-a.html");
        assert_eq!(
            target.get_properties(&node).await.unwrap().get("archive:emailId"),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn properties_are_written_before_content() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FailingWrites {
            inner: LocalStorage::new(dir.path().to_str().unwrap()).unwrap(),
            suffix: ".html",
        });
        let target = StorageTarget::new(storage);

        let mut props = Properties::new();
        props.insert("archive:emailId".into(), json!(5));
        assert!(target
            .create_child("", "5-a.html", b"<p/>".to_vec(), props)
            .await
            .is_err());

        // 内容没写成功时不会留下没有属性的节点，也不会留下孤立的内容
        assert!(!dir.path().join("5-a.html").exists());
        assert!(dir.path().join("5-a.html.properties.json").exists());
    }

    /// 对指定后缀的写入始终失败
    struct FailingWrites {
        inner: LocalStorage,
        suffix: &'static str,
    }

    #[async_trait]
    impl Storage for FailingWrites {
        async fn stat(&self, path: &str) -> Result<Option<crate::storage::FileMeta>> {
            self.inner.stat(path).await
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            self.inner.read(path).await
        }

        async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
            if path.ends_with(self.suffix) {
                let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out");
                return Err(err.into());
            }
            self.inner.write(path, data).await
        }

        async fn create_dir(&self, path: &str) -> Result<()> {
            self.inner.create_dir(path).await
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn properties_of_missing_node_fail() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir);

        assert!(target.get_properties("nope").await.is_err());
        assert!(target.set_properties("nope", Properties::new()).await.is_err());
    }
}
