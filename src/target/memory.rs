//! 内存归档目标

use super::{Properties, TargetSystem};
use crate::error::ArchiveError;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Node {
    content: Vec<u8>,
    properties: Properties,
}

#[derive(Default)]
struct Inner {
    /// 容器 ID 集合，根容器为 ""
    containers: BTreeSet<String>,
    nodes: BTreeMap<String, Node>,
    creates: u64,
}

/// 保存在内存中的归档目标，节点 ID 为路径
pub struct MemoryTarget {
    inner: Mutex<Inner>,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        let mut inner = Inner::default();
        inner.containers.insert(String::new());
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn join(container_id: &str, name: &str) -> String {
        if container_id.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", container_id, name)
        }
    }

    /// 节点内容
    pub async fn content(&self, node_id: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .await
            .nodes
            .get(node_id)
            .map(|n| n.content.clone())
    }

    /// 所有节点 ID（有序）
    pub async fn node_ids(&self) -> Vec<String> {
        self.inner.lock().await.nodes.keys().cloned().collect()
    }

    /// 所有容器 ID（有序，含根容器）
    pub async fn container_ids(&self) -> Vec<String> {
        self.inner.lock().await.containers.iter().cloned().collect()
    }

    /// 成功创建的节点总数
    pub async fn create_count(&self) -> u64 {
        self.inner.lock().await.creates
    }
}

#[async_trait]
impl TargetSystem for MemoryTarget {
    async fn ensure_container_path(&self, segments: &[String]) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let mut current = String::new();
        for segment in segments {
            if segment.is_empty() || segment.contains('/') {
                bail!("invalid container name: {:?}", segment);
            }
            current = Self::join(&current, segment);
            if inner.nodes.contains_key(&current) {
                bail!("{} exists but is not a container", current);
            }
            inner.containers.insert(current.clone());
        }
        Ok(current)
    }

    async fn find_child_by_name(&self, container_id: &str, name: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        let id = Self::join(container_id, name);
        Ok((inner.nodes.contains_key(&id) || inner.containers.contains(&id)).then_some(id))
    }

    async fn create_child(
        &self,
        container_id: &str,
        name: &str,
        content: Vec<u8>,
        properties: Properties,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if !inner.containers.contains(container_id) {
            return Err(ArchiveError::remote(
                Some(404),
                format!("container not found: {}", container_id),
            )
            .into());
        }
        let id = Self::join(container_id, name);
        if let Some(node) = inner.nodes.get_mut(&id) {
            if node.content == content {
                node.properties.extend(properties);
                return Ok(id);
            }
        }
        if inner.nodes.contains_key(&id) || inner.containers.contains(&id) {
            return Err(
                ArchiveError::remote(Some(409), format!("node already exists: {}", id)).into(),
            );
        }
        inner.nodes.insert(
            id.clone(),
            Node {
                content,
                properties,
            },
        );
        inner.creates += 1;
        Ok(id)
    }

    async fn set_properties(&self, node_id: &str, properties: Properties) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.nodes.get_mut(node_id) {
            Some(node) => {
                node.properties.extend(properties);
                Ok(())
            }
            None => Err(
                ArchiveError::remote(Some(404), format!("node not found: {}", node_id)).into(),
            ),
        }
    }

    async fn get_properties(&self, node_id: &str) -> Result<Properties> {
        let inner = self.inner.lock().await;
        match inner.nodes.get(node_id) {
            Some(node) => Ok(node.properties.clone()),
            None => Err(
                ArchiveError::remote(Some(404), format!("node not found: {}", node_id)).into(),
            ),
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}
