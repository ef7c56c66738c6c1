//! 内存数据源

use super::SourceSystem;
use crate::models::{CandidateItem, ItemPayload};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    items: Vec<CandidateItem>,
    payloads: HashMap<i64, ItemPayload>,
}

/// 保存在内存中的数据源，按插入顺序返回条目
#[derive(Default)]
pub struct MemorySource {
    inner: Mutex<Inner>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增或替换条目；`payload` 为 None 表示取不到内容
    pub async fn upsert(&self, item: CandidateItem, payload: Option<ItemPayload>) {
        let mut inner = self.inner.lock().await;
        match payload {
            Some(p) => {
                inner.payloads.insert(item.id, p);
            }
            None => {
                inner.payloads.remove(&item.id);
            }
        }
        if let Some(existing) = inner.items.iter_mut().find(|i| i.id == item.id) {
            *existing = item;
        } else {
            inner.items.push(item);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SourceSystem for MemorySource {
    async fn list_changed_since(&self, _since: DateTime<Utc>) -> Result<Vec<CandidateItem>> {
        Ok(self.inner.lock().await.items.clone())
    }

    async fn fetch_payload(&self, id: i64) -> Result<Option<ItemPayload>> {
        Ok(self.inner.lock().await.payloads.get(&id).cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
