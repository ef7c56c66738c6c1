//! 条目物化 - 获取内容、计算归档位置、去重并上传

use super::retry::RetryExecutor;
use crate::error::ArchiveError;
use crate::models::{ArchivePlacement, CandidateItem, ItemPayload, Outcome};
use crate::source::SourceSystem;
use crate::target::{Properties, TargetSystem};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// 没有分组时使用的目录名
pub const UNCATEGORIZED: &str = "Uncategorized";

fn forbidden_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[/\\:*?"<>|]"#).expect("valid regex"))
}

/// 替换路径中不允许出现的字符
///
/// 只由点组成的名称（`.`、`..`）会被解释为目录跳转，同样替换为 `-`。
pub fn sanitize(name: &str) -> String {
    let cleaned = forbidden_chars().replace_all(name, "-").trim().to_string();
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "-")
    } else {
        cleaned
    }
}

/// 归档位置：`[年, 月, 分组]` 与 `{id}-{名称}`
pub fn placement_for(candidate: &CandidateItem) -> ArchivePlacement {
    let group = candidate
        .group_label
        .as_deref()
        .map(sanitize)
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| UNCATEGORIZED.to_string());

    ArchivePlacement {
        container_path: vec![
            candidate.created_at.format("%Y").to_string(),
            candidate.created_at.format("%m").to_string(),
            group,
        ],
        file_base_name: format!("{}-{}", candidate.id, sanitize(&candidate.display_name)),
    }
}

/// 计算内容 hash（blake3，取前 32 个十六进制字符）
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex()[..32].to_string()
}

fn rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// HTML 节点上的属性
fn html_properties(
    candidate: &CandidateItem,
    payload: &ItemPayload,
    hash: Option<&str>,
    synced_at: &DateTime<Utc>,
) -> Properties {
    let mut props = Properties::new();
    props.insert("archive:emailId".into(), json!(candidate.id));
    props.insert("archive:displayName".into(), json!(candidate.display_name));
    props.insert("archive:groupLabel".into(), json!(candidate.group_label));
    props.insert("archive:subject".into(), json!(payload.subject));
    props.insert("archive:senderName".into(), json!(payload.sender_name));
    props.insert("archive:senderAddress".into(), json!(payload.sender_address));
    props.insert(
        "archive:sourceCreatedAt".into(),
        json!(rfc3339(&candidate.created_at)),
    );
    props.insert(
        "archive:sourceUpdatedAt".into(),
        json!(rfc3339(&candidate.updated_at)),
    );
    props.insert("archive:syncedAt".into(), json!(rfc3339(synced_at)));
    props.insert("archive:contentHash".into(), json!(hash));
    props
}

/// 元数据文件内容（键有序）
fn metadata_document(
    candidate: &CandidateItem,
    payload: &ItemPayload,
    synced_at: &DateTime<Utc>,
) -> Result<Vec<u8>> {
    let doc = json!({
        "candidate": serde_json::to_value(candidate)?,
        "payload": serde_json::to_value(payload)?,
        "syncedAt": rfc3339(synced_at),
    });
    Ok(serde_json::to_vec_pretty(&doc)?)
}

pub struct ItemMaterializer {
    source: Arc<dyn SourceSystem>,
    target: Arc<dyn TargetSystem>,
    retry: RetryExecutor,
}

impl ItemMaterializer {
    pub fn new(
        source: Arc<dyn SourceSystem>,
        target: Arc<dyn TargetSystem>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            source,
            target,
            retry,
        }
    }

    /// 处理单个条目，任何错误都转为 `Outcome::Failed`
    pub async fn materialize(&self, candidate: &CandidateItem) -> Outcome {
        let payload = match self.fetch(candidate.id).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("条目 {} 获取内容失败: {:#}", candidate.id, e);
                return Outcome::Failed(format!("{:#}", e));
            }
        };

        let placement = placement_for(candidate);
        match self.upload(candidate, &payload, &placement).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("条目 {} 归档失败: {:#}", candidate.id, e);
                Outcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn fetch(&self, id: i64) -> Result<ItemPayload> {
        let source = self.source.as_ref();
        let payload = self
            .retry
            .execute(&format!("获取条目 {}", id), || source.fetch_payload(id))
            .await?;

        match payload {
            Some(p) if p.body().is_some() => Ok(p),
            _ => Err(ArchiveError::MissingPayload(id).into()),
        }
    }

    async fn upload(
        &self,
        candidate: &CandidateItem,
        payload: &ItemPayload,
        placement: &ArchivePlacement,
    ) -> Result<Outcome> {
        let target = self.target.as_ref();
        let segments = &placement.container_path;
        let html_name = placement.html_name();

        let container = self
            .retry
            .execute("创建归档目录", || target.ensure_container_path(segments))
            .await
            .with_context(|| format!("ensure container {}", segments.join("/")))?;

        let existing = self
            .retry
            .execute("查找已归档条目", || {
                target.find_child_by_name(&container, &html_name)
            })
            .await
            .with_context(|| format!("look up {}", html_name))?;

        let synced_at = Utc::now();
        let metadata_name = placement.metadata_name();
        let metadata = metadata_document(candidate, payload, &synced_at)?;

        if let Some(node) = existing {
            // 上次运行可能在 HTML 之后中断，补齐元数据文件
            let has_metadata = self
                .retry
                .execute("查找元数据", || {
                    target.find_child_by_name(&container, &metadata_name)
                })
                .await
                .with_context(|| format!("look up {}", metadata_name))?;
            if has_metadata.is_none() {
                self.retry
                    .execute("补传元数据", || {
                        target.create_child(
                            &container,
                            &metadata_name,
                            metadata.clone(),
                            Properties::new(),
                        )
                    })
                    .await
                    .with_context(|| format!("upload {}", metadata_name))?;
                info!("条目 {} 已补齐元数据: {}", candidate.id, metadata_name);
            }
            debug!("条目 {} 已归档，跳过: {}", candidate.id, node);
            return Ok(Outcome::AlreadyExists(node));
        }

        let body = payload.body().unwrap_or_default().as_bytes().to_vec();
        let hash = content_hash(&body);
        let properties = html_properties(candidate, payload, Some(&hash), &synced_at);

        let node = self
            .retry
            .execute("上传 HTML", || {
                target.create_child(&container, &html_name, body.clone(), properties.clone())
            })
            .await
            .with_context(|| format!("upload {}", html_name))?;

        self.retry
            .execute("上传元数据", || {
                target.create_child(&container, &metadata_name, metadata.clone(), Properties::new())
            })
            .await
            .with_context(|| format!("upload {}", metadata_name))?;

        info!("已归档条目 {}: {}", candidate.id, node);
        Ok(Outcome::Uploaded(node))
    }
}
