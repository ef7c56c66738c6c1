//! 营销平台 REST 接口适配
//!
//! 使用 client_credentials 获取访问令牌并缓存到过期前 60 秒；
//! 令牌失效（HTTP 401 或接口错误码 601/602）时刷新一次并重发请求。

use super::SourceSystem;
use crate::config::SourceConfig;
use crate::error::ArchiveError;
use crate::models::{CandidateItem, ItemPayload};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const EMAILS_PATH: &str = "/rest/asset/v1/emails.json";
/// 令牌提前刷新的余量
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// 访问令牌
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// 接口统一响应结构
#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    result: Option<Vec<T>>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TypedValue {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderRef {
    #[serde(default)]
    folder_name: Option<String>,
}

/// 邮件资产记录
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailRecord {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(deserialize_with = "de_timestamp")]
    created_at: DateTime<Utc>,
    #[serde(deserialize_with = "de_timestamp")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    folder: Option<FolderRef>,
    #[serde(default)]
    subject: Option<TypedValue>,
    #[serde(default)]
    from_name: Option<TypedValue>,
    #[serde(default)]
    from_email: Option<TypedValue>,
}

impl EmailRecord {
    fn into_candidate(self) -> CandidateItem {
        CandidateItem {
            id: self.id,
            display_name: self.name,
            created_at: self.created_at,
            updated_at: self.updated_at,
            group_label: self
                .folder
                .and_then(|f| f.folder_name)
                .filter(|n| !n.trim().is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FullContent {
    #[serde(default)]
    content: Option<String>,
}

fn typed(value: Option<TypedValue>) -> Option<String> {
    value.and_then(|v| v.value).filter(|v| !v.is_empty())
}

/// 解析平台时间戳，兼容 `2024-01-15T10:00:00Z+0000` 这种格式
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let ts = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ%z")
        .with_context(|| format!("invalid timestamp: {}", raw))?;
    Ok(ts.with_timezone(&Utc))
}

fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// 令牌过期或无效
fn is_token_error(code: &str) -> bool {
    matches!(code, "601" | "602")
}

/// 接口错误码转换为可分类的错误
fn envelope_error(errors: &[ApiError]) -> ArchiveError {
    let message = errors
        .iter()
        .map(|e| format!("{}: {}", e.code, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    let message = if message.is_empty() {
        "request was not successful".to_string()
    } else {
        message
    };

    if errors.iter().any(|e| is_token_error(&e.code)) {
        return ArchiveError::Auth(message);
    }
    // 604 超时、606 限流、611 系统错误、615 并发限制
    if errors
        .iter()
        .any(|e| matches!(e.code.as_str(), "604" | "606" | "611" | "615"))
    {
        return ArchiveError::remote(None, message);
    }
    ArchiveError::remote(Some(400), message)
}

fn transport_error(err: reqwest::Error) -> ArchiveError {
    ArchiveError::remote(err.status().map(|s| s.as_u16()), err.to_string())
}

/// 营销平台 REST 数据源
pub struct RestSource {
    client: reqwest::Client,
    base_url: String,
    identity_url: String,
    client_id: String,
    client_secret: String,
    page_size: u32,
    token: Mutex<Option<AccessToken>>,
}

impl RestSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::with_client(config, client))
    }

    fn with_client(config: &SourceConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            identity_url: config.identity_url().trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            page_size: config.page_size.max(1),
            token: Mutex::new(None),
        }
    }

    /// 获取有效令牌，必要时重新申请
    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        debug!("申请访问令牌: {}", self.identity_url);
        let resp = self
            .client
            .get(format!("{}/oauth/token", self.identity_url))
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(
                ArchiveError::remote(Some(status.as_u16()), "token endpoint unavailable").into(),
            );
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ArchiveError::Auth(format!("HTTP {}: {}", status.as_u16(), body)).into());
        }

        let token: TokenResponse = resp
            .json()
            .await
            .context("failed to decode token response")?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_MARGIN);
        let value = token.access_token;
        *guard = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// 发送 GET 请求并解析响应；令牌失效时刷新一次
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Vec<T>>> {
        let url = format!("{}{}", self.base_url, path);
        let mut reauthenticated = false;

        loop {
            let token = self.access_token().await?;
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await
                .map_err(transport_error)?;

            let status = resp.status();
            if status.as_u16() == 401 && !reauthenticated {
                warn!("访问令牌被拒绝，重新认证后重试: {}", path);
                self.invalidate_token().await;
                reauthenticated = true;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ArchiveError::remote(
                    Some(status.as_u16()),
                    format!("GET {} failed: {}", path, body),
                )
                .into());
            }

            let envelope: Envelope<T> = resp
                .json()
                .await
                .with_context(|| format!("failed to decode response of {}", path))?;
            if envelope.success {
                return Ok(envelope.result);
            }
            // 702: 没有数据
            if envelope.errors.iter().any(|e| e.code == "702") {
                return Ok(None);
            }
            if envelope.errors.iter().any(|e| is_token_error(&e.code)) && !reauthenticated {
                warn!("访问令牌已过期，重新认证后重试: {}", path);
                self.invalidate_token().await;
                reauthenticated = true;
                continue;
            }
            return Err(envelope_error(&envelope.errors).into());
        }
    }
}

#[async_trait]
impl SourceSystem for RestSource {
    async fn list_changed_since(&self, since: DateTime<Utc>) -> Result<Vec<CandidateItem>> {
        debug!("列出邮件资产 (since={})", since.to_rfc3339());
        let mut items = Vec::new();
        let mut offset: u64 = 0;
        let mut pages = 0u32;

        loop {
            let page: Vec<EmailRecord> = self
                .get_json(
                    EMAILS_PATH,
                    &[
                        ("offset", offset.to_string()),
                        ("maxReturn", self.page_size.to_string()),
                    ],
                )
                .await?
                .unwrap_or_default();

            pages += 1;
            let count = page.len();
            items.extend(page.into_iter().map(EmailRecord::into_candidate));
            debug!("第 {} 页: {} 条", pages, count);

            // 不满一页即没有后续数据
            if count < self.page_size as usize {
                break;
            }
            offset += count as u64;
        }

        info!("共列出 {} 个邮件资产 ({} 页)", items.len(), pages);
        Ok(items)
    }

    async fn fetch_payload(&self, id: i64) -> Result<Option<ItemPayload>> {
        let record = self
            .get_json::<EmailRecord>(&format!("/rest/asset/v1/email/{}.json", id), &[])
            .await?
            .and_then(|r| r.into_iter().next());
        let Some(record) = record else {
            return Ok(None);
        };

        let content = self
            .get_json::<FullContent>(
                &format!("/rest/asset/v1/email/{}/fullContent.json", id),
                &[],
            )
            .await?
            .and_then(|r| r.into_iter().next())
            .and_then(|c| c.content);

        Ok(Some(ItemPayload {
            html_body: content,
            subject: typed(record.subject),
            sender_name: typed(record.from_name),
            sender_address: typed(record.from_email),
        }))
    }

    async fn probe(&self) -> Result<()> {
        self.invalidate_token().await;
        self.access_token().await.map(|_| ())
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}
