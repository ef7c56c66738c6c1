//! 应用配置模块

use crate::core::RetryPolicy;
use crate::error::ArchiveError;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 存储类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
    WebDav,
}

/// 归档目标存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdav_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl StorageConfig {
    /// 本地目录
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            typ: StorageType::Local,
            path: Some(path.into()),
            bucket: None,
            region: None,
            access_key: None,
            secret_key: None,
            endpoint: None,
            prefix: None,
            webdav_endpoint: None,
            username: None,
            password: None,
            root: None,
        }
    }
}

/// 营销平台接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// REST 接口地址，如 https://123-ABC-456.mktorest.com
    pub base_url: String,
    /// 认证地址，默认 {baseUrl}/identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_url: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// 每页条数
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// 单次请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_page_size() -> u32 {
    200
}

fn default_timeout_secs() -> u64 {
    30
}

impl SourceConfig {
    pub fn identity_url(&self) -> String {
        self.identity_url
            .clone()
            .unwrap_or_else(|| format!("{}/identity", self.base_url.trim_end_matches('/')))
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
    }
}

/// 同步行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 首次运行（没有水位）时回溯的天数
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// 每个条目处理后的等待（毫秒），用于限速
    #[serde(default = "default_item_delay_ms")]
    pub item_delay_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_lookback_days() -> u32 {
    90
}

fn default_item_delay_ms() -> u64 {
    100
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            item_delay_ms: default_item_delay_ms(),
            retry: RetrySettings::default(),
        }
    }
}

impl SyncSettings {
    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }
}

/// 应用配置，进程入口处构建一次后按参数传递
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub source: SourceConfig,
    pub target: StorageConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从 JSON 文件加载配置，并应用环境变量覆盖
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// 凭据优先从环境变量读取，避免写入配置文件
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = lookup("ARCHIVER_CLIENT_ID") {
            self.source.client_id = v;
        }
        if let Some(v) = lookup("ARCHIVER_CLIENT_SECRET") {
            self.source.client_secret = v;
        }
        if let Some(v) = lookup("ARCHIVER_S3_ACCESS_KEY") {
            self.target.access_key = Some(v);
        }
        if let Some(v) = lookup("ARCHIVER_S3_SECRET_KEY") {
            self.target.secret_key = Some(v);
        }
        if let Some(v) = lookup("ARCHIVER_WEBDAV_PASSWORD") {
            self.target.password = Some(v);
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.source.base_url.trim().is_empty() {
            return Err(ArchiveError::Config("source.baseUrl is required".into()));
        }
        if self.source.client_id.is_empty() || self.source.client_secret.is_empty() {
            return Err(ArchiveError::Config(
                "source.clientId and source.clientSecret are required".into(),
            ));
        }
        if self.source.page_size == 0 {
            return Err(ArchiveError::Config("source.pageSize must be positive".into()));
        }
        let retry = &self.sync.retry;
        if retry.max_attempts == 0 {
            return Err(ArchiveError::Config(
                "sync.retry.maxAttempts must be at least 1".into(),
            ));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(ArchiveError::Config(
                "sync.retry.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}
