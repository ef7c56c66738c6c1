//! 错误分类 - 区分可重试的传输错误与不可恢复的错误

use thiserror::Error;

/// 归档过程中需要分类处理的错误
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// 远端接口错误（status 为空表示请求未得到 HTTP 响应）
    #[error("remote error{}: {message}", status_suffix(.status))]
    Remote {
        status: Option<u16>,
        message: String,
    },

    /// 认证失败（令牌获取失败或刷新后仍被拒绝）
    #[error("authentication failed: {0}")]
    Auth(String),

    /// 源系统没有返回邮件正文
    #[error("no retrievable body for item {0}")]
    MissingPayload(i64),

    /// 同步被取消
    #[error("sync cancelled")]
    Cancelled,

    /// 配置无效
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ArchiveError {
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {})", s),
        None => String::new(),
    }
}

/// HTTP 状态码是否值得重试：超时、限流和服务端错误
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// 默认重试判定
///
/// 遍历错误链：没有状态码的传输错误可重试；408/429/5xx 可重试；
/// 成功区间和其他客户端错误不重试；存储后端标记为临时的错误可重试；
/// 其余错误（配置、解析等）不重试。
pub fn is_retryable(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ArchiveError>() {
            return match e {
                ArchiveError::Remote { status: None, .. } => true,
                ArchiveError::Remote {
                    status: Some(s), ..
                } => is_retryable_status(*s),
                _ => false,
            };
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            return match e.status() {
                Some(s) => is_retryable_status(s.as_u16()),
                None => !e.is_decode() && !e.is_builder(),
            };
        }
        if let Some(e) = cause.downcast_ref::<opendal::Error>() {
            return e.is_temporary();
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
    }
    false
}
