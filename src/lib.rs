//! 营销邮件增量归档
//!
//! 从营销平台增量拉取邮件资产，按 `年/月/分组` 归档到文档库，
//! 以归档根目录下的水位标记记录进度，重复运行不会丢失或重复上传。

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod models;
pub mod source;
pub mod storage;
pub mod target;

pub use config::AppConfig;
pub use core::{RetryExecutor, RetryPolicy, SyncCoordinator};
pub use error::ArchiveError;
pub use models::{CandidateItem, ItemPayload, Outcome, RunResult, SyncState};
pub use source::SourceSystem;
pub use target::TargetSystem;
