//! 日志模块 - 控制台日志与带大小限制的文件日志

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_NAME: &str = "archiver.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件（控制台日志始终开启）
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志目录，缺省为 `~/.campaign-archiver/logs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            level: default_level(),
            max_size_mb: default_max_size_mb(),
            dir: None,
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => PathBuf::from(dir),
            None => default_log_dir(),
        }
    }
}

/// 默认日志目录
pub fn default_log_dir() -> PathBuf {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".campaign-archiver"))
        .unwrap_or_else(|| PathBuf::from(".campaign-archiver"))
        .join("logs")
}

/// 带大小限制的日志写入器
///
/// 超过上限时把当前文件改名为 `archiver.log.old`（覆盖旧备份）并重新打开。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        Self::with_limit(log_dir, (max_size_mb as u64) * 1024 * 1024)
    }

    fn with_limit(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let (writer, written) = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            written,
            writer: Some(writer),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<(BufWriter<File>, u64)> {
        // 检查现有文件大小，如果超过限制则轮转
        if let Ok(metadata) = fs::metadata(file_path) {
            if metadata.len() > max_size {
                Self::rotate_log(file_path)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let len = file.metadata()?.len();

        Ok((BufWriter::new(file), len))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }
        Self::rotate_log(&self.file_path)?;
        let (writer, written) = Self::open_file(&self.file_path, self.max_size)?;
        self.writer = Some(writer);
        self.written = written;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.writer.is_none() {
            let (writer, written) = Self::open_file(&self.file_path, self.max_size)?;
            self.writer = Some(writer);
            self.written = written;
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "writer not available"));
        };

        writer.write_all(buf)?;
        writer.flush()?;
        self.written += buf.len() as u64;

        if self.written > self.max_size {
            self.rotate()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| {
        format!(
            "{},hyper=warn,reqwest=warn,opendal=warn",
            config.tracing_level().as_str().to_lowercase()
        )
    });
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 初始化日志系统
///
/// 返回的 guard 需要持有到进程结束，否则文件日志可能丢失尾部内容。
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = build_filter(config);
    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    if !config.enabled {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init();
        return None;
    }

    let log_dir = config.log_dir();
    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(writer) => {
            let (file_writer, guard) = tracing_appender::non_blocking(writer);
            let file_layer = fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(console_layer)
                .try_init();
            tracing::warn!("无法创建日志文件 {:?}，仅输出到控制台: {}", log_dir, e);
            None
        }
    }
}
