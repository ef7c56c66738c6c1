use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use campaign_archiver::core::MARKER_NAME;
use campaign_archiver::logging::init_logging;
use campaign_archiver::models::RunResult;
use campaign_archiver::source::create_source;
use campaign_archiver::target::create_target;
use campaign_archiver::{AppConfig, ArchiveError, SyncCoordinator};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "campaign-archiver")]
#[command(about = "Incrementally archive marketing emails into a document repository")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON configuration file
    #[arg(short, long, global = true, value_name = "PATH", default_value = "archiver.json")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one incremental sync
    Run {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
        /// Override the first-run lookback window
        #[arg(long, value_name = "DAYS")]
        lookback_days: Option<u32>,
        /// Override the pause between items
        #[arg(long, value_name = "MS")]
        item_delay_ms: Option<u64>,
    },
    /// Show the stored sync watermark
    Status,
    /// Check target connectivity and source authentication
    Check,
}

const EXIT_ITEM_FAILURES: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let _guard = init_logging(&config.log);

    let outcome = match cli.command {
        Commands::Run {
            json,
            lookback_days,
            item_delay_ms,
        } => run(config, json, lookback_days, item_delay_ms).await,
        Commands::Status => status(config).await,
        Commands::Check => check(config).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            if matches!(e.downcast_ref::<ArchiveError>(), Some(ArchiveError::Cancelled)) {
                warn!("同步已取消，水位未更新");
            } else {
                error!("{:#}", e);
            }
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(
    mut config: AppConfig,
    json: bool,
    lookback_days: Option<u32>,
    item_delay_ms: Option<u64>,
) -> Result<ExitCode> {
    if let Some(days) = lookback_days {
        config.sync.lookback_days = days;
    }
    if let Some(ms) = item_delay_ms {
        config.sync.item_delay_ms = ms;
    }

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消同步...");
            signal.cancel();
        }
    });

    let coordinator = SyncCoordinator::from_config(&config, cancel).await?;
    let result = coordinator.run_sync().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    Ok(if result.has_failures() {
        ExitCode::from(EXIT_ITEM_FAILURES)
    } else {
        ExitCode::SUCCESS
    })
}

fn print_summary(result: &RunResult) {
    println!("运行 ID:   {}", result.run_id);
    println!("窗口起点:  {}", result.since.to_rfc3339());
    println!("候选条目:  {}", result.total_candidates);
    println!(
        "已处理:    {} (新上传 {}, 已存在 {})",
        result.processed(),
        result.succeeded,
        result.skipped
    );
    println!("失败:      {}", result.failed);
    if result.has_failures() {
        let ids: Vec<String> = result.failed_ids.iter().map(|id| id.to_string()).collect();
        println!("失败 ID:   {}", ids.join(", "));
    }
    println!("耗时:      {}ms", result.duration_ms);
    if result.total_candidates > 0 && !result.watermark_saved {
        println!("警告: 同步水位未能保存，下次运行将重新处理本窗口");
    }
}

async fn status(config: AppConfig) -> Result<ExitCode> {
    let coordinator = SyncCoordinator::from_config(&config, CancellationToken::new()).await?;
    match coordinator.load_state().await.last_sync_timestamp {
        Some(ts) => println!("上次同步: {}", ts.to_rfc3339()),
        None => println!(
            "尚未同步，首次运行将回溯 {} 天",
            config.sync.lookback_days
        ),
    }
    Ok(ExitCode::SUCCESS)
}

async fn check(config: AppConfig) -> Result<ExitCode> {
    let mut healthy = true;

    match check_target(&config).await {
        Ok(detail) => println!("归档目标: 连接成功 ({})", detail),
        Err(e) => {
            healthy = false;
            println!("归档目标: 连接失败: {:#}", e);
        }
    }

    let source = create_source(&config.source)?;
    match source.probe().await {
        Ok(()) => println!("数据源:   认证成功 ({})", source.name()),
        Err(e) => {
            healthy = false;
            println!("数据源:   认证失败: {:#}", e);
        }
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_ITEM_FAILURES)
    })
}

async fn check_target(config: &AppConfig) -> Result<String> {
    let target = create_target(&config.target).await?;
    let root = target.ensure_container_path(&[]).await?;
    let marker = target.find_child_by_name(&root, MARKER_NAME).await?;
    Ok(match marker {
        Some(_) => format!("{}, 已有同步水位", target.name()),
        None => format!("{}, 尚无同步水位", target.name()),
    })
}
