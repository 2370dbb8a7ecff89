use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};

use box_warden::network::ReqwestFetcher;
use box_warden::utils::SystemRunner;
use box_warden::{AppConfig, Orchestrator, RunOutcome};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// 只验证配置并打印端口分配，不启动
    #[arg(long)]
    check: bool,
}

async fn run(args: &Args) -> Result<RunOutcome> {
    info!("📄 Loading config from: {}", args.config);
    let config = AppConfig::load(&args.config)?;
    info!("✅ Configuration loaded successfully");

    let runner = Arc::new(SystemRunner::default());
    let fetcher = Arc::new(ReqwestFetcher::new(Duration::from_secs(10))?);
    let mut orchestrator = Orchestrator::new(config, runner, fetcher)?;

    if args.check {
        for (protocol, port) in orchestrator.ports().iter() {
            info!("  {} -> {}", protocol, port);
        }
        info!("✅ 配置检查通过");
        return Ok(RunOutcome::Terminated);
    }

    Ok(orchestrator.run().await?)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // 初始化日志
    // 优先使用环境变量 RUST_LOG，否则使用命令行参数
    let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone());

    let log_level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("🚀 Starting box-warden {}", env!("CARGO_PKG_VERSION"));

    match run(&args).await {
        Ok(RunOutcome::Handoff) => info!("👋 已交接给新进程"),
        Ok(RunOutcome::Terminated) => info!("👋 已退出"),
        Err(e) => {
            error!("[FATAL] {:#}", e);
            std::process::exit(1);
        }
    }
}
