use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use strmsync_lib::logging::{LogConfig, SizeRotatingWriter};
use strmsync_lib::{Config, RecordStore, RunCommand, SyncEngine, UpdateMode};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(
    name = "strmsync",
    version,
    about = "Mirror AList media libraries into local .strm files"
)]
struct Cli {
    /// Path to config file (.json, or YAML for any other extension)
    #[arg(short, long, env = "STRMSYNC_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Regenerate every .strm file from a full remote walk
    FreshAll,
    /// Bring local .strm files in line with the remote tree
    Update {
        #[arg(long, value_enum, default_value_t = Mode::Local)]
        mode: Mode,
    },
    /// Rebuild the record database from a full walk without writing files
    UpdateDatabase,
    /// Verify that every local .strm still points at a playable URL
    Check {
        /// Delete invalid .strm files and their records
        #[arg(long)]
        remove: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Only add what is missing locally
    Local,
    /// Delete what no longer exists remotely
    Remote,
}

impl From<Mode> for UpdateMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Local => UpdateMode::Local,
            Mode::Remote => UpdateMode::Remote,
        }
    }
}

/// 默认配置文件不在当前目录时，查找用户配置目录
fn resolve_config_path(path: &Path) -> PathBuf {
    if path.exists() || path != Path::new("config.json") {
        return path.to_path_buf();
    }
    strmsync_lib::dirs::config_dir()
        .map(|dir| dir.join("strmsync").join("config.json"))
        .filter(|p| p.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// 初始化日志系统
fn init_logging(config: &LogConfig, verbosity: u8) {
    let level = config.tracing_level(verbosity);
    let env_filter = || {
        let filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();
        ["hyper=warn", "reqwest=warn", "sqlx=warn"]
            .iter()
            .filter_map(|d| d.parse().ok())
            .fold(filter, |f, d| f.add_directive(d))
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.colored)
        .with_target(false);

    let file_writer = config.file.as_ref().and_then(|path| {
        SizeRotatingWriter::new(path, config.max_size_mb)
            .inspect_err(|e| eprintln!("无法打开日志文件 {}: {}", path.display(), e))
            .ok()
    });

    match file_writer {
        Some(writer) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(console_layer)
                .with(file_layer)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(console_layer)
                .try_init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(&cli.config);
    let config = Config::load(&config_path)
        .with_context(|| format!("加载配置 {} 失败", config_path.display()))?;

    init_logging(&LogConfig::from_config(&config), cli.verbose);
    tracing::debug!("使用配置文件 {}", config_path.display());
    config.log_debug_info();

    let db_path = config.database_path();
    let store = Arc::new(
        RecordStore::open(&db_path)
            .await
            .context("打开记录数据库失败")?,
    );
    let engine = SyncEngine::new(Arc::new(config), store.clone());

    let summary = match cli.command {
        Command::FreshAll => engine.run(RunCommand::FreshAll).await,
        Command::Update { mode } => engine.run(RunCommand::Update(mode.into())).await,
        Command::UpdateDatabase => engine.run(RunCommand::UpdateDatabase).await,
        Command::Check { remove } => engine.check(remove).await,
    }?;

    drop(engine);
    if let Ok(store) = Arc::try_unwrap(store) {
        store.close().await;
    }

    if summary.failed > 0 {
        tracing::warn!("{} 个操作失败，详见上方日志", summary.failed);
    }
    Ok(())
}
