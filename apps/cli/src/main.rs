mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chunkup_engine::EngineConfig;

#[derive(Parser)]
#[command(name = "chunkup")]
#[command(version, about = "Resumable chunked file uploads", long_about = None)]
struct Cli {
    /// Engine config file (defaults to <config dir>/chunkup/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Upload endpoint base URL, overriding the config file
    #[arg(long, global = true, value_name = "URL")]
    server: Option<String>,

    /// Chunk size in bytes
    #[arg(long, global = true, value_name = "BYTES")]
    chunk_size: Option<u64>,

    /// Maximum chunks in flight per file
    #[arg(short = 'j', long, global = true, value_name = "N")]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show uploads that can be resumed
    List,

    /// Resume an interrupted upload, reading its bytes from PATH again
    Resume { file_id: String, path: PathBuf },

    /// Abandon an unfinished upload
    Cancel { file_id: String },
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load_from(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => EngineConfig::load().context("reading config")?,
        };
        if let Some(url) = &self.server {
            config.server.base_url = url.clone();
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(n) = self.concurrency {
            config.concurrent_uploads = n;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,chunkup_engine=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.engine_config()?;

    match cli.command {
        Commands::Upload { files } => commands::upload(config, &files).await,
        Commands::List => commands::list(config).await,
        Commands::Resume { file_id, path } => commands::resume(config, &file_id, &path).await,
        Commands::Cancel { file_id } => commands::cancel(config, &file_id).await,
    }
}
