//! Command-line client for ChunkDrop uploads.

mod report;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chunkdrop_client::{
    LocalMirror, RetryPolicy, UploadConfig, UploadError, UploadRequest, Uploader, WsClient,
};
use chunkdrop_protocol::constants::DEFAULT_CHUNK_SIZE;
use chunkdrop_protocol::types::UploadMetadata;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER: &str = "ws://127.0.0.1:7640";

#[derive(Parser)]
#[command(name = "chunkdrop")]
#[command(about = "Resumable chunked uploads")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    client: ClientArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ClientArgs {
    /// Server WebSocket URL
    #[arg(long, global = true, env = "CHUNKDROP_SERVER", default_value = DEFAULT_SERVER)]
    server: String,

    /// Chunk size in bytes for new uploads
    #[arg(long, global = true, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// Chunks sent concurrently per batch
    #[arg(long, global = true, default_value_t = 3)]
    concurrency: usize,

    /// Attempts per chunk within one pass
    #[arg(long, global = true, default_value_t = 3)]
    retries: u32,

    /// Directory for the local record of unfinished uploads
    #[arg(long, global = true)]
    mirror_dir: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct MetadataArgs {
    /// Title stored with the archive
    #[arg(long)]
    title: Option<String>,

    /// Tag stored with the archive (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Summary stored with the archive
    #[arg(long)]
    summary: Option<String>,

    /// Category stored with the archive
    #[arg(long)]
    category: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, continuing a previous attempt if one is remembered
    Upload {
        file: PathBuf,
        #[command(flatten)]
        metadata: MetadataArgs,
    },
    /// Continue a known upload session
    Resume {
        upload_id: String,
        file: PathBuf,
        #[command(flatten)]
        metadata: MetadataArgs,
    },
    /// Show server-side progress of an upload
    Status { upload_id: String },
    /// Discard an upload session
    Cancel { upload_id: String },
}

impl ClientArgs {
    fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            retry: RetryPolicy {
                max_attempts: self.retries,
                ..RetryPolicy::default()
            },
            ..UploadConfig::default()
        }
    }

    fn mirror(&self) -> Option<LocalMirror> {
        self.mirror_dir
            .clone()
            .or_else(LocalMirror::default_dir)
            .map(LocalMirror::new)
    }
}

impl MetadataArgs {
    fn into_metadata(self, file: &std::path::Path) -> UploadMetadata {
        let title = self.title.unwrap_or_else(|| {
            file.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        UploadMetadata {
            title,
            tags: self.tags,
            summary: self.summary.unwrap_or_default(),
            category: self.category.unwrap_or_default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.client.upload_config();
    config.validate()?;

    let client = WsClient::connect(&cli.client.server)
        .await
        .with_context(|| format!("failed to connect to {}", cli.client.server))?
        .with_timeouts(config.request_timeout, config.chunk_timeout);
    let mut uploader = Uploader::new(Arc::new(client), config);
    if let Some(mirror) = cli.client.mirror() {
        uploader = uploader.with_mirror(mirror);
    }

    match cli.command {
        Commands::Upload { file, metadata } => {
            let req = UploadRequest::new(&file).with_metadata(metadata.into_metadata(&file));
            run_upload(uploader, req).await
        }
        Commands::Resume {
            upload_id,
            file,
            metadata,
        } => {
            let req = UploadRequest::new(&file)
                .with_metadata(metadata.into_metadata(&file))
                .resume(upload_id);
            run_upload(uploader, req).await
        }
        Commands::Status { upload_id } => {
            let progress = uploader.status(&upload_id).await?;
            println!("{}", report::progress_line(&progress));
            Ok(())
        }
        Commands::Cancel { upload_id } => {
            let result = uploader.cancel(&upload_id).await?;
            if result.message.is_empty() {
                println!("cancelled {upload_id}");
            } else {
                println!("{}", result.message);
            }
            Ok(())
        }
    }
}

async fn run_upload(mut uploader: Uploader, req: UploadRequest) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, stopping after the current batch");
            interrupt.cancel();
        }
    });

    let mut events = uploader
        .take_events()
        .context("upload events already taken")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = report::event_line(&event) {
                eprintln!("{line}");
            }
        }
    });

    let result = uploader.upload(&req, cancel).await;
    // Closes the event channel so the printer drains and exits.
    drop(uploader);
    printer.await?;

    match result {
        Ok(outcome) => {
            println!("{}", report::outcome_line(&outcome));
            Ok(())
        }
        Err(UploadError::Cancelled) => {
            eprintln!("upload paused; run the same command again to resume");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
