//! graphagent CLI - Command line interface for storage transfers.
//!
//! This tool runs a single storage request of the agent from the command
//! line: uploading and downloading backups, shipping WAL deltas, and
//! housekeeping on backup directories.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use graphagent_common::{Backend, BackendType, GsBackend, S3Backend};
use graphagent_storage::{
    Dir, DownloadFileRequest, ExistDirRequest, IncrUploadFileRequest, MoveDirRequest,
    RemoveDirRequest, StorageConfig, StorageService, UploadFileRequest,
};

#[derive(Parser)]
#[command(name = "graphagent")]
#[command(about = "graphagent - External storage transfers for graph database backups")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transfer rate limit in Mbps, 0 for unlimited. Overrides the config file.
    #[arg(long)]
    ratelimit: Option<u64>,

    /// Session id the storage client is cached under.
    #[arg(long, default_value = "cli")]
    session: String,

    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CredentialArgs {
    /// S3 access key.
    #[arg(long, env = "GRAPHAGENT_S3_ACCESS_KEY", hide_env_values = true)]
    s3_access_key: Option<String>,

    /// S3 secret key.
    #[arg(long, env = "GRAPHAGENT_S3_SECRET_KEY", hide_env_values = true)]
    s3_secret_key: Option<String>,

    /// S3 endpoint for non-AWS services, e.g. http://127.0.0.1:9000.
    #[arg(long)]
    s3_endpoint: Option<String>,

    /// S3 region.
    #[arg(long)]
    s3_region: Option<String>,

    /// File holding a GCS service account key.
    #[arg(long)]
    gs_credentials: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file or directory.
    Upload {
        /// Local source path.
        #[arg(short, long)]
        source: PathBuf,

        /// Target URI, e.g. s3://bucket/BACKUP_1.
        #[arg(short, long)]
        target: String,

        /// Upload a directory recursively.
        #[arg(short, long)]
        recursive: bool,
    },

    /// Download a file or directory to the local filesystem.
    Download {
        /// Source URI.
        #[arg(short, long)]
        source: String,

        /// Local target path.
        #[arg(short, long)]
        target: PathBuf,

        /// Download a directory recursively.
        #[arg(short, long)]
        recursive: bool,
    },

    /// Upload the WAL segments of a partition written since the last backup.
    IncrUpload {
        /// Local partition WAL directory.
        #[arg(short, long)]
        source: PathBuf,

        /// Target URI.
        #[arg(short, long)]
        target: String,

        /// Last log id confirmed by the previous backup.
        #[arg(long, allow_negative_numbers = true)]
        commit_log_id: i64,

        /// Last log id known to be present.
        #[arg(long, allow_negative_numbers = true)]
        last_log_id: i64,
    },

    /// Check whether a directory exists.
    ExistDir {
        /// URI, or a plain local path.
        target: String,
    },

    /// List the subdirectories of a directory.
    ListDir {
        /// URI, or a plain local path.
        target: String,
    },

    /// Remove a directory and everything below it.
    RemoveDir {
        /// URI, or a plain local path.
        target: String,
    },

    /// Rename a local directory.
    MoveDir {
        /// Current path.
        #[arg(short, long)]
        source: PathBuf,

        /// New path.
        #[arg(short, long)]
        target: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref(), cli.ratelimit).await?;
    let service = StorageService::new(&config).context("Failed to start storage service")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling transfer");
            on_interrupt.cancel();
        }
    });

    let ctx = Ctx {
        service,
        session: cli.session,
        credentials: cli.credentials,
        cancel,
    };

    match cli.command {
        Commands::Upload {
            source,
            target,
            recursive,
        } => cmd_upload(&ctx, &source, &target, recursive).await,

        Commands::Download {
            source,
            target,
            recursive,
        } => cmd_download(&ctx, &source, &target, recursive).await,

        Commands::IncrUpload {
            source,
            target,
            commit_log_id,
            last_log_id,
        } => cmd_incr_upload(&ctx, &source, &target, commit_log_id, last_log_id).await,

        Commands::ExistDir { target } => cmd_exist_dir(&ctx, &target).await,

        Commands::ListDir { target } => cmd_list_dir(&ctx, &target).await,

        Commands::RemoveDir { target } => cmd_remove_dir(&ctx, &target).await,

        Commands::MoveDir { source, target } => cmd_move_dir(&ctx, &source, &target).await,
    }
}

struct Ctx {
    service: StorageService,
    session: String,
    credentials: CredentialArgs,
    cancel: CancellationToken,
}

/// Read the config file if given, then apply flag overrides.
async fn load_config(path: Option<&Path>, ratelimit: Option<u64>) -> Result<StorageConfig> {
    let mut config = match path {
        Some(path) => StorageConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StorageConfig::default(),
    };
    if let Some(mbps) = ratelimit {
        config.rate_limit_mbps = mbps;
    }
    config.validate()?;
    Ok(config)
}

/// Build the backend for `uri`, filling in credentials from the flags.
async fn backend(uri: &str, credentials: &CredentialArgs) -> Result<Backend> {
    let template = match BackendType::parse(uri) {
        Some(BackendType::S3) => Backend::from(S3Backend {
            access_key: credentials.s3_access_key.clone().unwrap_or_default(),
            secret_key: credentials.s3_secret_key.clone().unwrap_or_default(),
            endpoint: credentials.s3_endpoint.clone().unwrap_or_default(),
            region: credentials.s3_region.clone().unwrap_or_default(),
            ..Default::default()
        }),
        Some(BackendType::Gs) => {
            let credentials = match &credentials.gs_credentials {
                Some(path) => tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => String::new(),
            };
            Backend::from(GsBackend {
                credentials,
                ..Default::default()
            })
        }
        Some(BackendType::Local) => Backend::default(),
        None => anyhow::bail!("Unknown storage backend type: {}", uri),
    };

    let mut backend = template;
    backend.set_uri(uri).context("Invalid storage uri")?;
    Ok(backend)
}

/// Upload a local path.
async fn cmd_upload(ctx: &Ctx, source: &Path, target: &str, recursive: bool) -> Result<()> {
    info!("Uploading {} to {}", source.display(), target);

    let req = UploadFileRequest {
        session_id: ctx.session.clone(),
        source_path: source.display().to_string(),
        target_backend: backend(target, &ctx.credentials).await?,
        recursively: recursive,
    };
    ctx.service
        .upload_file(&ctx.cancel, &req)
        .await
        .context("Upload failed")?;

    println!("Uploaded {} to {}", source.display(), target);
    Ok(())
}

/// Download to a local path.
async fn cmd_download(ctx: &Ctx, source: &str, target: &Path, recursive: bool) -> Result<()> {
    info!("Downloading {} to {}", source, target.display());

    let req = DownloadFileRequest {
        session_id: ctx.session.clone(),
        source_backend: backend(source, &ctx.credentials).await?,
        target_path: target.display().to_string(),
        recursively: recursive,
    };
    ctx.service
        .download_file(&ctx.cancel, &req)
        .await
        .context("Download failed")?;

    println!("Downloaded {} to {}", source, target.display());
    Ok(())
}

/// Ship the WAL delta of a partition.
async fn cmd_incr_upload(
    ctx: &Ctx,
    source: &Path,
    target: &str,
    commit_log_id: i64,
    last_log_id: i64,
) -> Result<()> {
    info!(
        "Incrementally uploading {} to {}, commit log id {}, last log id {}",
        source.display(),
        target,
        commit_log_id,
        last_log_id
    );

    let req = IncrUploadFileRequest {
        session_id: ctx.session.clone(),
        target_backend: backend(target, &ctx.credentials).await?,
        source_path: source.display().to_string(),
        commit_log_id,
        last_log_id,
    };
    ctx.service
        .incr_upload_file(&ctx.cancel, &req)
        .await
        .context("Incremental upload failed")?;

    println!("Uploaded WAL delta of {} to {}", source.display(), target);
    Ok(())
}

/// Check a directory.
async fn cmd_exist_dir(ctx: &Ctx, target: &str) -> Result<()> {
    let exists = if BackendType::parse(target).is_none() {
        ctx.service
            .exist_dir(&ExistDirRequest {
                path: target.to_string(),
            })
            .await?
    } else {
        let backend = backend(target, &ctx.credentials).await?;
        ctx.service
            .storage(&ctx.session, &backend)?
            .exist_dir(target)
            .await?
    };

    println!("{}", exists);
    Ok(())
}

/// List subdirectories.
async fn cmd_list_dir(ctx: &Ctx, target: &str) -> Result<()> {
    let uri = match BackendType::parse(target) {
        Some(_) => target.to_string(),
        None => format!("{}{}", graphagent_common::LOCAL_PREFIX, target),
    };
    let backend = backend(&uri, &ctx.credentials).await?;
    let dirs = ctx
        .service
        .storage(&ctx.session, &backend)?
        .list_dir(&uri)
        .await
        .context("Failed to list directory")?;

    if dirs.is_empty() {
        println!("(empty)");
    } else {
        for dir in dirs {
            println!("  [DIR]  {}", dir);
        }
    }
    Ok(())
}

/// Remove a directory.
async fn cmd_remove_dir(ctx: &Ctx, target: &str) -> Result<()> {
    info!("Removing {}", target);

    if BackendType::parse(target).is_none() {
        ctx.service
            .remove_dir(&RemoveDirRequest {
                path: target.to_string(),
            })
            .await
            .context("Failed to remove directory")?;
    } else {
        let backend = backend(target, &ctx.credentials).await?;
        ctx.service
            .storage(&ctx.session, &backend)?
            .remove_dir(target)
            .await
            .context("Failed to remove directory")?;
    }

    println!("Removed {}", target);
    Ok(())
}

/// Rename a local directory.
async fn cmd_move_dir(ctx: &Ctx, source: &Path, target: &Path) -> Result<()> {
    info!("Moving {} to {}", source.display(), target.display());

    ctx.service
        .move_dir(&MoveDirRequest {
            src_path: source.display().to_string(),
            dst_path: target.display().to_string(),
        })
        .await
        .context("Failed to move directory")?;

    println!("Moved {} to {}", source.display(), target.display());
    Ok(())
}
