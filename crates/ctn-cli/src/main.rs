//! ctn: content-addressed encrypted blob store CLI
//!
//! Commands:
//!   put <file>                 - store a file under the SHA-256 of its content
//!   get <uid> [-o <file>]      - decode a blob to a file or stdout
//!   cat <uid>...               - decode several blobs back to back
//!   exists <uid>               - exit status 0 if the blob is stored
//!   rm <uid>                   - delete a blob
//!   inspect <uid> | --file <f> - print the container header of a stored blob or a file

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ctn_core::config::CtnConfig;
use ctn_crypto::{inspect_header, ContainerHeader};
use ctn_storage::{BlobKey, ByteStream, PipelineContext, StoragePipeline, WriteOutcome};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ctn", version, about = "Content-addressed encrypted blob store")]
struct Cli {
    /// Path to the ctn configuration file
    #[arg(
        long,
        short = 'c',
        env = "CTN_CONFIG",
        default_value = "/etc/ctn/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); default from [log]
    #[arg(long, env = "CTN_LOG")]
    log: Option<String>,

    /// Log format (json, text); default from [log]
    #[arg(long, env = "CTN_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a file; prints its content address
    Put { file: PathBuf },

    /// Decode a blob
    Get {
        uid: String,
        /// Output file (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Decode several blobs in order into one stream on stdout
    Cat {
        #[arg(required = true)]
        uids: Vec<String>,
    },

    /// Check whether a blob is stored
    Exists { uid: String },

    /// Delete a blob
    Rm { uid: String },

    /// Show the container header of a stored blob or a local file
    Inspect {
        /// Blob uid (reads the raw stored bytes)
        #[arg(required_unless_present = "file")]
        uid: Option<String>,
        /// Read a container file instead of a stored blob
        #[arg(long, conflicts_with = "uid")]
        file: Option<PathBuf>,
    },
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = CtnConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let level = cli.log.as_deref().unwrap_or(&config.log.level);
    let format = cli.log_format.unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(level, &format);
    // reported here rather than in `load`, which runs before logging exists
    if !cli.config.exists() {
        tracing::warn!(path = %cli.config.display(), "config file not found (using defaults)");
    }
    let pipeline = ctn_storage::build_pipeline(&config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });
    let ctx = PipelineContext::with_cancel(cancel);

    match cli.command {
        Commands::Put { file } => cmd_put(&pipeline, &file, ctx).await,
        Commands::Get { uid, output } => cmd_get(&pipeline, &uid, output.as_deref(), &ctx).await,
        Commands::Cat { uids } => {
            let stream = pipeline.read_concatenated(&uids, &ctx).await?;
            write_out(stream, None).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Exists { uid } => {
            let found = pipeline.exists(&uid).await?;
            println!("{}", if found { "present" } else { "absent" });
            Ok(if found {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Rm { uid } => {
            if pipeline.delete(&uid).await? {
                info!(uid = %uid, "deleted");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{uid}: not found");
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Inspect { uid, file } => {
            let header = match (uid, file) {
                (_, Some(path)) => {
                    let mut f = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?;
                    inspect_header(&mut f).await?
                }
                (Some(uid), None) => {
                    let key = BlobKey::parse(&uid)?;
                    let mut raw = pipeline.backend().read(&key).await?;
                    inspect_header(&mut raw).await?
                }
                (None, None) => anyhow::bail!("inspect needs a uid or --file"),
            };
            print_header(&header);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn cmd_put(
    pipeline: &StoragePipeline,
    file: &Path,
    mut ctx: PipelineContext,
) -> Result<ExitCode> {
    let (uid, len) = content_address(file).await?;
    ctx.size_hint = Some(len);

    let input = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    match pipeline.write(&uid, Box::pin(input), &ctx).await? {
        WriteOutcome::Stored { bytes } => {
            info!(uid = %uid, plaintext = len, stored = bytes, "stored");
        }
        WriteOutcome::Deduplicated => info!(uid = %uid, "already stored"),
    }
    println!("{uid}");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_get(
    pipeline: &StoragePipeline,
    uid: &str,
    output: Option<&Path>,
    ctx: &PipelineContext,
) -> Result<ExitCode> {
    let stream = pipeline.read(uid, ctx).await?;
    write_out(stream, output).await?;
    Ok(ExitCode::SUCCESS)
}

/// Copy a decoded stream to `output`, or stdout. A partial output file is
/// removed if decoding fails.
async fn write_out(mut stream: ByteStream, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?;
            let copied = tokio::io::copy(&mut stream, &mut file).await;
            if let Err(e) = copied {
                drop(file);
                let _ = tokio::fs::remove_file(path).await;
                return Err(ctn_storage::StorageError::from(e).into());
            }
            file.flush().await?;
        }
        None => {
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut stream, &mut stdout)
                .await
                .map_err(ctn_storage::StorageError::from)?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

/// SHA-256 hex digest and length of a file's content.
async fn content_address(path: &Path) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), len))
}

fn print_header(header: &ContainerHeader) {
    println!("layout:           {}", header.layout().name());
    println!("header length:    {}", header.header_len());
    println!("key id:           {}", header.key_id);
    println!("flags:            {:#x}", header.flags);
    match header.declared_length() {
        Some(len) => println!("plaintext length: {len}"),
        None => println!("plaintext length: undeclared (footer)"),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
