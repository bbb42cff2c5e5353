use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use seqstream_core::config::{self, EngineConfig};
use seqstream_core::progress::{self, ProgressEvent};
use seqstream_core::record::{ALLOWED_EXTENSIONS, InputBuffer, MediaType};
use seqstream_core::sink::{DirectorySink, deliver_all};
use seqstream_core::telemetry::logging::{self, LogConfig, LogLevel};
use seqstream_core::transport::{HttpTransport, Transport, WebSocketTransport};
use seqstream_core::Uploader;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "seqstream")]
#[command(about = "Stream FASTQ files through a remote read filter")]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "SEQSTREAM_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        global = true,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "SEQSTREAM_LOG_FILE",
        global = true,
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a FASTQ file or read pair and save the filtered output
    Upload(UploadArgs),
    /// Print the filter server's configuration
    Status {
        #[arg(long, env = "SEQSTREAM_SERVER", default_value = "127.0.0.1:5000")]
        server: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportChoice {
    Http,
    #[value(alias = "ws")]
    Websocket,
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// One FASTQ file, or the two files of a read pair
    #[arg(required = true, num_args = 1..=2)]
    files: Vec<PathBuf>,

    /// Filter server base URL
    #[arg(long, env = "SEQSTREAM_SERVER", default_value = "127.0.0.1:5000")]
    server: String,

    #[arg(long, value_enum, env = "SEQSTREAM_TRANSPORT", default_value = "http")]
    transport: TransportChoice,

    /// WebSocket endpoint; defaults to `<server>/socket`
    #[arg(long, env = "SEQSTREAM_SOCKET_URL")]
    socket_url: Option<String>,

    /// Concurrent senders (overrides SEQSTREAM_WORKERS)
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Chunk budget in sequence bytes; defaults to the server's buffer size
    #[arg(long, short = 'b')]
    budget: Option<u64>,

    #[arg(long, short = 'o', default_value = ".")]
    output_dir: PathBuf,

    /// Save outputs even when some partitions failed
    #[arg(long)]
    allow_partial: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;

    match cli.command {
        Command::Upload(args) => upload(args).await,
        Command::Status { server } => status(&server).await,
    }
}

async fn status(server: &str) -> Result<()> {
    let http = HttpTransport::new(config::parse_server_url(server)?)?;
    let status = http
        .server_status()
        .await
        .with_context(|| format!("failed to query {}", http.base_url()))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn upload(args: UploadArgs) -> Result<()> {
    let inputs = read_inputs(&args.files).await?;

    let base = config::parse_server_url(&args.server)?;
    let http = HttpTransport::new(base.clone())?;
    let budget = match args.budget {
        Some(budget) => budget,
        None => {
            http.server_status()
                .await
                .with_context(|| format!("failed to query server status at {base}"))?
                .buffer_size
        }
    };
    if budget == 0 {
        bail!("chunk budget must be positive");
    }

    let mut engine_config = EngineConfig::from_env()?;
    if let Some(workers) = args.workers {
        engine_config = engine_config.with_workers(workers);
    }

    let transport: Arc<dyn Transport> = match args.transport {
        TransportChoice::Http => Arc::new(http),
        TransportChoice::Websocket => {
            let url = match &args.socket_url {
                Some(raw) => Url::parse(raw).with_context(|| format!("invalid socket url {raw}"))?,
                None => config::websocket_url(&base)?,
            };
            let socket = WebSocketTransport::connect(&url)
                .await
                .with_context(|| format!("failed to connect to {url}"))?;
            Arc::new(socket)
        }
    };
    debug!(
        target = "seqstream::cli",
        transport = transport.kind().label(),
        budget,
        workers = engine_config.workers,
        "transport ready"
    );

    let (progress_sink, events) = progress::channel();
    let reporter = tokio::spawn(report_progress(events));
    let uploader = Uploader::new(transport, engine_config).with_progress(Arc::new(progress_sink));
    let result = uploader.upload(&inputs, budget).await;
    // Dropping the uploader closes the progress channel.
    drop(uploader);
    let _ = reporter.await;
    let report = result?;

    println!(
        "{}/{} reads kept.",
        report.kept(),
        report.outcome.records_processed
    );

    let failure = report.failure_summary();
    if let Some(summary) = &failure {
        if !args.allow_partial {
            bail!("upload incomplete, no output written: {summary}");
        }
        warn!(target = "seqstream::cli", "saving partial output: {summary}");
    }

    let sink = DirectorySink::new(&args.output_dir);
    deliver_all(&sink, &report.outputs).await?;
    for output in &report.outputs {
        println!("{}", args.output_dir.join(&output.filename).display());
    }

    match failure {
        Some(summary) => bail!("upload incomplete: {summary}"),
        None => Ok(()),
    }
}

async fn read_inputs(paths: &[PathBuf]) -> Result<Vec<InputBuffer>> {
    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        let name = file_name(path)?;
        let media_type = MediaType::declared_for(&name).with_context(|| {
            format!(
                "{name}: unsupported file type, expected one of {}",
                ALLOWED_EXTENSIONS.join(", ")
            )
        })?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        debug!(
            target = "seqstream::cli",
            file = %name,
            bytes = bytes.len(),
            media_type = media_type.as_mime(),
            "input loaded"
        );
        inputs.push(InputBuffer::new(name, media_type, bytes));
    }
    Ok(inputs)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

async fn report_progress(mut events: UnboundedReceiver<ProgressEvent>) {
    let mut total = 0usize;
    let mut sent = 0usize;
    let mut last_decile = 0usize;

    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::Started {
                context,
                total_records,
                partitions,
                budget_bytes,
            } => {
                total = total_records;
                info!(
                    target = "seqstream::cli",
                    context = %context,
                    total_records,
                    partitions,
                    budget_bytes,
                    "uploading"
                );
            }
            ProgressEvent::BatchAccepted { records, .. } => {
                sent += records.len();
                let decile = (sent * 10).checked_div(total).unwrap_or(10);
                if decile > last_decile {
                    last_decile = decile;
                    info!(target = "seqstream::cli", sent, total, "{}% sent", decile * 10);
                }
            }
            ProgressEvent::Counters(snapshot) => {
                debug!(
                    target = "seqstream::cli",
                    pending_bytes = snapshot.pending_bytes,
                    processed = snapshot.records_processed,
                    "server progress"
                );
            }
            ProgressEvent::Backoff { partition, delay } => {
                debug!(target = "seqstream::cli", ?partition, ?delay, "waiting on server");
            }
            ProgressEvent::Retrying { .. } | ProgressEvent::PartitionFailed { .. } => {}
            ProgressEvent::PartitionFinished {
                partition,
                records_sent,
            } => {
                debug!(target = "seqstream::cli", partition, records_sent, "partition done");
            }
            ProgressEvent::Closing => {
                info!(target = "seqstream::cli", "all reads sent; waiting for the filter to finish");
            }
            ProgressEvent::Finished {
                kept,
                records_processed,
            } => {
                info!(target = "seqstream::cli", kept, records_processed, "filtering finished");
            }
        }
    }
}
