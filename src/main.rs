//! `tweetpace` command line: fetch records and print them as JSON lines.

use clap::Parser;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use tweetpace::{
    BuildError, CancelToken, ConfigError, FetchCriteria, FetchOutcome, JsonLinesSink,
    PipelineBuilder, PipelineConfig, QuotaTracker, RecordSink, SinkError,
};

#[derive(Parser, Debug)]
#[command(
    name = "tweetpace",
    version,
    about = "Quota-aware fetching of posts from a rate-limited analytics API"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "TWEETPACE_CONFIG")]
    config: Option<PathBuf>,

    /// Endpoint id to fetch from
    #[arg(long, env = "TWEETPACE_ENDPOINT", default_value = "search")]
    endpoint: String,

    /// Search query; repeat for several independent chains
    #[arg(long = "query")]
    queries: Vec<String>,

    /// Number of records wanted
    #[arg(long, default_value_t = 100)]
    count: usize,

    /// Persisted quota state file (overrides the config)
    #[arg(long, env = "TWEETPACE_STATE")]
    state: Option<PathBuf>,

    /// Bearer token (overrides the config)
    #[arg(long, env = "TWEETPACE_BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,

    /// Concurrent chains (overrides the config)
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Give up and print what was gathered after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("failed to write records: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to start quota flush thread: {0}")]
    FlushThread(#[from] io::Error),
}

/// Owns the quota flush thread. Stopping, or dropping on an early return,
/// joins the thread after its final flush.
struct FlushGuard {
    worker: Option<(thread::JoinHandle<()>, mpsc::Sender<()>)>,
}

impl FlushGuard {
    fn start(tracker: Arc<QuotaTracker>) -> io::Result<Self> {
        Ok(Self {
            worker: Some(tracker.start_flush_thread()?),
        })
    }

    fn disabled() -> Self {
        Self { worker: None }
    }

    fn stop(&mut self) {
        if let Some((handle, stop)) = self.worker.take() {
            let _ = stop.send(());
            if handle.join().is_err() {
                warn!("Quota flush thread panicked");
            }
        }
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drains `outcome` into `sink`, then stops the flusher whether or not the
/// sink failed.
fn write_records(
    outcome: &mut FetchOutcome,
    sink: &mut dyn RecordSink,
    flusher: &mut FlushGuard,
) -> Result<usize, CliError> {
    let drained = outcome.drain_into(sink);
    flusher.stop();
    Ok(drained?)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tweetpace=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if cli.state.is_some() {
        config.state_path = cli.state.clone();
    }
    if cli.bearer_token.is_some() {
        config.api.bearer_token = cli.bearer_token.clone();
    }
    if let Some(max_in_flight) = cli.max_in_flight {
        config.pipeline.max_in_flight = max_in_flight;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let config = load_config(&cli)?;
    let persist = config.state_path.is_some();
    let coordinator = PipelineBuilder::new().config(config).try_build()?;

    let mut flusher = if persist {
        FlushGuard::start(coordinator.quota().clone())?
    } else {
        FlushGuard::disabled()
    };

    let cancel = match cli.timeout_secs {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl-C, stopping fetch");
                on_signal.cancel();
            }
            Err(err) => error!("Failed to listen for Ctrl-C: {}", err),
        }
    });

    let mut criteria = FetchCriteria::new(cli.endpoint.clone());
    for query in &cli.queries {
        criteria = criteria.with_query(query.clone());
    }

    let mut outcome = coordinator.fetch(&criteria, cli.count, &cancel).await;

    let written = {
        let stdout = io::stdout();
        let mut sink = JsonLinesSink::new(BufWriter::new(stdout.lock()));
        write_records(&mut outcome, &mut sink, &mut flusher)?
    };

    info!("Wrote {} records ({} skipped, {} pages)", written, outcome.skipped, outcome.pages);
    info!("Quota: {:?}", coordinator.quota().stats());
    info!("{}", coordinator.dispatcher().pacer().health().summary());

    Ok(match outcome.error {
        Some(err) => {
            error!("Fetch incomplete: {}", err);
            ExitCode::FAILURE
        }
        None => ExitCode::SUCCESS,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
