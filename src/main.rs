use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use dredge::dht::{DhtConfig, DhtService, ObservationQueue};
use dredge::peer::LeechConfig;
use dredge::persistence::open_database;
use dredge::sink::{Sink, SinkConfig};

const OBSERVATION_QUEUE_CAPACITY: usize = 16384;

#[derive(Parser, Debug)]
#[command(
    name = "dredge",
    about = "Autonomous BitTorrent DHT crawler and metadata fetcher",
    version
)]
struct Args {
    /// Database URL (sqlite3://<path>)
    #[arg(long, default_value_t = default_database_url())]
    database: String,

    /// UDP endpoint for the DHT service (repeatable)
    #[arg(short = 'b', long = "bind", default_values_t = vec![default_bind()])]
    bind: Vec<SocketAddr>,

    /// Baseline outbound query interval in milliseconds
    #[arg(short = 'i', long, default_value_t = 1000)]
    interval: u64,

    /// Increase verbosity (-v: debug, -vv: trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:0".parse().unwrap()
}

fn default_database_url() -> String {
    let data_dir = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    format!(
        "sqlite3://{}",
        data_dir.join("dredge").join("database.sqlite3").display()
    )
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("dredge={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("dredge: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    // Startup failures (bad URL, unreachable database, bind errors) exit
    // nonzero; after this point nothing terminates the process but ctrl-c.
    let db = open_database(&args.database)?;
    info!(database = %args.database, "persistence ready");

    let observations = Arc::new(ObservationQueue::new(OBSERVATION_QUEUE_CAPACITY));

    let dht_config = DhtConfig {
        tick_interval: Duration::from_millis(args.interval.max(10)),
        ..DhtConfig::default()
    };

    let mut service_tasks = Vec::with_capacity(args.bind.len());
    for addr in &args.bind {
        let service =
            DhtService::bind(*addr, dht_config.clone(), Arc::clone(&observations)).await?;
        service_tasks.push(tokio::spawn(async move { service.run().await }));
    }

    let sink = Sink::new(
        Arc::clone(&db),
        LeechConfig::default(),
        SinkConfig::default(),
    );
    let sink_task = tokio::spawn(sink.run(Arc::clone(&observations)));

    info!(sockets = args.bind.len(), "dredge running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Stop admissions first, then the harvesters; aborting the sink aborts
    // its fetch workers with it.
    sink_task.abort();
    for task in service_tasks {
        task.abort();
    }
    db.close()?;

    Ok(())
}
