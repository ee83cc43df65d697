use anyhow::{Context, Result};
use bikestat_ingest::{run_consumer, IngestPipeline};
use bikestat_retention::{RetentionCollector, RetentionConfig};
use bikestat_storage::{QueryEngine, Store, StoreConfig};
use bikestat_transport::{FeedConfig, TcpSubscriber};
use bikestat_web::{AppState, WebConfig};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "bikestat")]
#[command(about = "Bike-share station history collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Subscribe to the snapshot feed and store changed readings.
    Collect {
        /// Feed endpoint, e.g. tcp://127.0.0.1:5555 (default: $ZMQ_ADDR)
        #[arg(short, long)]
        addr: Option<String>,
        /// Topic prefix to subscribe to (default: $ZMQ_TOPIC)
        #[arg(short, long)]
        topic: Option<String>,
    },
    /// Bring the database schema up to date and exit.
    Migrate,
    /// Serve the station history API.
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one retention cycle now and exit.
    Gc,
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("BIKESTAT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store_config = StoreConfig::from_env();

    match cli.command.unwrap_or(Commands::Collect {
        addr: None,
        topic: None,
    }) {
        Commands::Collect { addr, topic } => {
            let mut feed = FeedConfig::from_env();
            if let Some(addr) = addr {
                feed.endpoint = addr;
            }
            if let Some(topic) = topic {
                feed.topic = topic;
            }
            collect(&store_config, feed).await?;
        }
        Commands::Migrate => {
            let store = open_store(&store_config).await?;
            let version = store.schema_version().await?;
            store.close().await;
            println!("schema at version {version}");
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(WebConfig::from_env().port);
            let store = open_store(&store_config).await?;
            let state = AppState::new(QueryEngine::new(store.clone()));
            bikestat_web::serve(port, state, ctrl_c()).await?;
            store.close().await;
        }
        Commands::Gc => {
            let gc = RetentionConfig::from_env()?;
            let store = open_store(&store_config).await?;
            let (_stop_tx, mut stop) = watch::channel(false);
            let report = RetentionCollector::new(store.clone(), gc)
                .run_cycle_at(Utc::now(), &mut stop)
                .await?;
            store.close().await;
            println!(
                "gc complete: cutoff={} backlog={} deleted={}",
                report.cutoff, report.backlog, report.deleted
            );
        }
    }

    Ok(())
}

/// Open the store and apply pending migrations. A migration failure stops
/// the process before anything reads or writes.
async fn open_store(config: &StoreConfig) -> Result<Store> {
    Store::open_migrated(config)
        .await
        .with_context(|| format!("opening {}", config.path.display()))
}

async fn collect(store_config: &StoreConfig, feed: FeedConfig) -> Result<()> {
    let gc = RetentionConfig::from_env()?;
    let store = open_store(store_config).await?;
    let pipeline = IngestPipeline::start(store.clone())
        .await
        .context("warming up dedup cache")?;

    let collector = if gc.enabled {
        let own = Store::open(store_config)
            .await
            .context("opening retention store handle")?;
        Some(RetentionCollector::new(own, gc).spawn())
    } else {
        None
    };

    let mut subscriber = TcpSubscriber::new(&feed.endpoint, feed.topic.clone())?;
    info!(endpoint = %feed.endpoint, topic = %feed.topic, "collecting");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        ctrl_c().await;
        let _ = stop_tx.send(true);
    });

    let report = run_consumer(&pipeline, &mut subscriber, stop_rx).await;
    info!(
        messages = report.messages,
        changed = report.changed,
        failed = report.failed,
        "collector stopped"
    );

    if let Some(collector) = collector {
        collector.shutdown().await;
    }
    store.close().await;
    Ok(())
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
