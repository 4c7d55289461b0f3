use anyhow::Context;
use clap::Parser;
use pg_change_notifier::delivery::EventCallback;
use pg_change_notifier::{ChangeEvent, ChangeNotifier, Config};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-change-notifier")]
#[command(about = "Relays PostgreSQL row changes to streaming clients and callbacks", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "notifier.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-change-notifier");
    info!("Loading configuration from {:?}", args.config);

    let mut config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("loading configuration");
        }
    };

    let attached = config.attach_callback(EventCallback::new(print_event));
    if attached == 0 {
        warn!("No callback delivery configured, events will not be printed");
    }

    info!(
        database_host = %config.database.host,
        database_port = %config.database.port,
        database_name = %config.database.database,
        schemas = ?config.tables.schemas,
        deliveries = ?config.delivery.iter().map(|d| d.method_name()).collect::<Vec<_>>(),
        batching = config.batching.enabled,
        "Configuration summary"
    );

    let mut notifier = ChangeNotifier::new(config)?;
    notifier.initialize().await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    notifier.stop().await;

    let stats = notifier.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

async fn print_event(event: ChangeEvent) -> pg_change_notifier::Result<()> {
    println!("{}", serde_json::to_string(&event)?);
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_change_notifier=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_change_notifier=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
