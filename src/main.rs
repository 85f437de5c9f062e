use anyhow::Context;
use clap::Parser;
use pg_cdc_receiver::postgres::{PgConnector, PgSlotClient};
use pg_cdc_receiver::{ChangeEvent, Config, Lsn, Receiver};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-cdc-receiver")]
#[command(about = "PostgreSQL logical replication change receiver", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, value_name = "X/X", help = "Start position, overriding the slot's")]
    start_lsn: Option<Lsn>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-cdc-receiver");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let start_lsn = match args.start_lsn {
        Some(lsn) => Some(lsn),
        None => config.start_lsn()?,
    };
    let settings = config.receiver_settings()?;

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot = %settings.slot_name,
        plugin = %settings.plugin,
        format = %settings.format,
        start_lsn = ?start_lsn.map(|lsn| lsn.to_string()),
        "Configuration summary"
    );

    let params = config.connect_params();
    let receiver = Arc::new(Receiver::new(
        settings,
        PgConnector::new(params.clone()),
        PgSlotClient::new(&params),
    )?);

    let mut task = Arc::clone(&receiver).spawn(start_lsn, print_event);

    let result = tokio::select! {
        joined = &mut task => joined.context("Receiver task panicked")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C, stopping");
            receiver.stop();
            task.await.context("Receiver task panicked")?
        }
    };

    if config.slot.drop_on_exit {
        if receiver.destroy(config.destroy_timeout()).await {
            info!(slot = %config.slot.name, "Replication slot dropped");
        } else {
            warn!(slot = %config.slot.name, "Replication slot was not dropped");
        }
    } else {
        receiver.close().await;
    }

    result?;
    info!("pg-cdc-receiver stopped");
    Ok(())
}

/// Writes each event to stdout as one JSON line.
fn print_event(event: ChangeEvent) -> anyhow::Result<()> {
    let line = event.to_json()?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_cdc_receiver=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_cdc_receiver=info,warn"))
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
