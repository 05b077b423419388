use anyhow::{Context, Result};
use caramba_db::StateStore;
use caramba_fleet::alerts::{AlertSink, FanoutAlertSink, LogAlertSink, TelegramAlertSink};
use caramba_fleet::panel::HttpPanelConnector;
use caramba_fleet::scheduler::Intervals;
use caramba_fleet::{FleetConfig, FleetMonitor, Scheduler, cli, http};
use clap::{ArgGroup, Parser, Subcommand};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "caramba-fleet")]
#[command(about = "Caramba VPN fleet monitor: health probes, node selection and failover", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the status API
    Serve,
    /// Probe every node once and apply failover
    Probe,
    /// Purge monitoring samples past retention
    Cleanup,
    /// Sync panel bindings and node loads with assignments
    Reconcile,
    /// Print the node table
    Status,
    /// Put a node into or out of maintenance
    #[command(group(ArgGroup::new("mode").required(true).args(["on", "off"])))]
    Maintenance {
        node_id: i64,
        #[arg(long)]
        on: bool,
        #[arg(long)]
        off: bool,
    },
    /// Ask the running server to clear a node's failover state
    Release { node_id: i64 },
    /// Install as a systemd service
    Install {
        /// Unit name, without the .service suffix
        #[arg(long, default_value = "caramba-fleet")]
        name: String,
        /// Extra units to start after, e.g. postgresql.service
        #[arg(long)]
        after: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        println!("Warning: failed to load .env file: {}", e);
    }
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "fleet.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "caramba_fleet=debug,caramba_db=info,sqlx=warn,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    if let Commands::Install { name, after } = &cli.command {
        return cli::install_service(name, after);
    }

    let config = FleetConfig::load().context("Failed to load fleet configuration")?;
    let pg = Arc::new(
        caramba_db::connect(&config.database_url, config.store_timeout())
            .await
            .context("Failed to open state store")?,
    );
    let store: Arc<dyn StateStore> = pg.clone();
    let connector = Arc::new(HttpPanelConnector::new(config.panel_timeout()));
    let alerts = build_alerts(&config);

    let monitor = Arc::new(FleetMonitor::new(&config, store, connector, alerts));
    monitor.load().await.context("Failed to load node registry")?;

    let outcome = run(cli.command, &config, monitor).await;
    pg.close().await;
    outcome
}

async fn run(command: Commands, config: &FleetConfig, monitor: Arc<FleetMonitor>) -> Result<()> {
    match command {
        Commands::Serve => serve(config, monitor).await?,
        Commands::Probe => {
            for report in monitor.probe_all_lanes(&CancellationToken::new()).await? {
                println!(
                    "lane {}: {} probed, {} failed, {} status change(s)",
                    report.lane, report.probed, report.failed, report.transitions
                );
            }
        }
        Commands::Cleanup => {
            let purged = monitor.run_cleanup().await?;
            println!("Purged {} samples.", purged);
        }
        Commands::Reconcile => {
            let report = monitor.run_reconcile().await?;
            println!(
                "{} node(s) synced, {} skipped, {} binding(s) restored, {} orphaned, {} load(s) corrected",
                report.nodes_synced,
                report.nodes_skipped,
                report.bindings_restored,
                report.orphaned_bindings,
                report.loads_corrected
            );
        }
        Commands::Status => cli::print_status(&monitor).await?,
        Commands::Maintenance { node_id, on, off: _ } => {
            cli::set_maintenance(&monitor, node_id, on).await?
        }
        Commands::Release { node_id } => cli::release(&monitor, node_id).await?,
        Commands::Install { name, after } => cli::install_service(&name, &after)?,
    }
    Ok(())
}

async fn serve(config: &FleetConfig, monitor: Arc<FleetMonitor>) -> Result<()> {
    tracing::info!("Fleet monitor starting, version {}", env!("CARGO_PKG_VERSION"));

    let scheduler = Scheduler::new(monitor.clone(), Intervals::from_config(config));
    scheduler.start();

    let shutdown = scheduler.cancellation();
    let state = http::AppState { monitor };
    let listen_addr = config.listen_addr.clone();
    let api_shutdown = shutdown.clone();
    let api = tokio::spawn(async move { http::serve(&listen_addr, state, api_shutdown).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }

    scheduler.stop().await;
    match api.await {
        Ok(Err(e)) => tracing::error!("Status API failed: {}", e),
        Err(e) => tracing::error!("Status API task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}

fn build_alerts(config: &FleetConfig) -> Arc<dyn AlertSink> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
    match &config.telegram_bot_token {
        Some(token) if !config.alert_chat_ids.is_empty() => {
            sinks.push(Arc::new(TelegramAlertSink::new(
                token,
                config.alert_chat_ids.clone(),
            )));
        }
        Some(_) => tracing::warn!("Telegram token set but no alert_chat_ids; Telegram alerts disabled"),
        None => {}
    }
    Arc::new(FanoutAlertSink::new(sinks))
}
