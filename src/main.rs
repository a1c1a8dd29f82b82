mod config;
mod location;
mod naming;
mod notify;
mod probe;
mod process;
mod recovery;
mod signals;
mod watchdog;

use clap::Parser;
use config::WatchdogConfig;
use location::SqliteLocationStore;
use notify::{AlertChannel, AlertThrottler, LogChannel, WebhookChannel};
use probe::{HttpsStatusClient, Prober};
use process::{PsProcessTable, SignalTerminator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use watchdog::{Watchdog, WatchdogSettings};

/// How long alerts still in flight may delay exit.
const ALERT_FLUSH_TIMEOUT: Duration = Duration::from_secs(15);

/// Watches the next sibling instance of a fleet and kills it when it is
/// running but no longer answering, so its supervisor can restart it.
#[derive(Parser, Debug)]
#[command(name = "fleetwatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "fleetwatch.toml")]
    config: PathBuf,

    /// Run as the monitoring instance of the primary (forces checking on)
    #[arg(long)]
    monitor: bool,

    /// Run a single check cycle and exit
    #[arg(long)]
    once: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (probe attempts, candidate processes)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "fleetwatch=debug"
    } else if cli.quiet {
        "fleetwatch=warn"
    } else {
        "fleetwatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match WatchdogConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    let settings = WatchdogSettings::from_config(&config, cli.monitor, config::is_child_process());

    if cli.dry_run {
        println!("fleetwatch v{}", env!("CARGO_PKG_VERSION"));
        println!("{settings:#?}");
        println!(
            "own instance: {:?}",
            naming::own_instance_name(&settings.app_dir, &settings.project_name)
        );
        return;
    }

    let watchdog = match build_watchdog(&config, settings) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to start watchdog");
            std::process::exit(1);
        }
    };
    run(watchdog, &config, cli.once).await;
}

fn build_watchdog(
    config: &WatchdogConfig,
    settings: WatchdogSettings,
) -> Result<Watchdog, Box<dyn std::error::Error>> {
    let locations = Arc::new(SqliteLocationStore::open(&config.store.path)?);
    let client = Arc::new(HttpsStatusClient::new(
        config.instance.api_key.clone(),
        Duration::from_secs(config.check.api_probe_timeout_secs),
    )?);
    let prober = Prober::new(
        client,
        locations,
        location::local_hostname(),
        Duration::from_secs(config.check.api_probe_retry_delay_secs),
    );

    let channel: Arc<dyn AlertChannel> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(url.clone())?),
        None => {
            tracing::warn!("no notification webhook configured, alerts are only logged");
            Arc::new(LogChannel)
        }
    };
    let alerts = AlertThrottler::new(
        channel,
        Duration::from_secs(config.notify.cooldown_mins.saturating_mul(60)),
    )
    .suppressed(config.debug);

    Ok(Watchdog::new(
        settings,
        Arc::new(PsProcessTable),
        Arc::new(SignalTerminator),
        prober,
        alerts,
    ))
}

/// Call the watchdog every poll interval until shutdown. The watchdog gates
/// itself on its check interval, so polling more often is harmless.
async fn run(mut watchdog: Watchdog, config: &WatchdogConfig, once: bool) {
    tracing::info!("fleetwatch starting");
    if once {
        watchdog.process().await;
        watchdog.flush_alerts(ALERT_FLUSH_TIMEOUT).await;
        return;
    }

    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);
    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.check.poll_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => watchdog.process().await,
            _ = &mut shutdown => break,
        }
    }
    watchdog.flush_alerts(ALERT_FLUSH_TIMEOUT).await;
    tracing::info!("fleetwatch stopped");
}
