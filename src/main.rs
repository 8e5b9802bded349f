use clap::Parser;
use serial_bridge::{BridgeConfig, ChromeDriver, SessionOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Relay a device's serial monitor from the web editor to stdout.
#[derive(Debug, Parser)]
#[command(name = "serial-bridge", version)]
struct Args {
    /// JSON configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    headful: bool,

    /// Log the session status every N seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    status_every: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("serial_bridge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = BridgeConfig::load(args.config.as_deref())?;
    if args.headful {
        config.browser.headless = false;
    }

    let bridge = Arc::new(SessionOrchestrator::new(ChromeDriver::new(), config));
    let mut events = bridge.subscribe();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(err) => warn!(error = %err, "Could not encode event"),
            }
        }
    });

    info!("Connecting to the web editor, this can take a while");
    let outcome = bridge.connect_outcome().await;
    if !outcome.success {
        error!(reason = %outcome.message, "Connect failed");
        bridge.disconnect_outcome().await;
        anyhow::bail!(outcome.message);
    }
    info!("{}", outcome.message);

    let reporter = (args.status_every > 0).then(|| {
        let bridge = Arc::clone(&bridge);
        let every = Duration::from_secs(args.status_every);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = bridge.status();
                info!(
                    state = ?report.state,
                    last_sample_at = ?report.last_sample_at,
                    events = report.events_published,
                    "Status"
                );
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    let outcome = bridge.disconnect_outcome().await;
    info!("{}", outcome.message);
    printer.abort();

    Ok(())
}
