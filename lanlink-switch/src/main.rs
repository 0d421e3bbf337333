use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use lanlink_switch::config::SwitchConfig;
use lanlink_switch::logring::{LogRing, RingLayer};
use lanlink_switch::Switch;

#[derive(Parser)]
#[command(name = "lanlink-switch")]
#[command(about = "lanlink virtual switch: tenant bridges for remote endpoints")]
struct Args {
    /// Configuration directory (switch.json, network/*.json, token)
    #[arg(long = "conf:dir", default_value = "/etc/lanlink")]
    conf_dir: PathBuf,

    /// Log verbosity: 10 debug, 20 info, 30 warn, 40 error
    #[arg(long = "log:level")]
    log_level: Option<i32>,
}

fn level_directive(level: i32) -> &'static str {
    if level <= 10 {
        "debug"
    } else if level <= 20 {
        "info"
    } else if level <= 30 {
        "warn"
    } else {
        "error"
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match SwitchConfig::load(&args.conf_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let ring = match cfg.log.file.as_deref() {
        Some(path) => match LogRing::with_file(std::path::Path::new(path)) {
            Ok(ring) => ring,
            Err(e) => {
                eprintln!("cannot open log file {path}: {e}");
                LogRing::new()
            }
        },
        None => LogRing::new(),
    };

    let level = args.log_level.or(cfg.log.level).unwrap_or(20);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(RingLayer::new(ring.clone()))
        .init();

    match run(cfg, ring).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "switch failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cfg: SwitchConfig, ring: Arc<LogRing>) -> anyhow::Result<()> {
    info!(
        alias = %cfg.alias,
        listen = %cfg.listen,
        networks = cfg.networks.len(),
        "starting lanlink switch"
    );
    let switch = Switch::new(cfg, ring).await?;
    switch.start().await?;

    tokio::signal::ctrl_c().await?;
    switch.shutdown().await;
    Ok(())
}
