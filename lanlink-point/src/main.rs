use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lanlink_point::{Point, PointConfig, PointError};

const DEFAULT_PORT: u16 = 10002;

#[derive(Parser)]
#[command(name = "lanlink-point")]
#[command(about = "lanlink endpoint: couple a local TAP to a remote switch")]
struct Args {
    /// Switch address, host or host:port
    #[arg(long, default_value = "127.0.0.1:10002")]
    addr: String,

    /// Credentials as user:pass; the user part may be user@tenant
    #[arg(long, default_value = "guest:guest")]
    auth: String,

    /// Tenant to join when the username is unqualified
    #[arg(long)]
    network: Option<String>,

    /// Interface MTU, including the Ethernet header
    #[arg(long, default_value_t = 1514)]
    ifmtu: u32,

    /// Verbosity, 0 info, anything higher debug
    #[arg(long, default_value_t = 0)]
    verbose: i32,

    /// Connect over UDP instead of TCP
    #[arg(long)]
    udp: bool,

    /// Shared payload-encryption secret
    #[arg(long)]
    secret: Option<String>,
}

/// Append the default port when the address has none.
fn normalize_addr(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_PORT}")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose > 0 { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let Some((username, password)) = args.auth.split_once(':') else {
        eprintln!("--auth must be user:pass");
        return ExitCode::from(1);
    };

    let cfg = PointConfig {
        addr: normalize_addr(&args.addr),
        username: username.to_string(),
        password: password.to_string(),
        network: args.network,
        alias: std::env::var("HOSTNAME").ok(),
        mtu: args.ifmtu,
        udp: args.udp,
        secret: args.secret,
        timeout: Duration::from_secs(300),
    };

    let point = Point::new(cfg);
    let outcome = tokio::select! {
        outcome = point.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, leaving");
            Ok(())
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(PointError::Auth(reason)) => {
            error!(reason = %reason, "switch refused the login");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "point failed");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_addr;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr("switch.example"), "switch.example:10002");
        assert_eq!(normalize_addr("10.1.1.1:9000"), "10.1.1.1:9000");
    }
}
