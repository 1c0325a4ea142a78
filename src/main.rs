use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use ssrf_relay::fetch::TlsPolicy;
use ssrf_relay::server::{self, RelayConfig};

/// ssrf-relay — fetch arbitrary targets with relaxed TLS and report back as a chat-ops webhook.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ssrf-relay",
    version,
    about = "Fetch arbitrary targets with relaxed TLS and report the outcome as a chat-ops webhook envelope.",
    long_about = None
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8888")]
    bind: String,

    /// Total timeout for a single `/relay` fetch, in seconds.
    #[arg(long = "relay-timeout-secs", value_parser = clap::value_parser!(u64).range(1..), default_value_t = 10)]
    relay_timeout_secs: u64,

    /// Total timeout for each `/scan` target, in seconds.
    #[arg(long = "scan-timeout-secs", value_parser = clap::value_parser!(u64).range(1..), default_value_t = 3)]
    scan_timeout_secs: u64,

    /// Number of request records kept in memory.
    #[arg(long = "log-capacity", default_value_t = 100)]
    log_capacity: usize,

    /// Outbound certificate handling. `accept-invalid` skips certificate and hostname checks.
    #[arg(long = "tls-policy", value_enum, default_value_t = TlsPolicy::AcceptInvalid)]
    tls_policy: TlsPolicy,
}

impl From<Cli> for RelayConfig {
    fn from(cli: Cli) -> Self {
        RelayConfig {
            bind: cli.bind,
            relay_timeout: Duration::from_secs(cli.relay_timeout_secs),
            scan_timeout: Duration::from_secs(cli.scan_timeout_secs),
            log_capacity: cli.log_capacity,
            tls: cli.tls_policy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ssrf_relay=debug,tower_http=debug".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    println!("ssrf-relay configuration:");
    println!("  bind          : {}", cli.bind);
    println!("  relay timeout : {}s", cli.relay_timeout_secs);
    println!("  scan timeout  : {}s", cli.scan_timeout_secs);
    println!("  log capacity  : {}", cli.log_capacity);
    println!("  tls policy    : {:?}", cli.tls_policy);

    server::spawn_server(cli.into()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_config() {
        let cli = Cli::try_parse_from(["ssrf-relay"]).unwrap();
        let config: RelayConfig = cli.into();
        let default = RelayConfig::default();
        assert_eq!(config.relay_timeout, default.relay_timeout);
        assert_eq!(config.scan_timeout, default.scan_timeout);
        assert_eq!(config.tls, TlsPolicy::AcceptInvalid);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        assert!(Cli::try_parse_from(["ssrf-relay", "--relay-timeout-secs", "0"]).is_err());
        assert!(Cli::try_parse_from(["ssrf-relay", "--scan-timeout-secs", "0"]).is_err());
        assert!(Cli::try_parse_from(["ssrf-relay", "--scan-timeout-secs", "1"]).is_ok());
    }
}
