use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::EngineConfig;
use ratewarden::ratelimit::{LimiterSet, RequestParts, SystemClock};

/// Replay requests from stdin through the configured rate limit policies.
///
/// Each input line is `<route> <method> <client_ip> [header=value ...]`;
/// each output line is the JSON decision for it.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Path to the YAML policy file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => {
            warn!("No policy file given, every request is unlimited");
            EngineConfig::default()
        }
    };

    let limiters: LimiterSet<RequestParts> =
        LimiterSet::from_config(&config, Arc::new(SystemClock))?;

    tokio::select! {
        result = replay(&limiters) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Ratewarden stopped");
    Ok(())
}

async fn replay(limiters: &LimiterSet<RequestParts>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let Some(request) = parse_request(&line) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Skipping malformed request line");
            }
            continue;
        };

        let output = match limiters.check(&request).await {
            Some(decision) => json!({
                "decision": decision.label(),
                "retry_after": decision.retry_after_secs(),
                "meta": decision.meta(),
            }),
            None => json!({
                "decision": "unlimited",
                "route": request.route,
                "method": request.method,
                "client_ip": request.client_ip,
            }),
        };

        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    Ok(())
}

fn parse_request(line: &str) -> Option<RequestParts> {
    let mut fields = line.split_whitespace();
    let route = fields.next()?;
    let method = fields.next()?;
    let client_ip = fields.next()?;

    let mut request = RequestParts::new(route, method, client_ip);
    for header in fields {
        if let Some((name, value)) = header.split_once('=') {
            request = request.with_header(name, value);
        }
    }
    Some(request)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratewarden::ratelimit::RequestInfo;

    #[test]
    fn test_parse_request_line() {
        let request = parse_request("/login POST 10.0.0.1 X-Api-Key=abc").unwrap();
        assert_eq!(request.route, "/login");
        assert_eq!(request.method, "POST");
        assert_eq!(request.client_ip, "10.0.0.1");
        assert_eq!(request.header("x-api-key"), Some("abc"));
    }

    #[test]
    fn test_parse_request_line_too_short() {
        assert!(parse_request("/login POST").is_none());
        assert!(parse_request("").is_none());
    }
}
