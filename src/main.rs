//! Drawbridge demo node
//!
//! Run an echo server behind the admission gate.
//!
//! Usage:
//!   drawbridge --serve                         # Run with library defaults (24 h bans)
//!   drawbridge --serve --demo                  # Short bans, for poking at the gate
//!   drawbridge --serve --listen 0.0.0.0:9000   # Custom listen address

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

use drawbridge::{
    AdmissionGate, BoxedConn, RateLimitConfig, RateLimiter, Server, ServerConfig,
};

fn print_usage() {
    println!("Drawbridge demo node v0.1.0");
    println!();
    println!("Usage:");
    println!("  drawbridge --serve                         Run an echo server behind the gate");
    println!("  drawbridge --serve --demo                  Use short bans (1 minute)");
    println!("  drawbridge --serve --listen <ADDR>         Listen address (default 127.0.0.1:9000)");
    println!();
    println!("Options:");
    println!("  --serve, -s            Run in serve mode (required)");
    println!("  --listen <ADDR>        Listen address");
    println!("  --rate <N>             Connections per source IP per second (default 10)");
    println!("  --demo                 1-minute bans instead of the 24-hour default");
    println!("  --help, -h             Show this help");
}

async fn echo(mut conn: BoxedConn) {
    let mut buf = [0u8; 1024];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if conn.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    let show_help = args.iter().any(|a| a == "--help" || a == "-h");
    let serve_mode = args.iter().any(|a| a == "--serve" || a == "-s");
    let demo_mode = args.iter().any(|a| a == "--demo");

    let listen: String = args
        .windows(2)
        .find(|w| w[0] == "--listen")
        .map(|w| w[1].clone())
        .unwrap_or_else(|| "127.0.0.1:9000".to_string());

    let rate: Option<i64> = args
        .windows(2)
        .find(|w| w[0] == "--rate")
        .and_then(|w| w[1].parse().ok());

    if show_help || !serve_mode {
        print_usage();
        return;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut limit_config = RateLimitConfig::default();
    if demo_mode {
        limit_config = limit_config.with_ban_duration(Duration::from_secs(60));
    }
    if let Some(rate) = rate {
        limit_config = limit_config.with_rate_per_sec(rate);
    }

    let limiter = Arc::new(RateLimiter::with_config(limit_config));
    let gate = Arc::new(AdmissionGate::new(limiter.clone()));

    let config = ServerConfig::new().with_middleware(gate);
    let server = match Server::new(listen.clone(), echo, config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("Invalid configuration: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = server.start().await {
        eprintln!("Failed to start: {}", err);
        std::process::exit(1);
    }
    println!("Echoing on {} (ctrl-c to stop)", listen);

    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");

    if let Err(err) = server.stop_with_timeout(Duration::from_secs(10)).await {
        eprintln!("Shutdown incomplete: {}", err);
    }
    limiter.stop().await;
}
